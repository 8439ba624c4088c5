// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

use std::collections::HashMap;
use std::sync::Arc;

use ballista_remote_shuffle::block::{ShuffleBlockId, blocks_for_reduce_partition};
use ballista_remote_shuffle::client::ObjectStoreBlockClient;
use ballista_remote_shuffle::config::{
    REMOTE_SHUFFLE_COMPRESSION, REMOTE_SHUFFLE_LOCAL_DIR, REMOTE_SHUFFLE_READ_AHEAD_BLOCKS,
    RemoteShuffleConfig,
};
use ballista_remote_shuffle::error::{Result, ShuffleError};
use ballista_remote_shuffle::shuffle_reader::ShuffleFetchIteratorFactory;
use ballista_remote_shuffle::shuffle_writer::{
    RemoteMapOutputWriter, ShuffleMapOutputWriter, write_map_output,
};
use futures::StreamExt;
use object_store::ObjectStore;
use object_store::memory::InMemory;
use object_store::path::Path;
use tempfile::TempDir;

const SHUFFLE_ID: usize = 3;
const MAPS: u64 = 3;
const PARTITIONS: usize = 4;

fn partition_data(map_id: u64, reduce_id: usize) -> Vec<u8> {
    // map 1 leaves partition 2 empty
    if map_id == 1 && reduce_id == 2 {
        return vec![];
    }
    format!("map {map_id} reduce {reduce_id} ")
        .repeat(50 + reduce_id * 10)
        .into_bytes()
}

fn config(dir: &TempDir, compression: &str) -> Result<RemoteShuffleConfig> {
    RemoteShuffleConfig::with_settings(HashMap::from([
        (
            REMOTE_SHUFFLE_LOCAL_DIR.to_string(),
            dir.path().display().to_string(),
        ),
        (REMOTE_SHUFFLE_COMPRESSION.to_string(), compression.to_string()),
        (REMOTE_SHUFFLE_READ_AHEAD_BLOCKS.to_string(), "2".to_string()),
    ]))
}

async fn round_trip(compression: &str) -> Result<()> {
    let dir = TempDir::new()?;
    let config = config(&dir, compression)?;
    let store = Arc::new(InMemory::new());
    let client = Arc::new(ObjectStoreBlockClient::new(
        store.clone(),
        Path::from("jobs/round-trip"),
    ));

    let mut map_outputs = vec![];
    for map_id in 0..MAPS {
        let mut writer = RemoteMapOutputWriter::try_new(
            SHUFFLE_ID,
            map_id,
            PARTITIONS,
            client.clone(),
            &config.write_options(),
        )?;
        let committed = write_map_output(
            &mut writer,
            (0..PARTITIONS).map(|reduce_id| (reduce_id, partition_data(map_id, reduce_id))),
        )
        .await?;
        assert_eq!(committed.partition_lengths.len(), PARTITIONS);
        map_outputs.push((map_id, committed.partition_lengths));
    }

    // the empty partition is never uploaded
    let stored = store.list(None).collect::<Vec<_>>().await.len();
    assert_eq!(stored, MAPS as usize * PARTITIONS - 1);
    assert_eq!(map_outputs[1].1[2], 0);

    let codec = config.compression().codec();
    let factory = ShuffleFetchIteratorFactory::new(client, config.fetch_options());
    for reduce_id in 0..PARTITIONS {
        let blocks = blocks_for_reduce_partition(
            SHUFFLE_ID,
            reduce_id,
            map_outputs.iter().map(|(m, l)| (*m, l.as_slice())),
        );
        let expected_maps: Vec<u64> = blocks.iter().map(|b| b.block_id.map_id).collect();

        let mut iter = factory.create(blocks)?;
        let mut seen = vec![];
        while let Some(next) = iter.next().await {
            let (block_id, bytes) = next?;
            assert_eq!(block_id.reduce_id, reduce_id);
            let decoded = codec.decode(bytes)?;
            assert_eq!(
                decoded.as_ref(),
                partition_data(block_id.map_id, reduce_id).as_slice()
            );
            seen.push(block_id.map_id);
        }
        assert_eq!(seen, expected_maps);
        iter.close().await;
    }
    Ok(())
}

#[tokio::test]
async fn round_trip_uncompressed() -> Result<()> {
    round_trip("none").await
}

#[tokio::test]
async fn round_trip_lz4() -> Result<()> {
    round_trip("lz4").await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn aborted_map_output_is_invisible() -> Result<()> {
    let dir = TempDir::new()?;
    let config = config(&dir, "lz4")?;
    let store = Arc::new(InMemory::new());
    let client = Arc::new(ObjectStoreBlockClient::new(store.clone(), Path::from("aborted")));

    let mut writer =
        RemoteMapOutputWriter::try_new(SHUFFLE_ID, 0, 2, client.clone(), &config.write_options())?;
    {
        let mut partition = writer.partition_writer(0)?;
        let mut stream = partition.open_stream()?;
        std::io::Write::write_all(&mut stream, b"never visible")?;
        stream.close()?;
    }
    writer.abort(&ShuffleError::General("executor lost".to_string()))?;

    assert_eq!(store.list(None).collect::<Vec<_>>().await.len(), 0);
    assert_eq!(std::fs::read_dir(dir.path())?.count(), 0);

    let factory = ShuffleFetchIteratorFactory::new(client, config.fetch_options());
    let mut iter = factory.create(vec![
        ballista_remote_shuffle::ShuffleBlockInfo::new(ShuffleBlockId::new(SHUFFLE_ID, 0, 0), 13),
    ])?;
    assert!(matches!(
        iter.next().await,
        Some(Err(ShuffleError::RemoteIo(..)))
    ));
    assert!(!iter.has_next());
    Ok(())
}
