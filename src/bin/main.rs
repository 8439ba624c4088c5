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

//! Remote shuffle benchmark.
//!
//! Writes synthetic map outputs to a store, reads every reduce partition
//! back through the fetch iterator and verifies the bytes.
//!
//! Usage:
//!   cargo run --release --bin remote-shuffle-bench -- --help
//!   cargo run --release --bin remote-shuffle-bench -- --store-url file:///tmp/shuffle --maps 8

use std::sync::Arc;
use std::time::{Duration, Instant};
use std::{env, io};

use ballista_remote_shuffle::block::blocks_for_reduce_partition;
use ballista_remote_shuffle::client::ObjectStoreBlockClient;
use ballista_remote_shuffle::config::{
    LogRotationPolicy, REMOTE_SHUFFLE_COMPRESSION, REMOTE_SHUFFLE_LOCAL_DIR,
    REMOTE_SHUFFLE_MAX_BYTES_IN_FLIGHT, REMOTE_SHUFFLE_READ_AHEAD_BLOCKS,
    REMOTE_SHUFFLE_STORE_URL, REMOTE_SHUFFLE_UPLOAD_PARALLELISM, RemoteShuffleConfig,
};
use ballista_remote_shuffle::error::{Result, ShuffleError};
use ballista_remote_shuffle::metrics::default_metrics_collector;
use ballista_remote_shuffle::shuffle_reader::ShuffleFetchIteratorFactory;
use ballista_remote_shuffle::shuffle_writer::{
    RemoteMapOutputWriter, write_map_output,
};
use ballista_remote_shuffle::{REMOTE_SHUFFLE_VERSION, print_version};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

const SHUFFLE_ID: usize = 0;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "remote-shuffle-bench",
    version = REMOTE_SHUFFLE_VERSION,
    about = "Writes and reads back a synthetic shuffle through a remote store"
)]
struct Config {
    #[arg(
        long,
        default_value_t = String::from("memory:///remote-shuffle-bench"),
        help = "Store the shuffle blocks are written to: file:///dir, memory:///prefix or s3://bucket/prefix"
    )]
    store_url: String,
    #[arg(long, default_value_t = 4, help = "Number of map tasks")]
    maps: usize,
    #[arg(long, default_value_t = 16, help = "Number of reduce partitions")]
    partitions: usize,
    #[arg(
        long,
        default_value_t = 256 * 1024,
        help = "Bytes each map task writes per reduce partition"
    )]
    block_size: usize,
    #[arg(long, default_value_t = 8, help = "Fetches kept in flight per reduce task")]
    read_ahead_blocks: usize,
    #[arg(
        long,
        default_value_t = 48 * 1024 * 1024,
        help = "Bytes of fetched but unconsumed blocks per reduce task"
    )]
    max_bytes_in_flight: u64,
    #[arg(long, default_value_t = 4, help = "Concurrent uploads per map output commit")]
    upload_parallelism: usize,
    #[arg(
        long,
        default_value_t = String::from("lz4"),
        help = "Partition compression, possible values: lz4, none"
    )]
    compression: String,
    #[arg(long, help = "Directory for staging files. Default: system temp dir")]
    local_dir: Option<String>,
    #[arg(long, help = "Log dir. If not set, logs are written to stdout")]
    log_dir: Option<String>,
    #[arg(
        long,
        default_value_t = true,
        help = "Enable print thread ids and names in log file."
    )]
    print_thread_info: bool,
    #[arg(
        long,
        default_value_t = String::from("INFO,ballista_remote_shuffle=INFO"),
        help = "special log level for sub mod. For example INFO,ballista_remote_shuffle=DEBUG"
    )]
    log_level_setting: String,
    #[arg(
        long,
        value_enum,
        default_value_t = LogRotationPolicy::Daily,
        help = "Tracing log rotation policy, possible values: minutely, hourly, daily, never. Default: daily"
    )]
    log_rotation_policy: LogRotationPolicy,
}

impl Config {
    fn shuffle_config(&self) -> Result<RemoteShuffleConfig> {
        let mut config = RemoteShuffleConfig::default();
        config.set(REMOTE_SHUFFLE_STORE_URL, &self.store_url)?;
        config.set(
            REMOTE_SHUFFLE_READ_AHEAD_BLOCKS,
            &self.read_ahead_blocks.to_string(),
        )?;
        config.set(
            REMOTE_SHUFFLE_MAX_BYTES_IN_FLIGHT,
            &self.max_bytes_in_flight.to_string(),
        )?;
        config.set(
            REMOTE_SHUFFLE_UPLOAD_PARALLELISM,
            &self.upload_parallelism.to_string(),
        )?;
        config.set(REMOTE_SHUFFLE_COMPRESSION, &self.compression)?;
        if let Some(local_dir) = &self.local_dir {
            config.set(REMOTE_SHUFFLE_LOCAL_DIR, local_dir)?;
        }
        Ok(config)
    }
}

fn main() -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_io()
        .enable_time()
        .build()?;

    runtime.block_on(inner())
}

async fn inner() -> Result<()> {
    // parse options
    let opt = Config::parse();

    let rust_log = env::var(EnvFilter::DEFAULT_ENV);
    let log_filter = EnvFilter::new(rust_log.unwrap_or(opt.log_level_setting.clone()));

    let tracing = tracing_subscriber::fmt()
        .with_ansi(false)
        .with_thread_names(opt.print_thread_info)
        .with_thread_ids(opt.print_thread_info)
        .with_writer(io::stdout)
        .with_env_filter(log_filter);

    // File layer
    if let Some(log_dir) = &opt.log_dir {
        let log_file_name_prefix = format!("remote_shuffle_bench_{}", std::process::id());

        let log_file = match opt.log_rotation_policy {
            LogRotationPolicy::Minutely => {
                tracing_appender::rolling::minutely(log_dir, &log_file_name_prefix)
            }
            LogRotationPolicy::Hourly => {
                tracing_appender::rolling::hourly(log_dir, &log_file_name_prefix)
            }
            LogRotationPolicy::Daily => {
                tracing_appender::rolling::daily(log_dir, &log_file_name_prefix)
            }
            LogRotationPolicy::Never => {
                tracing_appender::rolling::never(log_dir, &log_file_name_prefix)
            }
        };

        tracing.with_writer(log_file).init();
    } else {
        tracing.init();
    }

    print_version();
    let config = opt.shuffle_config()?;
    let store_url = config.store_url().unwrap_or_else(|| opt.store_url.clone());
    let client = Arc::new(ObjectStoreBlockClient::try_from_url(&store_url)?);
    let metrics = default_metrics_collector()?;

    info!(
        "shuffling {} maps x {} partitions x {} bytes through {store_url}, compression {:?}",
        opt.maps,
        opt.partitions,
        opt.block_size,
        config.compression()
    );

    // map stage
    let start = Instant::now();
    let mut tasks = Vec::with_capacity(opt.maps);
    for map_id in 0..opt.maps as u64 {
        let client = client.clone();
        let metrics = metrics.clone();
        let write_options = config.write_options();
        let partitions = opt.partitions;
        let block_size = opt.block_size;
        tasks.push(tokio::spawn(async move {
            let mut writer = RemoteMapOutputWriter::try_new(
                SHUFFLE_ID,
                map_id,
                partitions,
                client,
                &write_options,
            )?
            .with_metrics(metrics);
            let data = (0..partitions)
                .map(|reduce_id| (reduce_id, generate_block(map_id, reduce_id, block_size)));
            let committed = write_map_output(&mut writer, data).await?;
            Ok::<_, ShuffleError>((map_id, committed.partition_lengths))
        }));
    }
    let mut map_outputs = Vec::with_capacity(opt.maps);
    for task in tasks {
        map_outputs.push(task.await??);
    }
    let write_time = start.elapsed();
    let persisted: u64 = map_outputs.iter().flat_map(|(_, l)| l.iter()).sum();
    let logical = (opt.maps * opt.partitions * opt.block_size) as u64;
    info!(
        "map stage wrote {logical} bytes ({persisted} bytes persisted) in {write_time:?}, {:.2} MB/s",
        throughput(logical, write_time)
    );

    // reduce stage
    let start = Instant::now();
    let factory = ShuffleFetchIteratorFactory::new(client.clone(), config.fetch_options())
        .with_metrics(metrics.clone());
    let codec = config.compression().codec();
    let mut fetched = 0u64;
    for reduce_id in 0..opt.partitions {
        let blocks = blocks_for_reduce_partition(
            SHUFFLE_ID,
            reduce_id,
            map_outputs.iter().map(|(map_id, l)| (*map_id, l.as_slice())),
        );
        let mut iter = factory.create(blocks)?;
        while let Some(next) = iter.next().await {
            let (block_id, bytes) = next?;
            fetched += bytes.len() as u64;
            let decoded = codec.decode(bytes)?;
            if decoded.as_ref()
                != generate_block(block_id.map_id, reduce_id, opt.block_size).as_slice()
            {
                iter.close().await;
                return Err(ShuffleError::General(format!(
                    "block {block_id} does not match the bytes written"
                )));
            }
        }
    }
    let read_time = start.elapsed();
    info!(
        "reduce stage fetched {fetched} bytes in {read_time:?}, {:.2} MB/s",
        throughput(logical, read_time)
    );

    if let Some((buffer, _)) = metrics.gather_metrics()? {
        info!("{}", String::from_utf8_lossy(&buffer));
    }

    Ok(())
}

/// Deterministic, mildly compressible block content.
fn generate_block(map_id: u64, reduce_id: usize, block_size: usize) -> Vec<u8> {
    let seed = map_id as usize * 31 + reduce_id * 7;
    (0..block_size)
        .map(|i| ((seed + i / 4) % 251) as u8)
        .collect()
}

fn throughput(bytes: u64, elapsed: Duration) -> f64 {
    bytes as f64 / 1024.0 / 1024.0 / elapsed.as_secs_f64().max(f64::EPSILON)
}
