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

//! Map side of the remote shuffle.
//!
//! A [ShuffleMapOutputWriter] owns the output of one map task. It hands out
//! one [ShufflePartitionWriter] per reduce partition, in increasing partition
//! order. Each partition writer is opened exactly once, either as a byte
//! stream or as a channel bytes can be transferred into from a file. Nothing
//! is visible remotely until [ShuffleMapOutputWriter::commit_all_partitions]
//! succeeds; [ShuffleMapOutputWriter::abort] discards everything.

use std::fs::File;
use std::io::Write;

use async_trait::async_trait;
use log::warn;

use crate::block::ShuffleBlockId;
use crate::error::{Result, ShuffleError};

mod channel;
mod index;
mod map_output;

pub use channel::StreamTransferChannel;
pub use index::ShuffleIndex;
pub use map_output::RemoteMapOutputWriter;

/// Byte stream into one partition of a map output.
pub trait ShuffleStream: Write + Send {
    /// Finishes the partition. Does not close the storage shared with other
    /// partitions of the same map output.
    fn close(self: Box<Self>) -> Result<()>;
}

/// Sink bytes can be moved into straight from a file.
pub trait TransferrableChannel: Send {
    /// Copies `count` bytes starting at `position` of `source` into the
    /// partition, returning the number of bytes moved.
    ///
    /// Moving fewer than `count` bytes fails with
    /// [ShuffleError::PartialWrite].
    fn transfer_from(&mut self, source: &File, position: u64, count: u64) -> Result<u64>;

    /// Finishes the partition.
    fn close(self: Box<Self>) -> Result<()>;
}

/// Write handle for one (map task, reduce partition) pair.
pub trait ShufflePartitionWriter: Send {
    /// The block this writer produces
    fn block_id(&self) -> &ShuffleBlockId;

    /// Opens the partition as a byte stream. Fails with
    /// [ShuffleError::ProtocolViolation] if the partition was opened before.
    fn open_stream(&mut self) -> Result<Box<dyn ShuffleStream + '_>>;

    /// Opens the partition as a [TransferrableChannel]. Fails with
    /// [ShuffleError::ProtocolViolation] if the partition was opened before.
    ///
    /// The default implementation copies through [Self::open_stream].
    fn open_transferrable_channel(
        &mut self,
    ) -> Result<Box<dyn TransferrableChannel + '_>> {
        let block_id = self.block_id().clone();
        let stream = self.open_stream()?;
        Ok(Box::new(StreamTransferChannel::new(block_id, stream)))
    }

    /// Bytes persisted for this partition once its stream or channel was
    /// closed. May differ from the bytes written by the caller when the
    /// partition is encoded on the way to storage.
    fn num_bytes_written(&self) -> u64;
}

/// Result of a successful map output commit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MapOutputCommitMessage {
    /// Persisted length of every partition, zero for empty ones
    pub partition_lengths: Vec<u64>,
}

impl MapOutputCommitMessage {
    /// Total bytes persisted for the map task.
    pub fn total_bytes(&self) -> u64 {
        self.partition_lengths.iter().sum()
    }
}

/// Output of one map task across all reduce partitions.
#[async_trait]
pub trait ShuffleMapOutputWriter: Send {
    /// Returns the writer for `reduce_id`.
    ///
    /// Partitions must be requested in increasing order, each at most once,
    /// and only while the output is neither committed nor aborted.
    fn partition_writer(
        &mut self,
        reduce_id: usize,
    ) -> Result<Box<dyn ShufflePartitionWriter + '_>>;

    /// Makes every non-empty partition visible as a remote block and
    /// returns the persisted partition lengths.
    ///
    /// If a partition write failed earlier or an upload fails, the output
    /// is aborted and the error returned.
    async fn commit_all_partitions(&mut self) -> Result<MapOutputCommitMessage>;

    /// Discards all output written so far. No block becomes visible.
    fn abort(&mut self, cause: &ShuffleError) -> Result<()>;
}

/// Writes `partitions` through `writer` and commits the map output.
///
/// Each item pairs a reduce partition with its bytes, in increasing
/// partition order. Empty partitions are skipped. On any failure the output
/// is aborted and the failure returned.
pub async fn write_map_output<W, I, B>(
    writer: &mut W,
    partitions: I,
) -> Result<MapOutputCommitMessage>
where
    W: ShuffleMapOutputWriter + ?Sized,
    I: IntoIterator<Item = (usize, B)>,
    B: AsRef<[u8]>,
{
    for (reduce_id, data) in partitions {
        let data = data.as_ref();
        // an empty partition is left unopened, some codecs add framing even
        // to empty input
        if data.is_empty() {
            continue;
        }
        if let Err(e) = write_partition(writer, reduce_id, data) {
            if let Err(abort_err) = writer.abort(&e) {
                warn!("failed to abort map output after {e}: {abort_err}");
            }
            return Err(e);
        }
    }
    writer.commit_all_partitions().await
}

fn write_partition<W: ShuffleMapOutputWriter + ?Sized>(
    writer: &mut W,
    reduce_id: usize,
    data: &[u8],
) -> Result<u64> {
    let mut partition = writer.partition_writer(reduce_id)?;
    let mut stream = partition.open_stream()?;
    stream.write_all(data)?;
    stream.close()?;
    Ok(partition.num_bytes_written())
}
