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

//! Map output writer staging all partitions of a map task in one local
//! file and uploading them as separate blocks on commit.

use std::fs::{self, File};
use std::io::{self, BufWriter, SeekFrom, Write};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt, stream};
use log::{debug, info, warn};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use uuid::Uuid;

use crate::block::ShuffleBlockId;
use crate::client::RemoteBlockClient;
use crate::codec::{BlockCodec, BlockEncoder};
use crate::config::WriteOptions;
use crate::error::{BoxedCause, Result, ShuffleError, protocol_violation};
use crate::metrics::{NoopMetricsCollector, ShuffleMetricsCollector};
use crate::shuffle_writer::channel::SpillFileChannel;
use crate::shuffle_writer::{
    MapOutputCommitMessage, ShuffleIndex, ShuffleMapOutputWriter,
    ShufflePartitionWriter, ShuffleStream, TransferrableChannel,
};

/// Local file holding the partitions of one map task back to back.
struct SpillFile {
    path: PathBuf,
    writer: BufWriter<File>,
    /// Bytes handed to `writer` so far
    written: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum PartitionState {
    #[default]
    Unopened,
    Open,
    Closed,
}

/// Why a partition cannot be committed.
#[derive(Debug)]
enum PartitionFailure {
    PartialWrite { expected: u64, actual: u64 },
    Write(BoxedCause),
}

/// Per partition bookkeeping of a map output.
#[derive(Debug, Default)]
pub(super) struct PartitionRecord {
    length: u64,
    state: PartitionState,
    failure: Option<PartitionFailure>,
}

impl PartitionRecord {
    fn open(&mut self, block_id: &ShuffleBlockId) -> Result<()> {
        match self.state {
            PartitionState::Unopened => {
                self.state = PartitionState::Open;
                Ok(())
            }
            _ => Err(protocol_violation(format!(
                "partition writer of block {block_id} was already opened"
            ))),
        }
    }

    pub(super) fn close(&mut self, persisted: u64) {
        self.length = persisted;
        self.state = PartitionState::Closed;
    }

    /// Remembers the first failure, which fails the commit.
    pub(super) fn fail(&mut self, e: &ShuffleError) {
        if self.failure.is_none() {
            self.failure = Some(match e {
                ShuffleError::PartialWrite {
                    expected, actual, ..
                } => PartitionFailure::PartialWrite {
                    expected: *expected,
                    actual: *actual,
                },
                ShuffleError::IoError(e) => PartitionFailure::Write(Box::new(
                    io::Error::new(e.kind(), e.to_string()),
                )),
                other => PartitionFailure::Write(other.to_string().into()),
            });
        }
    }

    fn take_failure(&mut self, block_id: ShuffleBlockId) -> Option<ShuffleError> {
        self.failure.take().map(|failure| match failure {
            PartitionFailure::PartialWrite { expected, actual } => {
                ShuffleError::PartialWrite {
                    block_id,
                    expected,
                    actual,
                }
            }
            PartitionFailure::Write(cause) => ShuffleError::RemoteIo(block_id, cause),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputState {
    Active,
    Committed,
    Aborted,
}

/// [ShuffleMapOutputWriter] staging partitions in a local file and
/// uploading each non-empty partition as one block through a
/// [RemoteBlockClient] on commit.
pub struct RemoteMapOutputWriter {
    shuffle_id: usize,
    map_id: u64,
    client: Arc<dyn RemoteBlockClient>,
    codec: Arc<dyn BlockCodec>,
    upload_parallelism: usize,
    metrics: Arc<dyn ShuffleMetricsCollector>,
    spill: Option<SpillFile>,
    partitions: Vec<PartitionRecord>,
    next_partition: usize,
    state: OutputState,
}

impl RemoteMapOutputWriter {
    /// Creates the writer for map task `map_id` of shuffle `shuffle_id`,
    /// producing `num_partitions` reduce partitions. The staging file is
    /// created in `options.local_dir`.
    pub fn try_new(
        shuffle_id: usize,
        map_id: u64,
        num_partitions: usize,
        client: Arc<dyn RemoteBlockClient>,
        options: &WriteOptions,
    ) -> Result<Self> {
        fs::create_dir_all(&options.local_dir)?;
        let path = options.local_dir.join(format!(
            "shuffle_{shuffle_id}_{map_id}_{}.staging",
            Uuid::new_v4()
        ));
        let file = File::create(&path)?;
        debug!(
            "staging map output {map_id} of shuffle {shuffle_id} in {}",
            path.display()
        );

        Ok(Self {
            shuffle_id,
            map_id,
            client,
            codec: options.codec.clone(),
            upload_parallelism: options.upload_parallelism.max(1),
            metrics: Arc::new(NoopMetricsCollector::default()),
            spill: Some(SpillFile {
                path,
                writer: BufWriter::new(file),
                written: AtomicU64::new(0),
            }),
            partitions: (0..num_partitions)
                .map(|_| PartitionRecord::default())
                .collect(),
            next_partition: 0,
            state: OutputState::Active,
        })
    }

    /// Records write metrics into `metrics`.
    pub fn with_metrics(mut self, metrics: Arc<dyn ShuffleMetricsCollector>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Location of the staging file, until it is released by commit or abort.
    pub fn staging_path(&self) -> Option<&Path> {
        self.spill.as_ref().map(|spill| spill.path.as_path())
    }

    fn check_active(&self, action: &str) -> Result<()> {
        let state = match self.state {
            OutputState::Active => return Ok(()),
            OutputState::Committed => "committed",
            OutputState::Aborted => "aborted",
        };
        Err(protocol_violation(format!(
            "cannot {action} map output {} of shuffle {}, it was already {state}",
            self.map_id, self.shuffle_id
        )))
    }

    /// Closes and removes the staging file, at most once.
    fn discard_staging(&mut self) {
        if let Some(spill) = self.spill.take() {
            let SpillFile { path, writer, .. } = spill;
            drop(writer);
            if let Err(e) = fs::remove_file(&path) {
                warn!("failed to remove staging file {}: {e}", path.display());
            }
        }
    }

    async fn upload_all(&mut self) -> Result<MapOutputCommitMessage> {
        for (reduce_id, record) in self.partitions.iter_mut().enumerate() {
            let block_id = ShuffleBlockId::new(self.shuffle_id, self.map_id, reduce_id);
            if let Some(e) = record.take_failure(block_id) {
                return Err(e);
            }
        }

        let (path, staged) = {
            let spill = self.spill.as_mut().ok_or_else(|| {
                ShuffleError::Internal("staging file already released".to_string())
            })?;
            spill.writer.flush()?;
            (spill.path.clone(), spill.written.load(Ordering::SeqCst))
        };

        let lengths: Vec<u64> = self.partitions.iter().map(|p| p.length).collect();
        let index = ShuffleIndex::from_lengths(&lengths);
        if index.total_length() != staged {
            return Err(ShuffleError::Internal(format!(
                "partition lengths add up to {} bytes but {staged} bytes were staged",
                index.total_length()
            )));
        }

        let mut uploads = vec![];
        for (reduce_id, length) in lengths.iter().enumerate() {
            if *length > 0 {
                let block_id = ShuffleBlockId::new(self.shuffle_id, self.map_id, reduce_id);
                uploads.push((block_id, index.partition_range(reduce_id)?));
            }
        }
        let block_ids: Vec<ShuffleBlockId> =
            uploads.iter().map(|(block_id, _)| block_id.clone()).collect();

        let client = self.client.clone();
        let uploaded = stream::iter(uploads.into_iter().map(|(block_id, range)| {
            upload_block(client.clone(), path.clone(), block_id, range)
        }))
        .buffer_unordered(self.upload_parallelism)
        .try_collect::<Vec<_>>()
        .await;

        if let Err(e) = uploaded {
            // blocks still in flight were cancelled with the stream, they may
            // or may not have landed
            delete_blocks(self.client.clone(), &block_ids, self.upload_parallelism)
                .await;
            return Err(e);
        }

        Ok(MapOutputCommitMessage {
            partition_lengths: lengths,
        })
    }
}

async fn read_range(path: &Path, range: Range<u64>) -> io::Result<Bytes> {
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(SeekFrom::Start(range.start)).await?;
    let mut buf = vec![0u8; (range.end - range.start) as usize];
    file.read_exact(&mut buf).await?;
    Ok(Bytes::from(buf))
}

async fn upload_block(
    client: Arc<dyn RemoteBlockClient>,
    path: PathBuf,
    block_id: ShuffleBlockId,
    range: Range<u64>,
) -> Result<ShuffleBlockId> {
    let expected = range.end - range.start;
    let data = read_range(&path, range).await?;
    let written = client
        .put(&block_id, data)
        .await
        .map_err(|e| e.with_block(&block_id))?;
    if written != expected {
        return Err(ShuffleError::PartialWrite {
            block_id,
            expected,
            actual: written,
        });
    }
    debug!("uploaded block {block_id}, {written} bytes");
    Ok(block_id)
}

/// Best-effort removal of blocks of a failed commit.
async fn delete_blocks(
    client: Arc<dyn RemoteBlockClient>,
    block_ids: &[ShuffleBlockId],
    parallelism: usize,
) {
    let results = stream::iter(block_ids.to_vec())
        .map(|block_id| {
            let client = client.clone();
            async move {
                let result = client.delete(&block_id).await;
                (block_id, result)
            }
        })
        .buffer_unordered(parallelism)
        .collect::<Vec<_>>()
        .await;
    for (block_id, result) in results {
        if let Err(e) = result {
            warn!("failed to delete block {block_id} of aborted map output: {e}");
        }
    }
}

#[async_trait]
impl ShuffleMapOutputWriter for RemoteMapOutputWriter {
    fn partition_writer(
        &mut self,
        reduce_id: usize,
    ) -> Result<Box<dyn ShufflePartitionWriter + '_>> {
        self.check_active("write to")?;
        if reduce_id >= self.partitions.len() {
            return Err(protocol_violation(format!(
                "partition {reduce_id} out of range, map output has {} partitions",
                self.partitions.len()
            )));
        }
        if reduce_id < self.next_partition {
            return Err(protocol_violation(format!(
                "partition {reduce_id} requested after partition {}",
                self.next_partition - 1
            )));
        }
        self.next_partition = reduce_id + 1;

        let spill = self.spill.as_mut().ok_or_else(|| {
            ShuffleError::Internal("staging file already released".to_string())
        })?;
        Ok(Box::new(StagedPartitionWriter {
            block_id: ShuffleBlockId::new(self.shuffle_id, self.map_id, reduce_id),
            spill,
            record: &mut self.partitions[reduce_id],
            codec: self.codec.clone(),
            metrics: self.metrics.clone(),
        }))
    }

    async fn commit_all_partitions(&mut self) -> Result<MapOutputCommitMessage> {
        self.check_active("commit")?;
        match self.upload_all().await {
            Ok(message) => {
                self.state = OutputState::Committed;
                self.discard_staging();
                let blocks = message.partition_lengths.iter().filter(|l| **l > 0).count();
                let bytes = message.total_bytes();
                self.metrics.record_commit(blocks, bytes);
                info!(
                    "committed map output {} of shuffle {}: {blocks} blocks, {bytes} bytes",
                    self.map_id, self.shuffle_id
                );
                Ok(message)
            }
            Err(e) => {
                if let Err(abort_err) = self.abort(&e) {
                    warn!("failed to abort map output after {e}: {abort_err}");
                }
                Err(e)
            }
        }
    }

    fn abort(&mut self, cause: &ShuffleError) -> Result<()> {
        self.check_active("abort")?;
        warn!(
            "aborting map output {} of shuffle {}: {cause}",
            self.map_id, self.shuffle_id
        );
        self.state = OutputState::Aborted;
        self.discard_staging();
        self.metrics.record_abort();
        Ok(())
    }
}

impl Drop for RemoteMapOutputWriter {
    fn drop(&mut self) {
        if self.state == OutputState::Active {
            warn!(
                "map output {} of shuffle {} dropped without commit or abort",
                self.map_id, self.shuffle_id
            );
        }
        self.discard_staging();
    }
}

/// Partition writer appending to the staging file.
struct StagedPartitionWriter<'a> {
    block_id: ShuffleBlockId,
    spill: &'a mut SpillFile,
    record: &'a mut PartitionRecord,
    codec: Arc<dyn BlockCodec>,
    metrics: Arc<dyn ShuffleMetricsCollector>,
}

impl ShufflePartitionWriter for StagedPartitionWriter<'_> {
    fn block_id(&self) -> &ShuffleBlockId {
        &self.block_id
    }

    fn open_stream(&mut self) -> Result<Box<dyn ShuffleStream + '_>> {
        self.record.open(&self.block_id)?;
        let SpillFile {
            writer, written, ..
        } = &mut *self.spill;
        let written: &AtomicU64 = written;
        let start = written.load(Ordering::SeqCst);

        let sink = CountingSink {
            inner: writer,
            written,
        };
        let encoder = match self.codec.encoder(Box::new(sink)) {
            Ok(encoder) => encoder,
            Err(e) => {
                self.record.fail(&e);
                self.record.close(0);
                return Err(e);
            }
        };
        Ok(Box::new(StagedStream {
            block_id: self.block_id.clone(),
            encoder: Some(encoder),
            written,
            start,
            accepted: 0,
            preserves_length: self.codec.preserves_length(),
            record: &mut *self.record,
            metrics: self.metrics.clone(),
        }))
    }

    fn open_transferrable_channel(
        &mut self,
    ) -> Result<Box<dyn TransferrableChannel + '_>> {
        self.record.open(&self.block_id)?;
        let SpillFile {
            writer, written, ..
        } = &mut *self.spill;
        Ok(Box::new(SpillFileChannel::new(
            self.block_id.clone(),
            writer,
            written,
            &mut *self.record,
            self.metrics.clone(),
        )))
    }

    fn num_bytes_written(&self) -> u64 {
        self.record.length
    }
}

/// Counts the bytes the codec hands to the staging file.
struct CountingSink<'a> {
    inner: &'a mut BufWriter<File>,
    written: &'a AtomicU64,
}

impl Write for CountingSink<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.written.fetch_add(n as u64, Ordering::SeqCst);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Stream into one partition of the staging file, through the codec.
struct StagedStream<'a> {
    block_id: ShuffleBlockId,
    encoder: Option<Box<dyn BlockEncoder + 'a>>,
    written: &'a AtomicU64,
    start: u64,
    /// Bytes accepted from the caller, before encoding
    accepted: u64,
    preserves_length: bool,
    record: &'a mut PartitionRecord,
    metrics: Arc<dyn ShuffleMetricsCollector>,
}

impl<'a> StagedStream<'a> {
    fn encoder(&mut self) -> io::Result<&mut Box<dyn BlockEncoder + 'a>> {
        match self.encoder.as_mut() {
            Some(encoder) => Ok(encoder),
            None => Err(io::Error::other(format!(
                "stream of block {} is closed",
                self.block_id
            ))),
        }
    }

    fn finish(&mut self) -> Result<u64> {
        let Some(encoder) = self.encoder.take() else {
            return Ok(self.record.length);
        };
        let result = encoder.finish().map_err(ShuffleError::from).and_then(|()| {
            let persisted = self.written.load(Ordering::SeqCst) - self.start;
            if self.preserves_length && persisted != self.accepted {
                Err(ShuffleError::PartialWrite {
                    block_id: self.block_id.clone(),
                    expected: self.accepted,
                    actual: persisted,
                })
            } else {
                Ok(persisted)
            }
        });

        let persisted = self.written.load(Ordering::SeqCst) - self.start;
        self.record.close(persisted);
        match result {
            Ok(persisted) => {
                self.metrics.record_bytes_written(persisted);
                debug!(
                    "closed stream of block {}, {} bytes written, {persisted} bytes persisted",
                    self.block_id, self.accepted
                );
                Ok(persisted)
            }
            Err(e) => {
                self.record.fail(&e);
                Err(e)
            }
        }
    }
}

impl Write for StagedStream<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.encoder()?.write(buf) {
            Ok(n) => {
                self.accepted += n as u64;
                Ok(n)
            }
            Err(e) => {
                self.record.fail(&ShuffleError::IoError(io::Error::new(
                    e.kind(),
                    e.to_string(),
                )));
                Err(e)
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        self.encoder()?.flush()
    }
}

impl ShuffleStream for StagedStream<'_> {
    fn close(mut self: Box<Self>) -> Result<()> {
        self.finish().map(|_| ())
    }
}

impl Drop for StagedStream<'_> {
    fn drop(&mut self) {
        if self.encoder.is_some() {
            warn!("stream of block {} dropped without close", self.block_id);
            if let Err(e) = self.finish() {
                warn!("failed to close stream of block {}: {e}", self.block_id);
            }
        }
    }
}
