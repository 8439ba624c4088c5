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

use std::fs::File;
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use log::{debug, warn};

use crate::block::ShuffleBlockId;
use crate::error::{Result, ShuffleError, protocol_violation};
use crate::metrics::ShuffleMetricsCollector;
use crate::shuffle_writer::map_output::PartitionRecord;
use crate::shuffle_writer::{ShuffleStream, TransferrableChannel};

/// Positions `source` at `position` and limits it to `count` bytes.
fn source_range(source: &File, position: u64, count: u64) -> io::Result<io::Take<&File>> {
    let mut source = source;
    source.seek(SeekFrom::Start(position))?;
    Ok(source.take(count))
}

/// [TransferrableChannel] over a [ShuffleStream], for partition writers
/// without a direct file to file path. Bytes go through the stream's codec.
pub struct StreamTransferChannel<'a> {
    block_id: ShuffleBlockId,
    stream: Option<Box<dyn ShuffleStream + 'a>>,
}

impl<'a> StreamTransferChannel<'a> {
    /// Wraps `stream`, which receives the bytes of `block_id`.
    pub fn new(block_id: ShuffleBlockId, stream: Box<dyn ShuffleStream + 'a>) -> Self {
        Self {
            block_id,
            stream: Some(stream),
        }
    }
}

impl TransferrableChannel for StreamTransferChannel<'_> {
    fn transfer_from(&mut self, source: &File, position: u64, count: u64) -> Result<u64> {
        let stream = self.stream.as_mut().ok_or_else(|| {
            protocol_violation(format!("channel of block {} is closed", self.block_id))
        })?;
        let mut input = source_range(source, position, count)?;
        let copied = io::copy(&mut input, stream)?;
        if copied != count {
            return Err(ShuffleError::PartialWrite {
                block_id: self.block_id.clone(),
                expected: count,
                actual: copied,
            });
        }
        Ok(copied)
    }

    fn close(mut self: Box<Self>) -> Result<()> {
        match self.stream.take() {
            Some(stream) => stream.close(),
            None => Ok(()),
        }
    }
}

/// Channel appending straight to the staging file, bypassing the codec.
///
/// The copy from `source` is a plain [io::copy] between two files, which the
/// standard library turns into `copy_file_range`/`sendfile` where available.
pub(super) struct SpillFileChannel<'a> {
    block_id: ShuffleBlockId,
    writer: &'a mut BufWriter<File>,
    written: &'a AtomicU64,
    start: u64,
    record: &'a mut PartitionRecord,
    metrics: Arc<dyn ShuffleMetricsCollector>,
    closed: bool,
}

impl<'a> SpillFileChannel<'a> {
    pub(super) fn new(
        block_id: ShuffleBlockId,
        writer: &'a mut BufWriter<File>,
        written: &'a AtomicU64,
        record: &'a mut PartitionRecord,
        metrics: Arc<dyn ShuffleMetricsCollector>,
    ) -> Self {
        let start = written.load(Ordering::SeqCst);
        Self {
            block_id,
            writer,
            written,
            start,
            record,
            metrics,
            closed: false,
        }
    }

    fn copy_range(&mut self, source: &File, position: u64, count: u64) -> Result<u64> {
        // buffered stream output of earlier partitions must land first
        self.writer.flush()?;
        let mut input = source_range(source, position, count)?;
        let copied = io::copy(&mut input, self.writer.get_mut())?;
        self.written.fetch_add(copied, Ordering::SeqCst);
        Ok(copied)
    }

    fn finish(&mut self) -> u64 {
        self.closed = true;
        let persisted = self.written.load(Ordering::SeqCst) - self.start;
        self.record.close(persisted);
        self.metrics.record_bytes_written(persisted);
        debug!("closed channel of block {}, {persisted} bytes", self.block_id);
        persisted
    }
}

impl TransferrableChannel for SpillFileChannel<'_> {
    fn transfer_from(&mut self, source: &File, position: u64, count: u64) -> Result<u64> {
        if self.closed {
            return Err(protocol_violation(format!(
                "channel of block {} is closed",
                self.block_id
            )));
        }
        let result = self.copy_range(source, position, count).and_then(|copied| {
            if copied == count {
                Ok(copied)
            } else {
                Err(ShuffleError::PartialWrite {
                    block_id: self.block_id.clone(),
                    expected: count,
                    actual: copied,
                })
            }
        });
        if let Err(e) = &result {
            self.record.fail(e);
        }
        result
    }

    fn close(mut self: Box<Self>) -> Result<()> {
        self.finish();
        Ok(())
    }
}

impl Drop for SpillFileChannel<'_> {
    fn drop(&mut self) {
        if !self.closed {
            warn!("channel of block {} dropped without close", self.block_id);
            self.finish();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shuffle_writer::ShufflePartitionWriter;

    /// Partition writer buffering into memory, relying on the default
    /// channel implementation.
    struct VecPartitionWriter {
        block_id: ShuffleBlockId,
        data: Vec<u8>,
        opened: bool,
    }

    struct VecStream<'a> {
        data: &'a mut Vec<u8>,
    }

    impl Write for VecStream<'_> {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.data.write(buf)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl ShuffleStream for VecStream<'_> {
        fn close(self: Box<Self>) -> Result<()> {
            Ok(())
        }
    }

    impl ShufflePartitionWriter for VecPartitionWriter {
        fn block_id(&self) -> &ShuffleBlockId {
            &self.block_id
        }

        fn open_stream(&mut self) -> Result<Box<dyn ShuffleStream + '_>> {
            if self.opened {
                return Err(protocol_violation("opened twice"));
            }
            self.opened = true;
            Ok(Box::new(VecStream {
                data: &mut self.data,
            }))
        }

        fn num_bytes_written(&self) -> u64 {
            self.data.len() as u64
        }
    }

    fn source_file(content: &[u8]) -> Result<File> {
        let mut file = tempfile::tempfile()?;
        file.write_all(content)?;
        file.flush()?;
        Ok(file)
    }

    #[test]
    fn default_channel_copies_through_stream() -> Result<()> {
        let source = source_file(b"0123456789")?;
        let mut writer = VecPartitionWriter {
            block_id: ShuffleBlockId::new(0, 0, 0),
            data: vec![],
            opened: false,
        };

        let mut channel = writer.open_transferrable_channel()?;
        assert_eq!(channel.transfer_from(&source, 2, 3)?, 3);
        assert_eq!(channel.transfer_from(&source, 8, 2)?, 2);
        channel.close()?;

        assert_eq!(writer.data, b"23489");
        assert_eq!(writer.num_bytes_written(), 5);
        assert!(writer.open_stream().is_err());
        Ok(())
    }

    #[test]
    fn default_channel_reports_short_transfer() -> Result<()> {
        let source = source_file(b"short")?;
        let mut writer = VecPartitionWriter {
            block_id: ShuffleBlockId::new(1, 2, 3),
            data: vec![],
            opened: false,
        };

        let mut channel = writer.open_transferrable_channel()?;
        match channel.transfer_from(&source, 1, 10) {
            Err(ShuffleError::PartialWrite {
                block_id,
                expected,
                actual,
            }) => {
                assert_eq!(block_id, ShuffleBlockId::new(1, 2, 3));
                assert_eq!(expected, 10);
                assert_eq!(actual, 4);
            }
            other => panic!("expected partial write, got {other:?}"),
        }
        Ok(())
    }
}
