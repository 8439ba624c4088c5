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

//! Reduce side of the remote shuffle: a prefetching iterator over the
//! blocks of one reduce partition.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use bytes::Bytes;
use futures::Stream;
use futures::future::{join_all, poll_fn};
use log::{debug, warn};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::block::{ShuffleBlockId, ShuffleBlockInfo};
use crate::client::RemoteBlockClient;
use crate::config::FetchOptions;
use crate::error::{Result, ShuffleError};
use crate::metrics::{NoopMetricsCollector, ShuffleMetricsCollector};

/// Builds [ShuffleFetchIterator]s sharing one client, configuration and
/// metrics collector.
#[derive(Clone)]
pub struct ShuffleFetchIteratorFactory {
    client: Arc<dyn RemoteBlockClient>,
    options: FetchOptions,
    metrics: Arc<dyn ShuffleMetricsCollector>,
}

impl ShuffleFetchIteratorFactory {
    /// Creates a factory which does not record metrics.
    pub fn new(client: Arc<dyn RemoteBlockClient>, options: FetchOptions) -> Self {
        Self {
            client,
            options,
            metrics: Arc::new(NoopMetricsCollector::default()),
        }
    }

    /// Records prefetch metrics into `metrics`.
    pub fn with_metrics(mut self, metrics: Arc<dyn ShuffleMetricsCollector>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Creates an iterator over `blocks`, yielding them in the given order.
    ///
    /// Prefetching has begun when this returns: requests for the first
    /// window of blocks are already running on the current Tokio runtime.
    /// Fails if called outside of a runtime or with a zero sized window.
    pub fn create(&self, blocks: Vec<ShuffleBlockInfo>) -> Result<ShuffleFetchIterator> {
        if self.options.read_ahead_blocks == 0 {
            return Err(ShuffleError::Configuration(
                "read ahead window must hold at least one block".to_string(),
            ));
        }
        let runtime = Handle::try_current().map_err(|e| {
            ShuffleError::Configuration(format!(
                "shuffle fetch iterator requires a Tokio runtime: {e}"
            ))
        })?;

        debug!(
            "creating shuffle fetch iterator over {} blocks, read ahead {} blocks / {} bytes",
            blocks.len(),
            self.options.read_ahead_blocks,
            self.options.max_bytes_in_flight
        );

        let mut iter = ShuffleFetchIterator {
            client: self.client.clone(),
            options: self.options.clone(),
            metrics: self.metrics.clone(),
            runtime,
            pending: blocks.into(),
            window: VecDeque::new(),
            requests_in_window: 0,
            bytes_in_window: 0,
            cancelled: vec![],
            state: FetchState::Running,
        };
        iter.fill_window();
        Ok(iter)
    }
}

/// One position of the read-ahead window.
struct PrefetchSlot {
    block: ShuffleBlockInfo,
    /// `None` for empty blocks, which are never requested
    fetch: Option<JoinHandle<Result<Bytes>>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FetchState {
    Running,
    /// A failure was yielded, remaining positions are dropped
    Failed,
    Closed,
}

/// Prefetching iterator over the blocks of one reduce partition.
///
/// Blocks are yielded strictly in construction order while up to
/// `read_ahead_blocks` requests run ahead of the consumer. A failed fetch is
/// reported when the consumer reaches its position, after which the iterator
/// is exhausted. Also usable as a [Stream].
pub struct ShuffleFetchIterator {
    client: Arc<dyn RemoteBlockClient>,
    options: FetchOptions,
    metrics: Arc<dyn ShuffleMetricsCollector>,
    runtime: Handle,
    /// Blocks not requested yet
    pending: VecDeque<ShuffleBlockInfo>,
    /// Requested but not yet consumed, in yield order
    window: VecDeque<PrefetchSlot>,
    requests_in_window: usize,
    bytes_in_window: u64,
    /// Aborted fetches `close` still has to wait for
    cancelled: Vec<JoinHandle<Result<Bytes>>>,
    state: FetchState,
}

impl ShuffleFetchIterator {
    /// Returns the next block, waiting only if its fetch is still running.
    ///
    /// Returns `None` once every block was yielded, after a failure was
    /// yielded, or after [Self::close].
    pub async fn next(&mut self) -> Option<Result<(ShuffleBlockId, Bytes)>> {
        poll_fn(|cx| self.poll_next_block(cx)).await
    }

    /// Whether [Self::next] will yield another block or failure.
    pub fn has_next(&self) -> bool {
        self.state == FetchState::Running
            && (!self.window.is_empty() || !self.pending.is_empty())
    }

    /// Number of block requests currently occupying the read-ahead window.
    pub fn requests_in_window(&self) -> usize {
        self.requests_in_window
    }

    /// Cancels all outstanding prefetches and drops unconsumed blocks.
    ///
    /// Waits up to the configured cancel timeout for the cancelled requests
    /// to release their resources. Closing twice is a no-op.
    pub async fn close(&mut self) {
        if self.state != FetchState::Failed {
            self.state = FetchState::Closed;
        }
        self.cancel_outstanding();

        let handles = std::mem::take(&mut self.cancelled);
        if handles.is_empty() {
            return;
        }
        let count = handles.len();
        if tokio::time::timeout(self.options.cancel_timeout, join_all(handles))
            .await
            .is_err()
        {
            warn!(
                "{count} cancelled shuffle fetches did not finish within {:?}",
                self.options.cancel_timeout
            );
        } else {
            debug!("{count} cancelled shuffle fetches released");
        }
    }

    fn poll_next_block(
        &mut self,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<(ShuffleBlockId, Bytes)>>> {
        if self.state != FetchState::Running {
            return Poll::Ready(None);
        }
        if self.window.is_empty() {
            self.fill_window();
        }
        let Some(slot) = self.window.front_mut() else {
            return Poll::Ready(None);
        };

        let fetched = match slot.fetch.as_mut() {
            None => Ok(Bytes::new()),
            Some(handle) => match Pin::new(handle).poll(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(joined) => joined.map_err(ShuffleError::from).and_then(|r| r),
            },
        };

        let Some(slot) = self.window.pop_front() else {
            return Poll::Ready(None);
        };
        if slot.fetch.is_some() {
            self.requests_in_window -= 1;
            self.bytes_in_window -= slot.block.length;
        }
        let block_id = slot.block.block_id;
        let expected = slot.block.length;

        let fetched = fetched.and_then(|bytes| {
            if expected > 0 && bytes.len() as u64 != expected {
                self.metrics.record_fetch_failed();
                Err(ShuffleError::RemoteIo(
                    block_id.clone(),
                    format!("expected {expected} bytes, fetched {}", bytes.len())
                        .into(),
                ))
            } else {
                Ok(bytes)
            }
        });

        match fetched {
            Ok(bytes) => {
                self.fill_window();
                Poll::Ready(Some(Ok((block_id, bytes))))
            }
            Err(e) => {
                warn!("shuffle fetch of block {block_id} failed: {e}");
                self.state = FetchState::Failed;
                self.cancel_outstanding();
                Poll::Ready(Some(Err(e.with_block(&block_id))))
            }
        }
    }

    /// Moves blocks from `pending` into the window while it has room.
    fn fill_window(&mut self) {
        while let Some(next) = self.pending.front() {
            if next.length > 0 {
                if self.requests_in_window >= self.options.read_ahead_blocks {
                    break;
                }
                // the first request is always admitted so that a single
                // oversized block cannot stall the iterator
                if self.requests_in_window > 0
                    && self.bytes_in_window + next.length
                        > self.options.max_bytes_in_flight
                {
                    break;
                }
            }
            let Some(block) = self.pending.pop_front() else {
                break;
            };
            let fetch = if block.length > 0 {
                self.requests_in_window += 1;
                self.bytes_in_window += block.length;
                Some(self.spawn_fetch(block.block_id.clone()))
            } else {
                None
            };
            self.window.push_back(PrefetchSlot { block, fetch });
        }
    }

    fn spawn_fetch(&self, block_id: ShuffleBlockId) -> JoinHandle<Result<Bytes>> {
        let client = self.client.clone();
        let metrics = self.metrics.clone();
        self.runtime.spawn(async move {
            let started = Instant::now();
            let result = client.get(&block_id).await;
            match &result {
                Ok(bytes) => {
                    metrics.record_prefetch(started.elapsed(), bytes.len() as u64)
                }
                Err(e) => {
                    debug!("prefetch of block {block_id} failed: {e}");
                    metrics.record_fetch_failed();
                }
            }
            result
        })
    }

    /// Aborts every request in the window and forgets unrequested blocks.
    fn cancel_outstanding(&mut self) {
        self.pending.clear();
        let mut count = 0;
        for slot in self.window.drain(..) {
            if let Some(handle) = slot.fetch {
                if !handle.is_finished() {
                    handle.abort();
                    count += 1;
                }
                self.cancelled.push(handle);
            }
        }
        self.requests_in_window = 0;
        self.bytes_in_window = 0;
        if count > 0 {
            debug!("cancelled {count} shuffle prefetches");
            self.metrics.record_prefetch_cancelled(count);
        }
    }
}

impl Stream for ShuffleFetchIterator {
    type Item = Result<(ShuffleBlockId, Bytes)>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().poll_next_block(cx)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        if self.state == FetchState::Running {
            let remaining = self.window.len() + self.pending.len();
            (0, Some(remaining))
        } else {
            (0, Some(0))
        }
    }
}

impl Drop for ShuffleFetchIterator {
    fn drop(&mut self) {
        self.cancel_outstanding();
        for handle in &self.cancelled {
            handle.abort();
        }
    }
}
