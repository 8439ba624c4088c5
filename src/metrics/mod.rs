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

#[cfg(feature = "prometheus-metrics")]
/// Prometheus backed collector
pub mod prometheus;

use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
#[cfg(feature = "prometheus-metrics")]
use crate::metrics::prometheus::PrometheusMetricsCollector;

/// Interface for recording remote shuffle metrics. Implementations must not
/// block and must not fail the operation being recorded.
pub trait ShuffleMetricsCollector: Send + Sync {
    /// A prefetch of `bytes` bytes completed after `latency`.
    fn record_prefetch(&self, latency: Duration, bytes: u64);

    /// A block fetch failed.
    fn record_fetch_failed(&self);

    /// `count` in-flight prefetches were cancelled by a close or drop.
    fn record_prefetch_cancelled(&self, count: usize);

    /// A partition writer persisted `bytes` bytes to the staging file.
    fn record_bytes_written(&self, bytes: u64);

    /// A map output with `partitions` non-empty partitions totalling `bytes`
    /// bytes was committed.
    fn record_commit(&self, partitions: usize, bytes: u64);

    /// A map output was aborted.
    fn record_abort(&self);

    /// Gather metrics into a byte buffer together with its content type, if
    /// the collector exposes any.
    fn gather_metrics(&self) -> Result<Option<(Vec<u8>, String)>> {
        Ok(None)
    }
}

/// Implementation of [ShuffleMetricsCollector] which records nothing
#[derive(Default)]
pub struct NoopMetricsCollector {}

impl ShuffleMetricsCollector for NoopMetricsCollector {
    fn record_prefetch(&self, _latency: Duration, _bytes: u64) {}
    fn record_fetch_failed(&self) {}
    fn record_prefetch_cancelled(&self, _count: usize) {}
    fn record_bytes_written(&self, _bytes: u64) {}
    fn record_commit(&self, _partitions: usize, _bytes: u64) {}
    fn record_abort(&self) {}
}

/// Returns the collector used when none is given explicitly.
#[cfg(feature = "prometheus-metrics")]
pub fn default_metrics_collector() -> Result<Arc<dyn ShuffleMetricsCollector>> {
    PrometheusMetricsCollector::current()
}

/// Returns the collector used when none is given explicitly.
#[cfg(not(feature = "prometheus-metrics"))]
pub fn default_metrics_collector() -> Result<Arc<dyn ShuffleMetricsCollector>> {
    Ok(Arc::new(NoopMetricsCollector::default()))
}

#[cfg(test)]
pub(crate) mod test_util {
    use super::*;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

    /// Counts every recorded event.
    #[derive(Default)]
    pub(crate) struct CountingMetricsCollector {
        pub prefetched: AtomicUsize,
        pub prefetched_bytes: AtomicU64,
        pub fetch_failed: AtomicUsize,
        pub cancelled: AtomicUsize,
        pub bytes_written: AtomicU64,
        pub commits: AtomicUsize,
        pub aborts: AtomicUsize,
    }

    impl ShuffleMetricsCollector for CountingMetricsCollector {
        fn record_prefetch(&self, _latency: Duration, bytes: u64) {
            self.prefetched.fetch_add(1, Ordering::SeqCst);
            self.prefetched_bytes.fetch_add(bytes, Ordering::SeqCst);
        }

        fn record_fetch_failed(&self) {
            self.fetch_failed.fetch_add(1, Ordering::SeqCst);
        }

        fn record_prefetch_cancelled(&self, count: usize) {
            self.cancelled.fetch_add(count, Ordering::SeqCst);
        }

        fn record_bytes_written(&self, bytes: u64) {
            self.bytes_written.fetch_add(bytes, Ordering::SeqCst);
        }

        fn record_commit(&self, _partitions: usize, _bytes: u64) {
            self.commits.fetch_add(1, Ordering::SeqCst);
        }

        fn record_abort(&self) {
            self.aborts.fetch_add(1, Ordering::SeqCst);
        }
    }
}
