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

use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::OnceCell;
use prometheus::{
    Counter, Histogram, Registry, register_counter_with_registry,
    register_histogram_with_registry,
};
use prometheus::{Encoder, TextEncoder};

use crate::error::{Result, ShuffleError};
use crate::metrics::ShuffleMetricsCollector;

static COLLECTOR: OnceCell<Arc<dyn ShuffleMetricsCollector>> = OnceCell::new();

fn registration_error(e: prometheus::Error) -> ShuffleError {
    ShuffleError::Internal(format!("Error registering metric: {e:?}"))
}

/// ShuffleMetricsCollector implementation based on Prometheus. It tracks
/// 8 metrics:
/// *shuffle_prefetch_latency_seconds* - Histogram of remote block fetch latency
/// *shuffle_prefetch_bytes_total* - Counter of fetched bytes
/// *shuffle_fetch_failed_total* - Counter of failed block fetches
/// *shuffle_prefetch_cancelled_total* - Counter of cancelled prefetches
/// *shuffle_bytes_written_total* - Counter of bytes persisted by partition writers
/// *shuffle_commit_total* - Counter of committed map outputs
/// *shuffle_committed_blocks_total* - Counter of uploaded blocks
/// *shuffle_abort_total* - Counter of aborted map outputs
pub struct PrometheusMetricsCollector {
    prefetch_latency: Histogram,
    prefetch_bytes: Counter,
    fetch_failed: Counter,
    prefetch_cancelled: Counter,
    bytes_written: Counter,
    commits: Counter,
    committed_blocks: Counter,
    aborts: Counter,
}

impl PrometheusMetricsCollector {
    /// Registers all metrics with `registry`.
    pub fn new(registry: &Registry) -> Result<Self> {
        let prefetch_latency = register_histogram_with_registry!(
            "shuffle_prefetch_latency_seconds",
            "Histogram of remote shuffle block fetch latency in seconds",
            vec![0.005_f64, 0.025_f64, 0.1_f64, 0.5_f64, 2_f64, 10_f64],
            registry
        )
        .map_err(registration_error)?;

        let prefetch_bytes = register_counter_with_registry!(
            "shuffle_prefetch_bytes_total",
            "Counter of bytes fetched from the remote shuffle store",
            registry
        )
        .map_err(registration_error)?;

        let fetch_failed = register_counter_with_registry!(
            "shuffle_fetch_failed_total",
            "Counter of failed remote shuffle block fetches",
            registry
        )
        .map_err(registration_error)?;

        let prefetch_cancelled = register_counter_with_registry!(
            "shuffle_prefetch_cancelled_total",
            "Counter of cancelled remote shuffle block prefetches",
            registry
        )
        .map_err(registration_error)?;

        let bytes_written = register_counter_with_registry!(
            "shuffle_bytes_written_total",
            "Counter of bytes persisted by shuffle partition writers",
            registry
        )
        .map_err(registration_error)?;

        let commits = register_counter_with_registry!(
            "shuffle_commit_total",
            "Counter of committed shuffle map outputs",
            registry
        )
        .map_err(registration_error)?;

        let committed_blocks = register_counter_with_registry!(
            "shuffle_committed_blocks_total",
            "Counter of shuffle blocks uploaded by committed map outputs",
            registry
        )
        .map_err(registration_error)?;

        let aborts = register_counter_with_registry!(
            "shuffle_abort_total",
            "Counter of aborted shuffle map outputs",
            registry
        )
        .map_err(registration_error)?;

        Ok(Self {
            prefetch_latency,
            prefetch_bytes,
            fetch_failed,
            prefetch_cancelled,
            bytes_written,
            commits,
            committed_blocks,
            aborts,
        })
    }

    /// Process wide collector registered with the default registry.
    pub fn current() -> Result<Arc<dyn ShuffleMetricsCollector>> {
        COLLECTOR
            .get_or_try_init(|| {
                let collector = Self::new(::prometheus::default_registry())?;

                Ok(Arc::new(collector) as Arc<dyn ShuffleMetricsCollector>)
            })
            .map(|arc| arc.clone())
    }
}

impl ShuffleMetricsCollector for PrometheusMetricsCollector {
    fn record_prefetch(&self, latency: Duration, bytes: u64) {
        self.prefetch_latency.observe(latency.as_secs_f64());
        self.prefetch_bytes.inc_by(bytes as f64);
    }

    fn record_fetch_failed(&self) {
        self.fetch_failed.inc();
    }

    fn record_prefetch_cancelled(&self, count: usize) {
        self.prefetch_cancelled.inc_by(count as f64);
    }

    fn record_bytes_written(&self, bytes: u64) {
        self.bytes_written.inc_by(bytes as f64);
    }

    fn record_commit(&self, partitions: usize, _bytes: u64) {
        self.commits.inc();
        self.committed_blocks.inc_by(partitions as f64);
    }

    fn record_abort(&self) {
        self.aborts.inc();
    }

    fn gather_metrics(&self) -> Result<Option<(Vec<u8>, String)>> {
        let encoder = TextEncoder::new();

        let metric_families = prometheus::gather();
        let mut buffer = vec![];
        encoder.encode(&metric_families, &mut buffer).map_err(|e| {
            ShuffleError::Internal(format!("Error encoding prometheus metrics: {e:?}"))
        })?;

        Ok(Some((buffer, encoder.format_type().to_owned())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_into_private_registry() -> Result<()> {
        let registry = Registry::new();
        let collector = PrometheusMetricsCollector::new(&registry)?;

        collector.record_prefetch(Duration::from_millis(20), 1024);
        collector.record_fetch_failed();
        collector.record_commit(3, 4096);

        let mut buffer = vec![];
        TextEncoder::new()
            .encode(&registry.gather(), &mut buffer)
            .map_err(|e| ShuffleError::Internal(e.to_string()))?;
        let text = String::from_utf8_lossy(&buffer);
        assert!(text.contains("shuffle_prefetch_bytes_total 1024"), "{text}");
        assert!(text.contains("shuffle_fetch_failed_total 1"), "{text}");
        assert!(text.contains("shuffle_committed_blocks_total 3"), "{text}");

        // registering the same names twice is rejected
        assert!(PrometheusMetricsCollector::new(&registry).is_err());
        Ok(())
    }
}
