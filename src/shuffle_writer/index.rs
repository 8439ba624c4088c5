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

//! Partition offsets within a map task's staging file. Partition `i` spans
//! `[offset_i, offset_i+1)`.

use std::ops::Range;

use crate::error::{Result, ShuffleError};

/// Byte ranges of each partition in the staging file of one map task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShuffleIndex {
    /// `partition_count + 1` entries, the last one is the total length
    offsets: Vec<u64>,
}

impl ShuffleIndex {
    /// Builds the index of partitions laid out back to back with the given
    /// persisted lengths.
    pub fn from_lengths(lengths: &[u64]) -> Self {
        let mut offsets = Vec::with_capacity(lengths.len() + 1);
        let mut offset = 0;
        offsets.push(offset);
        for length in lengths {
            offset += length;
            offsets.push(offset);
        }
        Self { offsets }
    }

    /// Number of partitions in this index.
    pub fn partition_count(&self) -> usize {
        self.offsets.len().saturating_sub(1)
    }

    /// Total length of the staging file.
    pub fn total_length(&self) -> u64 {
        self.offsets.last().copied().unwrap_or(0)
    }

    /// Byte range of a partition.
    pub fn partition_range(&self, partition_id: usize) -> Result<Range<u64>> {
        match (
            self.offsets.get(partition_id),
            self.offsets.get(partition_id + 1),
        ) {
            (Some(&start), Some(&end)) => Ok(start..end),
            _ => Err(ShuffleError::Internal(format!(
                "partition {partition_id} out of range for index of {} partitions",
                self.partition_count()
            ))),
        }
    }
}
