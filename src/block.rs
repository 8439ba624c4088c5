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

//! Identifiers and descriptors of shuffle blocks.

use std::fmt::{Display, Formatter};

/// Identifies the bytes one map task produced for one reduce partition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShuffleBlockId {
    /// Shuffle (query stage) the block belongs to
    pub shuffle_id: usize,
    /// Map task attempt that produced the block
    pub map_id: u64,
    /// Reduce partition the block is destined for
    pub reduce_id: usize,
}

impl ShuffleBlockId {
    /// Creates a new block id.
    pub fn new(shuffle_id: usize, map_id: u64, reduce_id: usize) -> Self {
        Self {
            shuffle_id,
            map_id,
            reduce_id,
        }
    }
}

impl Display for ShuffleBlockId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "shuffle_{}_{}_{}",
            self.shuffle_id, self.map_id, self.reduce_id
        )
    }
}

/// A block a reduce task has to fetch, as handed out by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShuffleBlockInfo {
    /// The block to fetch
    pub block_id: ShuffleBlockId,
    /// Persisted length of the block, as reported by the map output commit
    pub length: u64,
    /// Where the block was produced, e.g. the id of the executor that wrote it
    pub location: Option<String>,
}

impl ShuffleBlockInfo {
    /// Creates a block descriptor without a location hint.
    pub fn new(block_id: ShuffleBlockId, length: u64) -> Self {
        Self {
            block_id,
            length,
            location: None,
        }
    }

    /// Attaches a location hint.
    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }
}

/// Lists the blocks a reduce partition needs from a set of committed map
/// outputs, skipping empty ones.
///
/// `map_outputs` pairs each map id with the partition lengths returned by its
/// commit.
pub fn blocks_for_reduce_partition<'a>(
    shuffle_id: usize,
    reduce_id: usize,
    map_outputs: impl IntoIterator<Item = (u64, &'a [u64])>,
) -> Vec<ShuffleBlockInfo> {
    map_outputs
        .into_iter()
        .filter_map(|(map_id, lengths)| {
            let length = lengths.get(reduce_id).copied().unwrap_or(0);
            (length > 0).then(|| {
                ShuffleBlockInfo::new(
                    ShuffleBlockId::new(shuffle_id, map_id, reduce_id),
                    length,
                )
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_id_display() {
        assert_eq!(ShuffleBlockId::new(1, 42, 7).to_string(), "shuffle_1_42_7");
    }

    #[test]
    fn test_blocks_for_reduce_partition_skips_empty() {
        let map0 = vec![10, 0, 5];
        let map1 = vec![0, 3, 8];
        let blocks = blocks_for_reduce_partition(
            2,
            2,
            vec![(0, map0.as_slice()), (1, map1.as_slice())],
        );
        assert_eq!(
            blocks,
            vec![
                ShuffleBlockInfo::new(ShuffleBlockId::new(2, 0, 2), 5),
                ShuffleBlockInfo::new(ShuffleBlockId::new(2, 1, 2), 8),
            ]
        );

        let blocks = blocks_for_reduce_partition(
            2,
            0,
            vec![(0, map0.as_slice()), (1, map1.as_slice())],
        );
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].block_id.map_id, 0);
    }
}
