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

#![doc = include_str!("../README.md")]
#![warn(missing_docs)]

/// The current version of the crate, derived from the Cargo package version.
pub const REMOTE_SHUFFLE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prints the current version to stdout.
pub fn print_version() {
    println!("Ballista remote shuffle version: {REMOTE_SHUFFLE_VERSION}")
}

/// Shuffle block identifiers and descriptors.
pub mod block;
/// Remote block client interface and its object store implementation.
pub mod client;
/// Codecs applied to partition data on its way to the store.
pub mod codec;
/// Configuration options and settings.
pub mod config;
/// Error types and result definitions.
pub mod error;
/// Metrics collection for fetches and map output commits.
pub mod metrics;
/// Object store resolution from URLs.
pub mod object_store;
/// Prefetching fetch iterator for reduce tasks.
pub mod shuffle_reader;
/// Partition and map output writers for map tasks.
pub mod shuffle_writer;

pub use block::{ShuffleBlockId, ShuffleBlockInfo};
pub use error::{Result, ShuffleError};
