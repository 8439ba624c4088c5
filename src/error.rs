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

//! Remote shuffle error types

use std::{
    error::Error,
    fmt::{Display, Formatter},
    io, result,
};

use crate::block::ShuffleBlockId;

/// Result type alias for remote shuffle operations.
pub type Result<T> = result::Result<T, ShuffleError>;

/// Boxed underlying cause attached to a remote failure.
pub type BoxedCause = Box<dyn Error + Send + Sync + 'static>;

/// Remote shuffle error types.
#[derive(Debug)]
pub enum ShuffleError {
    /// A remote read or write of a block failed: (block_id, cause).
    ///
    /// Not retried here, retrying is the remote client's job.
    RemoteIo(ShuffleBlockId, BoxedCause),
    /// The read/write lifecycle was used incorrectly, e.g. a partition
    /// writer opened twice or a map output committed after an abort.
    ProtocolViolation(String),
    /// The bytes persisted for a block are incompatible with the bytes
    /// handed to the writer under the configured codec.
    PartialWrite {
        /// Block being written
        block_id: ShuffleBlockId,
        /// Bytes the caller asked to persist
        expected: u64,
        /// Bytes that actually reached the sink
        actual: u64,
    },
    /// The consumer closed the fetch early.
    Cancelled,
    /// Configuration error with invalid settings.
    Configuration(String),
    /// General error with a descriptive message.
    General(String),
    /// Internal error indicating a bug or unexpected state.
    Internal(String),
    /// Local I/O error, e.g. on the staging file.
    IoError(io::Error),
    /// Error raised by the object store.
    ObjectStore(Box<object_store::Error>),
    /// Tokio task join error.
    TokioError(tokio::task::JoinError),
}

#[allow(clippy::from_over_into)]
impl<T> Into<Result<T>> for ShuffleError {
    fn into(self) -> Result<T> {
        Err(self)
    }
}

/// Creates a protocol violation error from a string message.
pub fn protocol_violation(message: impl Into<String>) -> ShuffleError {
    ShuffleError::ProtocolViolation(message.into())
}

impl ShuffleError {
    /// Returns the block this error refers to, if any.
    pub fn block_id(&self) -> Option<&ShuffleBlockId> {
        match self {
            ShuffleError::RemoteIo(block_id, _) => Some(block_id),
            ShuffleError::PartialWrite { block_id, .. } => Some(block_id),
            _ => None,
        }
    }

    /// Wraps an error with the block it occurred on, unless it already
    /// carries block context.
    pub fn with_block(self, block_id: &ShuffleBlockId) -> Self {
        match self {
            e @ ShuffleError::RemoteIo(..) | e @ ShuffleError::PartialWrite { .. } => e,
            ShuffleError::Cancelled => ShuffleError::Cancelled,
            other => ShuffleError::RemoteIo(block_id.clone(), Box::new(other)),
        }
    }
}

impl From<String> for ShuffleError {
    fn from(e: String) -> Self {
        ShuffleError::General(e)
    }
}

impl From<io::Error> for ShuffleError {
    fn from(e: io::Error) -> Self {
        ShuffleError::IoError(e)
    }
}

impl From<object_store::Error> for ShuffleError {
    fn from(e: object_store::Error) -> Self {
        ShuffleError::ObjectStore(Box::new(e))
    }
}

impl From<object_store::path::Error> for ShuffleError {
    fn from(e: object_store::path::Error) -> Self {
        ShuffleError::Configuration(e.to_string())
    }
}

impl From<url::ParseError> for ShuffleError {
    fn from(e: url::ParseError) -> Self {
        ShuffleError::Configuration(e.to_string())
    }
}

impl From<tokio::task::JoinError> for ShuffleError {
    fn from(e: tokio::task::JoinError) -> Self {
        if e.is_cancelled() {
            ShuffleError::Cancelled
        } else {
            ShuffleError::TokioError(e)
        }
    }
}

impl Display for ShuffleError {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            ShuffleError::RemoteIo(block_id, cause) => {
                write!(f, "Remote I/O error on block {block_id}: {cause}")
            }
            ShuffleError::ProtocolViolation(desc) => {
                write!(f, "Shuffle protocol violation: {desc}")
            }
            ShuffleError::PartialWrite {
                block_id,
                expected,
                actual,
            } => write!(
                f,
                "Partial write of block {block_id}: expected {expected} bytes, \
                persisted {actual} bytes"
            ),
            ShuffleError::Cancelled => write!(f, "Shuffle fetch cancelled"),
            ShuffleError::Configuration(desc) => {
                write!(f, "Configuration error: {desc}")
            }
            ShuffleError::General(desc) => write!(f, "General error: {desc}"),
            ShuffleError::Internal(desc) => {
                write!(f, "Internal remote shuffle error: {desc}")
            }
            ShuffleError::IoError(desc) => write!(f, "IO error: {desc}"),
            ShuffleError::ObjectStore(desc) => write!(f, "Object store error: {desc}"),
            ShuffleError::TokioError(desc) => write!(f, "Tokio join error: {desc}"),
        }
    }
}

impl Error for ShuffleError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ShuffleError::RemoteIo(_, cause) => Some(cause.as_ref()),
            ShuffleError::IoError(e) => Some(e),
            ShuffleError::ObjectStore(e) => Some(e.as_ref()),
            ShuffleError::TokioError(e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_io_display_carries_block() {
        let block_id = ShuffleBlockId::new(3, 7, 1);
        let err = ShuffleError::RemoteIo(block_id, "connection reset".into());
        assert_eq!(
            err.to_string(),
            "Remote I/O error on block shuffle_3_7_1: connection reset"
        );
        assert!(err.source().is_some());
    }

    #[test]
    fn with_block_keeps_existing_context() {
        let original = ShuffleBlockId::new(1, 1, 1);
        let other = ShuffleBlockId::new(2, 2, 2);

        let err = ShuffleError::RemoteIo(original.clone(), "boom".into())
            .with_block(&other);
        assert_eq!(err.block_id(), Some(&original));

        let err = ShuffleError::General("boom".to_string()).with_block(&other);
        assert_eq!(err.block_id(), Some(&other));

        let err = ShuffleError::Cancelled.with_block(&other);
        assert!(matches!(err, ShuffleError::Cancelled));
    }
}
