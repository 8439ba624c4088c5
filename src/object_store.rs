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

//! Resolution of the [ObjectStore] shuffle blocks live in.
//!
//! Supported schemes:
//!
//! * `file:///path/to/dir` local directory, created if missing
//! * `memory:///prefix` process local in-memory store
//! * `s3://bucket/prefix` Amazon S3 (or compatible), configured from the
//!   usual `AWS_*` environment variables

use std::sync::Arc;

use object_store::ObjectStore;
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path;
use url::Url;

use crate::error::{Result, ShuffleError};

/// Parses `url` and resolves it, see [store_from_url].
pub fn store_from_str(url: &str) -> Result<(Arc<dyn ObjectStore>, Path)> {
    let url = Url::parse(url)?;
    store_from_url(&url)
}

/// Builds the store `url` points at, together with the key prefix blocks are
/// placed under.
pub fn store_from_url(url: &Url) -> Result<(Arc<dyn ObjectStore>, Path)> {
    log::trace!("store_from_url: {url}");
    match url.scheme() {
        "file" => {
            let dir = url.to_file_path().map_err(|_| {
                ShuffleError::Configuration(format!(
                    "store url {url} is not a valid local path"
                ))
            })?;
            std::fs::create_dir_all(&dir)?;
            let store = LocalFileSystem::new_with_prefix(dir)?;
            Ok((Arc::new(store), Path::default()))
        }
        "memory" => Ok((Arc::new(InMemory::new()), Path::from_url_path(url.path())?)),
        "s3" => {
            let bucket_name = url.host_str().ok_or_else(|| {
                ShuffleError::Configuration(format!(
                    "store url {url} does not name a bucket"
                ))
            })?;
            let store = AmazonS3Builder::from_env()
                .with_bucket_name(bucket_name)
                .build()?;
            Ok((Arc::new(store), Path::from_url_path(url.path())?))
        }
        scheme => Err(ShuffleError::Configuration(format!(
            "store not supported, scheme '{scheme}' of url {url}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_memory_store_with_prefix() -> Result<()> {
        let (_, prefix) = store_from_str("memory:///shuffle/job-1")?;
        assert_eq!(prefix.as_ref(), "shuffle/job-1");
        Ok(())
    }

    #[test]
    fn resolves_local_directory() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let target = dir.path().join("blocks");
        let url = Url::from_directory_path(&target)
            .map_err(|_| ShuffleError::General("bad path".to_string()))?;
        let (_, prefix) = store_from_url(&url)?;
        assert!(target.is_dir());
        assert_eq!(prefix, Path::default());
        Ok(())
    }

    #[test]
    fn rejects_unknown_scheme() {
        let err = store_from_str("ftp://example.com/shuffle").unwrap_err();
        assert!(matches!(err, ShuffleError::Configuration(_)));
    }
}
