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

//! Client used to move whole shuffle blocks to and from the remote store.

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, trace};
use object_store::path::Path;
use object_store::{ObjectStore, PutPayload};

use crate::block::ShuffleBlockId;
use crate::error::{Result, ShuffleError};

/// Remote reads, writes and deletes of shuffle blocks.
///
/// Implementations are shared between fetch iterators and map output
/// writers, so they must be safe for concurrent use. Retries and backoff are
/// the implementation's concern, a returned error is final.
#[async_trait]
pub trait RemoteBlockClient: Send + Sync + Debug {
    /// Fetches the complete content of a block.
    async fn get(&self, block_id: &ShuffleBlockId) -> Result<Bytes>;

    /// Stores `data` as the content of a block, returning the number of
    /// bytes the store accepted.
    async fn put(&self, block_id: &ShuffleBlockId, data: Bytes) -> Result<u64>;

    /// Removes a block. Removing a block that does not exist is not an error.
    async fn delete(&self, block_id: &ShuffleBlockId) -> Result<()>;
}

/// [RemoteBlockClient] on top of an [ObjectStore].
///
/// Block `shuffle_{s}_{m}_{r}` is stored at `{prefix}/{s}/{m}/{r}.data`.
#[derive(Debug, Clone)]
pub struct ObjectStoreBlockClient {
    store: Arc<dyn ObjectStore>,
    prefix: Path,
}

impl ObjectStoreBlockClient {
    /// Creates a client placing blocks under `prefix` in `store`.
    pub fn new(store: Arc<dyn ObjectStore>, prefix: Path) -> Self {
        Self { store, prefix }
    }

    /// Creates a client for a store URL, see [crate::object_store::store_from_str].
    pub fn try_from_url(url: &str) -> Result<Self> {
        let (store, prefix) = crate::object_store::store_from_str(url)?;
        Ok(Self::new(store, prefix))
    }

    /// Location of a block in the store.
    pub fn block_path(&self, block_id: &ShuffleBlockId) -> Path {
        self.prefix
            .child(block_id.shuffle_id.to_string())
            .child(block_id.map_id.to_string())
            .child(format!("{}.data", block_id.reduce_id))
    }
}

fn remote_io(block_id: &ShuffleBlockId, e: object_store::Error) -> ShuffleError {
    ShuffleError::RemoteIo(block_id.clone(), Box::new(e))
}

#[async_trait]
impl RemoteBlockClient for ObjectStoreBlockClient {
    async fn get(&self, block_id: &ShuffleBlockId) -> Result<Bytes> {
        let path = self.block_path(block_id);
        trace!("fetching block {block_id} from {path}");
        let result = self
            .store
            .get(&path)
            .await
            .map_err(|e| remote_io(block_id, e))?;
        result.bytes().await.map_err(|e| remote_io(block_id, e))
    }

    async fn put(&self, block_id: &ShuffleBlockId, data: Bytes) -> Result<u64> {
        let path = self.block_path(block_id);
        let len = data.len() as u64;
        trace!("uploading block {block_id} ({len} bytes) to {path}");
        self.store
            .put(&path, PutPayload::from(data))
            .await
            .map_err(|e| remote_io(block_id, e))?;
        Ok(len)
    }

    async fn delete(&self, block_id: &ShuffleBlockId) -> Result<()> {
        let path = self.block_path(block_id);
        match self.store.delete(&path).await {
            Ok(()) => Ok(()),
            Err(object_store::Error::NotFound { .. }) => {
                debug!("block {block_id} already absent from {path}");
                Ok(())
            }
            Err(e) => Err(remote_io(block_id, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::memory::InMemory;

    fn client() -> ObjectStoreBlockClient {
        ObjectStoreBlockClient::new(Arc::new(InMemory::new()), Path::from("shuffle"))
    }

    #[test]
    fn block_path_layout() {
        let path = client().block_path(&ShuffleBlockId::new(3, 17, 4));
        assert_eq!(path.as_ref(), "shuffle/3/17/4.data");
    }

    #[tokio::test]
    async fn put_get_delete() -> Result<()> {
        let client = client();
        let block_id = ShuffleBlockId::new(1, 2, 3);

        let written = client
            .put(&block_id, Bytes::from_static(b"partition bytes"))
            .await?;
        assert_eq!(written, 15);
        assert_eq!(client.get(&block_id).await?.as_ref(), b"partition bytes");

        client.delete(&block_id).await?;
        client.delete(&block_id).await?;
        Ok(())
    }

    #[tokio::test]
    async fn missing_block_is_remote_io() {
        let block_id = ShuffleBlockId::new(9, 9, 9);
        let err = client().get(&block_id).await.unwrap_err();
        match err {
            ShuffleError::RemoteIo(id, cause) => {
                assert_eq!(id, block_id);
                assert!(cause.to_string().contains("not found"), "{cause}");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }
}
