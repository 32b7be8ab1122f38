use std::sync::Arc;

use super::kv::{KvStore, WriteBatch};
use super::{
    non_spatial_store_key, spatial_store_key, CommitCounts, ImmutableChain, MutabilityConverter,
    NonSpatialAffinityKey, Revert, SpatialAffinityKey, StorageMutability, StorageProxy,
    StreamKind,
};
use crate::error::Result;

/// Pass-through proxy: every write lands in the store immediately.
pub struct DirectProxy {
    store: Arc<dyn KvStore>,
    mutability: StorageMutability,
    chain: Option<ImmutableChain>,
}

impl DirectProxy {
    pub fn new(store: Arc<dyn KvStore>, mutability: StorageMutability) -> Self {
        Self {
            store,
            mutability,
            chain: None,
        }
    }

    /// Mirrors every write into `immutable` after conversion.
    pub fn with_immutable(
        mut self,
        immutable: Arc<dyn StorageProxy>,
        converter: Arc<dyn MutabilityConverter>,
    ) -> Self {
        self.chain = Some(ImmutableChain {
            proxy: immutable,
            converter,
        });
        self
    }

    fn put(&self, key: String, bytes: Vec<u8>) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.put(key, bytes);
        self.store.apply(&batch)
    }

    fn delete(&self, key: String) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.remove(key);
        self.store.apply(&batch)
    }
}

impl StorageProxy for DirectProxy {
    fn mutability(&self) -> StorageMutability {
        self.mutability
    }

    fn read_spatial(&self, key: &SpatialAffinityKey, kind: StreamKind) -> Result<Option<Vec<u8>>> {
        match self.store.get(&spatial_store_key(key))? {
            Some(bytes) => Ok(Some(bytes)),
            None => match &self.chain {
                Some(chain) => chain.proxy.read_spatial(key, kind),
                None => Ok(None),
            },
        }
    }

    fn write_spatial(
        &self,
        key: &SpatialAffinityKey,
        kind: StreamKind,
        bytes: Vec<u8>,
    ) -> Result<()> {
        if let Some(chain) = &self.chain {
            chain.write_spatial(key, kind, &bytes)?;
        }
        self.put(spatial_store_key(key), bytes)
    }

    fn remove_spatial(&self, key: &SpatialAffinityKey) -> Result<()> {
        if let Some(chain) = &self.chain {
            chain.proxy.remove_spatial(key)?;
        }
        self.delete(spatial_store_key(key))
    }

    fn read_non_spatial(
        &self,
        key: &NonSpatialAffinityKey,
        kind: StreamKind,
    ) -> Result<Option<Vec<u8>>> {
        match self.store.get(&non_spatial_store_key(key))? {
            Some(bytes) => Ok(Some(bytes)),
            None => match &self.chain {
                Some(chain) => chain.proxy.read_non_spatial(key, kind),
                None => Ok(None),
            },
        }
    }

    fn write_non_spatial(
        &self,
        key: &NonSpatialAffinityKey,
        kind: StreamKind,
        bytes: Vec<u8>,
    ) -> Result<()> {
        if let Some(chain) = &self.chain {
            chain.write_non_spatial(key, kind, &bytes)?;
        }
        self.put(non_spatial_store_key(key), bytes)
    }

    fn remove_non_spatial(&self, key: &NonSpatialAffinityKey) -> Result<()> {
        if let Some(chain) = &self.chain {
            chain.proxy.remove_non_spatial(key)?;
        }
        self.delete(non_spatial_store_key(key))
    }

    fn commit_with_counts(&self) -> Result<CommitCounts> {
        Ok(CommitCounts::default())
    }

    // Writes are already in the store; there is no buffer to undo
    fn commit_reversible(&self) -> Result<(CommitCounts, Revert)> {
        Ok((CommitCounts::default(), Revert::default()))
    }

    fn revert(&self, revert: Revert) -> Result<()> {
        if revert.undo.is_empty() {
            return Ok(());
        }
        self.store.apply(&revert.undo)
    }

    fn clear(&self) {}

    fn immutable(&self) -> Option<&Arc<dyn StorageProxy>> {
        self.chain.as_ref().map(|chain| &chain.proxy)
    }
}
