use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use super::kv::{KvStore, WriteBatch};
use super::{
    non_spatial_store_key, spatial_store_key, CommitCounts, ImmutableChain, MutabilityConverter,
    NonSpatialAffinityKey, Revert, SpatialAffinityKey, StorageMutability, StorageProxy,
    StreamKind,
};
use crate::error::{Error, Result};

type Pending = BTreeMap<String, Option<Vec<u8>>>;

/// Buffers writes and applies them to the store as one atomic batch.
///
/// Reads see this proxy's pending writes first. A failed commit leaves
/// both stores untouched and keeps the buffers; the caller either retries
/// or calls `clear`.
pub struct TransactionalProxy {
    store: Arc<dyn KvStore>,
    mutability: StorageMutability,
    pending: Mutex<Pending>,
    chain: Option<ImmutableChain>,
}

impl TransactionalProxy {
    pub fn new(store: Arc<dyn KvStore>, mutability: StorageMutability) -> Self {
        Self {
            store,
            mutability,
            pending: Mutex::new(BTreeMap::new()),
            chain: None,
        }
    }

    /// Mirrors every write into `immutable` after conversion. The chained
    /// proxy is committed and cleared together with this one.
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

    /// Number of keys with uncommitted writes.
    pub fn pending_len(&self) -> usize {
        self.lock_pending().len()
    }

    fn lock_pending(&self) -> MutexGuard<'_, Pending> {
        // The buffer holds plain data; a panic elsewhere cannot leave it half-updated
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn read(&self, store_key: &str) -> Result<Option<Option<Vec<u8>>>> {
        if let Some(pending) = self.lock_pending().get(store_key) {
            return Ok(Some(pending.clone()));
        }
        Ok(self.store.get(store_key)?.map(Some))
    }

    fn stage(&self, store_key: String, value: Option<Vec<u8>>) {
        self.lock_pending().insert(store_key, value);
    }
}

impl StorageProxy for TransactionalProxy {
    fn mutability(&self) -> StorageMutability {
        self.mutability
    }

    fn read_spatial(&self, key: &SpatialAffinityKey, kind: StreamKind) -> Result<Option<Vec<u8>>> {
        match self.read(&spatial_store_key(key))? {
            Some(value) => Ok(value),
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
        self.stage(spatial_store_key(key), Some(bytes));
        Ok(())
    }

    fn remove_spatial(&self, key: &SpatialAffinityKey) -> Result<()> {
        if let Some(chain) = &self.chain {
            chain.proxy.remove_spatial(key)?;
        }
        self.stage(spatial_store_key(key), None);
        Ok(())
    }

    fn read_non_spatial(
        &self,
        key: &NonSpatialAffinityKey,
        kind: StreamKind,
    ) -> Result<Option<Vec<u8>>> {
        match self.read(&non_spatial_store_key(key))? {
            Some(value) => Ok(value),
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
        self.stage(non_spatial_store_key(key), Some(bytes));
        Ok(())
    }

    fn remove_non_spatial(&self, key: &NonSpatialAffinityKey) -> Result<()> {
        if let Some(chain) = &self.chain {
            chain.proxy.remove_non_spatial(key)?;
        }
        self.stage(non_spatial_store_key(key), None);
        Ok(())
    }

    fn commit_with_counts(&self) -> Result<CommitCounts> {
        // Immutable first: a mutable blob is never visible without its
        // immutable counterpart
        let (mut counts, revert) = match &self.chain {
            Some(chain) => chain.proxy.commit_reversible()?,
            None => (CommitCounts::default(), Revert::default()),
        };

        match self.commit_reversible() {
            Ok((own, _)) => {
                counts += own;
                Ok(counts)
            }
            Err(e) => {
                if let Some(chain) = &self.chain {
                    let keys = revert.undo.len();
                    if let Err(undo) = chain.proxy.revert(revert) {
                        tracing::error!(
                            keys,
                            error = %undo,
                            "Failed to revert immutable commit"
                        );
                    }
                }
                Err(e)
            }
        }
    }

    fn commit_reversible(&self) -> Result<(CommitCounts, Revert)> {
        let mut counts = CommitCounts::default();
        let mut pending = self.lock_pending();
        if pending.is_empty() {
            return Ok((counts, Revert::default()));
        }

        let applied: WriteBatch = pending
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        let mut undo = WriteBatch::new();
        for (key, _) in applied.iter() {
            match self.store.get(key) {
                Ok(Some(previous)) => undo.put(key.clone(), previous),
                Ok(None) => undo.remove(key.clone()),
                Err(e) => return Err(Error::CommitFailed(e.to_string())),
            }
        }

        if let Err(e) = self.store.apply(&applied) {
            tracing::error!(
                mutability = ?self.mutability,
                keys = applied.len(),
                error = %e,
                "Transactional commit failed"
            );
            return Err(Error::CommitFailed(e.to_string()));
        }

        for (_, value) in applied.iter() {
            match value {
                Some(bytes) => {
                    counts.puts += 1;
                    counts.bytes += bytes.len() as u64;
                }
                None => counts.removes += 1,
            }
        }
        pending.clear();

        tracing::debug!(
            mutability = ?self.mutability,
            puts = counts.puts,
            removes = counts.removes,
            bytes = counts.bytes,
            "Transaction committed"
        );
        Ok((counts, Revert { applied, undo }))
    }

    fn revert(&self, revert: Revert) -> Result<()> {
        if revert.undo.is_empty() {
            return Ok(());
        }
        self.store.apply(&revert.undo)?;

        // Writes staged since the commit are newer and stay
        let mut pending = self.lock_pending();
        for (key, value) in revert.applied.iter() {
            pending
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
        tracing::debug!(
            mutability = ?self.mutability,
            keys = revert.undo.len(),
            "Reverted committed batch"
        );
        Ok(())
    }

    fn clear(&self) {
        if let Some(chain) = &self.chain {
            chain.proxy.clear();
        }
        self.lock_pending().clear();
    }

    fn immutable(&self) -> Option<&Arc<dyn StorageProxy>> {
        self.chain.as_ref().map(|chain| &chain.proxy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::SegmentForm;
    use crate::storage::kv::FlakyStore;
    use crate::storage::{MemoryStore, SegmentFormConverter};
    use crate::subgrid::CellAddress;
    use uuid::Uuid;

    fn key(x: u32) -> SpatialAffinityKey {
        SpatialAffinityKey::new(Uuid::nil(), CellAddress::new(x, 0))
    }

    #[test]
    fn test_writes_buffer_until_commit() -> Result<()> {
        let store = Arc::new(MemoryStore::new());
        let proxy = TransactionalProxy::new(store.clone(), StorageMutability::Mutable);

        proxy.write_spatial(&key(0), StreamKind::ExistenceMap, b"a".to_vec())?;
        proxy.write_spatial(&key(32), StreamKind::ExistenceMap, b"b".to_vec())?;
        proxy.write_spatial(&key(0), StreamKind::ExistenceMap, b"c".to_vec())?;

        // Visible through the proxy, not in the store
        assert_eq!(
            proxy.read_spatial(&key(0), StreamKind::ExistenceMap)?,
            Some(b"c".to_vec())
        );
        assert!(store.is_empty()?);

        let counts = proxy.commit_with_counts()?;
        assert_eq!(counts.puts, 2);
        assert_eq!(counts.bytes, 2);
        assert_eq!(store.len()?, 2);
        assert_eq!(proxy.pending_len(), 0);
        Ok(())
    }

    #[test]
    fn test_pending_remove_hides_stored_value() -> Result<()> {
        let store = Arc::new(MemoryStore::new());
        let proxy = TransactionalProxy::new(store.clone(), StorageMutability::Mutable);
        proxy.write_spatial(&key(0), StreamKind::ExistenceMap, b"a".to_vec())?;
        proxy.commit()?;

        proxy.remove_spatial(&key(0))?;
        assert_eq!(proxy.read_spatial(&key(0), StreamKind::ExistenceMap)?, None);
        assert_eq!(store.len()?, 1);

        let counts = proxy.commit_with_counts()?;
        assert_eq!(counts.removes, 1);
        assert!(store.is_empty()?);
        Ok(())
    }

    #[test]
    fn test_failed_commit_leaves_store_unchanged_then_clear_and_retry() -> Result<()> {
        let store = Arc::new(FlakyStore::default());
        let proxy = TransactionalProxy::new(store.clone(), StorageMutability::Mutable);
        proxy.write_spatial(&key(0), StreamKind::ExistenceMap, b"before".to_vec())?;
        proxy.commit()?;

        proxy.write_spatial(&key(0), StreamKind::ExistenceMap, b"after".to_vec())?;
        proxy.write_spatial(&key(32), StreamKind::ExistenceMap, b"new".to_vec())?;
        store.fail_next(1);

        assert!(matches!(proxy.commit(), Err(Error::CommitFailed(_))));
        assert_eq!(store.get(&spatial_store_key(&key(0)))?, Some(b"before".to_vec()));
        assert_eq!(store.get(&spatial_store_key(&key(32)))?, None);
        assert_eq!(proxy.pending_len(), 2);

        proxy.clear();
        assert_eq!(
            proxy.read_spatial(&key(0), StreamKind::ExistenceMap)?,
            Some(b"before".to_vec())
        );

        proxy.write_spatial(&key(32), StreamKind::ExistenceMap, b"retry".to_vec())?;
        proxy.commit()?;
        assert_eq!(store.get(&spatial_store_key(&key(32)))?, Some(b"retry".to_vec()));
        Ok(())
    }

    #[test]
    fn test_chained_commit_and_clear() -> Result<()> {
        let mutable_store = Arc::new(MemoryStore::new());
        let immutable_store = Arc::new(MemoryStore::new());
        let immutable = Arc::new(TransactionalProxy::new(
            immutable_store.clone(),
            StorageMutability::Immutable,
        ));
        let proxy = TransactionalProxy::new(mutable_store.clone(), StorageMutability::Mutable)
            .with_immutable(
                immutable.clone(),
                Arc::new(SegmentFormConverter::new(SegmentForm::LatestPassGrid, true)),
            );

        let meta = NonSpatialAffinityKey::new(Uuid::nil(), "Machines");
        proxy.write_non_spatial(&meta, StreamKind::Metadata, b"m".to_vec())?;
        assert_eq!(immutable.pending_len(), 1);

        proxy.clear();
        assert_eq!(immutable.pending_len(), 0);

        proxy.write_non_spatial(&meta, StreamKind::Metadata, b"m".to_vec())?;
        let counts = proxy.commit_with_counts()?;
        assert_eq!(counts.puts, 2);
        assert_eq!(mutable_store.len()?, 1);
        assert_eq!(immutable_store.len()?, 1);
        Ok(())
    }

    #[test]
    fn test_failed_mutable_commit_reverts_immutable() -> Result<()> {
        let mutable_store = Arc::new(FlakyStore::default());
        let immutable_store = Arc::new(MemoryStore::new());
        let immutable = Arc::new(TransactionalProxy::new(
            immutable_store.clone(),
            StorageMutability::Immutable,
        ));
        let proxy = TransactionalProxy::new(mutable_store.clone(), StorageMutability::Mutable)
            .with_immutable(
                immutable.clone(),
                Arc::new(SegmentFormConverter::new(SegmentForm::LatestPassGrid, true)),
            );

        let meta = NonSpatialAffinityKey::new(Uuid::nil(), "Machines");
        let other = NonSpatialAffinityKey::new(Uuid::nil(), "Designs");
        proxy.write_non_spatial(&meta, StreamKind::Metadata, b"before".to_vec())?;
        proxy.commit()?;

        proxy.write_non_spatial(&meta, StreamKind::Metadata, b"after".to_vec())?;
        proxy.write_non_spatial(&other, StreamKind::Metadata, b"new".to_vec())?;
        mutable_store.fail_next(1);
        assert!(matches!(proxy.commit(), Err(Error::CommitFailed(_))));

        // Neither store moved, and nothing leaks through the fallback read
        assert_eq!(immutable_store.len()?, 1);
        assert_eq!(
            immutable_store.get(&non_spatial_store_key(&meta))?,
            Some(b"before".to_vec())
        );
        assert_eq!(mutable_store.len()?, 1);
        assert_eq!(immutable.pending_len(), 2);

        proxy.clear();
        assert_eq!(proxy.read_non_spatial(&other, StreamKind::Metadata)?, None);
        assert_eq!(
            proxy.read_non_spatial(&meta, StreamKind::Metadata)?,
            Some(b"before".to_vec())
        );
        Ok(())
    }

    #[test]
    fn test_failed_chained_commit_can_be_retried() -> Result<()> {
        let mutable_store = Arc::new(FlakyStore::default());
        let immutable_store = Arc::new(MemoryStore::new());
        let proxy = TransactionalProxy::new(mutable_store.clone(), StorageMutability::Mutable)
            .with_immutable(
                Arc::new(TransactionalProxy::new(
                    immutable_store.clone(),
                    StorageMutability::Immutable,
                )),
                Arc::new(SegmentFormConverter::new(SegmentForm::LatestPassGrid, true)),
            );

        let meta = NonSpatialAffinityKey::new(Uuid::nil(), "Machines");
        proxy.write_non_spatial(&meta, StreamKind::Metadata, b"m".to_vec())?;
        mutable_store.fail_next(1);
        assert!(proxy.commit().is_err());
        assert!(immutable_store.is_empty()?);

        let counts = proxy.commit_with_counts()?;
        assert_eq!(counts.puts, 2);
        assert_eq!(mutable_store.len()?, 1);
        assert_eq!(immutable_store.len()?, 1);
        Ok(())
    }
}
