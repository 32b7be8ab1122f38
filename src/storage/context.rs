use std::path::Path;
use std::sync::Arc;

use super::{
    DirectProxy, FileStore, KvStore, MemoryStore, MutabilityConverter, SegmentFormConverter,
    StorageMutability, StorageProxy, TransactionalProxy,
};
use crate::config::TagDbConfig;
use crate::error::Result;

/// The mutable and immutable stores of one engine instance, and the
/// converter between them. Hands out proxies over both.
#[derive(Clone)]
pub struct StorageContext {
    mutable: Arc<dyn KvStore>,
    immutable: Arc<dyn KvStore>,
    converter: Arc<dyn MutabilityConverter>,
}

impl StorageContext {
    pub fn new(
        mutable: Arc<dyn KvStore>,
        immutable: Arc<dyn KvStore>,
        converter: Arc<dyn MutabilityConverter>,
    ) -> Self {
        Self {
            mutable,
            immutable,
            converter,
        }
    }

    pub fn in_memory(config: &TagDbConfig) -> Self {
        Self::new(
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryStore::new()),
            Arc::new(SegmentFormConverter::new(
                config.immutable_form,
                config.compress_immutable,
            )),
        )
    }

    /// File stores under `dir/mutable` and `dir/immutable`.
    pub fn open<P: AsRef<Path>>(dir: P, config: &TagDbConfig) -> Result<Self> {
        let dir = dir.as_ref();
        Ok(Self::new(
            Arc::new(FileStore::open(dir.join("mutable"))?),
            Arc::new(FileStore::open(dir.join("immutable"))?),
            Arc::new(SegmentFormConverter::new(
                config.immutable_form,
                config.compress_immutable,
            )),
        ))
    }

    pub fn mutable_store(&self) -> &Arc<dyn KvStore> {
        &self.mutable
    }

    pub fn immutable_store(&self) -> &Arc<dyn KvStore> {
        &self.immutable
    }

    /// Write-through proxy pair.
    pub fn direct_proxy(&self) -> DirectProxy {
        let immutable: Arc<dyn StorageProxy> = Arc::new(DirectProxy::new(
            self.immutable.clone(),
            StorageMutability::Immutable,
        ));
        DirectProxy::new(self.mutable.clone(), StorageMutability::Mutable)
            .with_immutable(immutable, self.converter.clone())
    }

    /// Buffered proxy pair committed as one transaction per store.
    pub fn transactional_proxy(&self) -> TransactionalProxy {
        let immutable: Arc<dyn StorageProxy> = Arc::new(TransactionalProxy::new(
            self.immutable.clone(),
            StorageMutability::Immutable,
        ));
        TransactionalProxy::new(self.mutable.clone(), StorageMutability::Mutable)
            .with_immutable(immutable, self.converter.clone())
    }

    /// Read-only view over the immutable store alone.
    pub fn immutable_proxy(&self) -> DirectProxy {
        DirectProxy::new(self.immutable.clone(), StorageMutability::Immutable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cells::pass_at;
    use crate::segment::{CellPassStacks, SegmentBlob, SegmentForm};
    use crate::storage::{SpatialAffinityKey, StreamKind};
    use crate::subgrid::CellAddress;
    use uuid::Uuid;

    #[test]
    fn test_transactional_pair_writes_both_forms() -> Result<()> {
        let config = TagDbConfig::default().immutable_form(SegmentForm::LatestPassGrid);
        let context = StorageContext::in_memory(&config);

        let mut stacks = CellPassStacks::new();
        stacks.add(1, 1, pass_at(1_000, 4.0));
        let key = SpatialAffinityKey::new(Uuid::new_v4(), CellAddress::new(0, 0)).with_segment("1-0-1");

        let proxy = context.transactional_proxy();
        proxy.write_spatial(&key, StreamKind::SegmentPasses, SegmentBlob::full(stacks).encode(false))?;
        proxy.commit()?;

        let mutable = context
            .direct_proxy()
            .read_spatial(&key, StreamKind::SegmentPasses)?
            .expect("mutable segment");
        assert_eq!(SegmentBlob::decode(&mutable)?.form, SegmentForm::FullPassStack);

        let immutable = context
            .immutable_proxy()
            .read_spatial(&key, StreamKind::SegmentPasses)?
            .expect("immutable segment");
        assert_eq!(SegmentBlob::decode(&immutable)?.form, SegmentForm::LatestPassGrid);
        Ok(())
    }

    #[test]
    fn test_file_backed_context_reopens() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let config = TagDbConfig::default();
        let key = SpatialAffinityKey::new(Uuid::nil(), CellAddress::new(64, 64));
        {
            let context = StorageContext::open(dir.path(), &config)?;
            let proxy = context.transactional_proxy();
            proxy.write_spatial(&key, StreamKind::ExistenceMap, b"bits".to_vec())?;
            proxy.commit()?;
        }

        let context = StorageContext::open(dir.path(), &config)?;
        assert_eq!(context.mutable_store().len()?, 1);
        assert_eq!(context.immutable_store().len()?, 1);
        Ok(())
    }
}
