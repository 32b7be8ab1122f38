//! Storage proxies: the persistence boundary of the spatial index.
//!
//! Trees and the TAG pipeline never talk to a key-value store directly.
//! They read and write opaque blobs through a [`StorageProxy`] keyed by
//! affinity keys:
//!
//! ```text
//!             write_spatial(key, kind, bytes)
//!  caller ─────────────────────────────────────► mutable proxy ──► mutable KvStore
//!                                                    │
//!                                 MutabilityConverter│(segment form, compression)
//!                                                    ▼
//!                                              immutable proxy ──► immutable KvStore
//! ```
//!
//! The direct discipline writes through immediately. The transactional
//! discipline buffers writes and applies them as one atomic batch per
//! store on `commit`. The immutable side is committed first and reverted
//! if the mutable batch then fails, so a failed commit leaves both stores
//! as they were. Reads on a chained mutable proxy fall back to the
//! immutable proxy when the key is absent.

pub mod context;
pub mod converter;
pub mod direct;
pub mod file;
pub mod flock;
pub mod key;
pub mod kv;
pub mod transactional;

pub use context::StorageContext;
pub use converter::{MutabilityConverter, SegmentFormConverter};
pub use direct::DirectProxy;
pub use file::FileStore;
pub use key::{NonSpatialAffinityKey, SpatialAffinityKey};
pub use kv::{KvStore, MemoryStore, WriteBatch};
pub use transactional::TransactionalProxy;

use std::ops::AddAssign;
use std::sync::Arc;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageMutability {
    /// Write-optimised: uncompressed full pass stacks
    Mutable,
    /// Read-optimised: the configured segment form, optionally compressed
    Immutable,
}

/// What a blob holds. Drives conversion between the mutable and immutable
/// representations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Directory,
    SegmentPasses,
    ExistenceMap,
    Metadata,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitCounts {
    pub puts: usize,
    pub removes: usize,
    pub bytes: u64,
}

impl AddAssign for CommitCounts {
    fn add_assign(&mut self, other: Self) {
        self.puts += other.puts;
        self.removes += other.removes;
        self.bytes += other.bytes;
    }
}

/// A committed batch together with the batch that undoes it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Revert {
    pub applied: WriteBatch,
    pub undo: WriteBatch,
}

/// Read/write access to spatial and non-spatial blobs.
pub trait StorageProxy: Send + Sync {
    fn mutability(&self) -> StorageMutability;

    fn read_spatial(&self, key: &SpatialAffinityKey, kind: StreamKind) -> Result<Option<Vec<u8>>>;

    fn write_spatial(&self, key: &SpatialAffinityKey, kind: StreamKind, bytes: Vec<u8>)
        -> Result<()>;

    fn remove_spatial(&self, key: &SpatialAffinityKey) -> Result<()>;

    fn read_non_spatial(
        &self,
        key: &NonSpatialAffinityKey,
        kind: StreamKind,
    ) -> Result<Option<Vec<u8>>>;

    fn write_non_spatial(
        &self,
        key: &NonSpatialAffinityKey,
        kind: StreamKind,
        bytes: Vec<u8>,
    ) -> Result<()>;

    fn remove_non_spatial(&self, key: &NonSpatialAffinityKey) -> Result<()>;

    fn commit(&self) -> Result<()> {
        self.commit_with_counts().map(|_| ())
    }

    fn commit_with_counts(&self) -> Result<CommitCounts>;

    /// Commits this proxy's own buffer and returns what is needed to undo
    /// it. A chained proxy underneath is not committed.
    fn commit_reversible(&self) -> Result<(CommitCounts, Revert)>;

    /// Restores the values a `commit_reversible` overwrote. Buffered proxies
    /// also restage the reverted writes so a later commit can retry them.
    fn revert(&self, revert: Revert) -> Result<()>;

    /// Drops uncommitted writes. A no-op for direct proxies.
    fn clear(&self);

    /// Proxy chained underneath this one, if any.
    fn immutable(&self) -> Option<&Arc<dyn StorageProxy>>;
}

pub(crate) fn spatial_store_key(key: &SpatialAffinityKey) -> String {
    format!("s:{}", key)
}

pub(crate) fn non_spatial_store_key(key: &NonSpatialAffinityKey) -> String {
    format!("n:{}", key)
}

/// The immutable half of a mutable proxy, with the converter feeding it.
#[derive(Clone)]
pub(crate) struct ImmutableChain {
    pub proxy: Arc<dyn StorageProxy>,
    pub converter: Arc<dyn MutabilityConverter>,
}

impl ImmutableChain {
    pub fn write_spatial(&self, key: &SpatialAffinityKey, kind: StreamKind, bytes: &[u8]) -> Result<()> {
        if let Some(converted) = self.converter.convert(kind, bytes)? {
            self.proxy.write_spatial(key, kind, converted)?;
        }
        Ok(())
    }

    pub fn write_non_spatial(
        &self,
        key: &NonSpatialAffinityKey,
        kind: StreamKind,
        bytes: &[u8],
    ) -> Result<()> {
        if let Some(converted) = self.converter.convert(kind, bytes)? {
            self.proxy.write_non_spatial(key, kind, converted)?;
        }
        Ok(())
    }
}
