use std::collections::BTreeMap;
use std::sync::RwLock;

use crate::error::Result;

/// Ordered set of puts and removes applied as one unit. The last operation
/// recorded for a key wins.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteBatch {
    ops: BTreeMap<String, Option<Vec<u8>>>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: impl Into<String>, value: Vec<u8>) {
        self.ops.insert(key.into(), Some(value));
    }

    pub fn remove(&mut self, key: impl Into<String>) {
        self.ops.insert(key.into(), None);
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Option<Vec<u8>>)> {
        self.ops.iter()
    }
}

impl FromIterator<(String, Option<Vec<u8>>)> for WriteBatch {
    fn from_iter<I: IntoIterator<Item = (String, Option<Vec<u8>>)>>(iter: I) -> Self {
        Self {
            ops: iter.into_iter().collect(),
        }
    }
}

/// Key-value substrate under the storage proxies.
///
/// `apply` must be atomic: after an error no operation of the batch is
/// visible.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    fn apply(&self, batch: &WriteBatch) -> Result<()>;

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>>;

    fn len(&self) -> Result<usize>;

    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

/// In-process store. Batches are applied under one write lock.
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.data.read()?.get(key).cloned())
    }

    fn apply(&self, batch: &WriteBatch) -> Result<()> {
        let mut data = self.data.write()?;
        for (key, value) in batch.iter() {
            match value {
                Some(value) => data.insert(key.clone(), value.clone()),
                None => data.remove(key),
            };
        }
        Ok(())
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .data
            .read()?
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect())
    }

    fn len(&self) -> Result<usize> {
        Ok(self.data.read()?.len())
    }
}

/// Memory store whose next `apply` calls fail without touching the data.
/// Reads can be failed too.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct FlakyStore {
    pub inner: MemoryStore,
    failures: std::sync::atomic::AtomicUsize,
    failing_reads: std::sync::atomic::AtomicBool,
}

#[cfg(test)]
impl FlakyStore {
    pub fn fail_next(&self, count: usize) {
        self.failures
            .store(count, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn fail_reads(&self, failing: bool) {
        self.failing_reads
            .store(failing, std::sync::atomic::Ordering::SeqCst);
    }
}

#[cfg(test)]
impl KvStore for FlakyStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        if self.failing_reads.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(std::io::Error::new(std::io::ErrorKind::Other, "injected read failure").into());
        }
        self.inner.get(key)
    }

    fn apply(&self, batch: &WriteBatch) -> Result<()> {
        use std::sync::atomic::Ordering;

        let armed = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if armed {
            return Err(std::io::Error::new(std::io::ErrorKind::Other, "injected failure").into());
        }
        self.inner.apply(batch)
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        self.inner.keys_with_prefix(prefix)
    }

    fn len(&self) -> Result<usize> {
        self.inner.len()
    }
}
