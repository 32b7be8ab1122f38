use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;

/// Identity of a buffered file. A key is queued at most once.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueKey {
    pub file_name: String,
    pub project: Uuid,
    pub asset: Uuid,
}

#[derive(Debug, Clone)]
pub struct QueuedTagFile {
    pub key: QueueKey,
    pub content: Arc<Vec<u8>>,
    pub submitted_utc: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    order: VecDeque<QueueKey>,
    files: HashMap<QueueKey, QueuedTagFile>,
}

/// Files accepted for processing, in arrival order.
#[derive(Default)]
pub struct TagFileBufferQueue {
    inner: Mutex<Inner>,
}

impl TagFileBufferQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `file` unless its key is already queued. Returns whether it
    /// was added; an existing entry is left untouched.
    pub fn add(&self, file: QueuedTagFile) -> Result<bool> {
        let mut inner = self.inner.lock()?;
        if inner.files.contains_key(&file.key) {
            return Ok(false);
        }
        inner.order.push_back(file.key.clone());
        inner.files.insert(file.key.clone(), file);
        Ok(true)
    }

    /// Up to `max` files of the project whose file has waited longest,
    /// oldest first. `None` when the queue is empty.
    pub fn take_batch(&self, max: usize) -> Result<Option<(Uuid, Vec<QueuedTagFile>)>> {
        let mut inner = self.inner.lock()?;
        let project = match inner.order.front() {
            Some(key) => key.project,
            None => return Ok(None),
        };

        let mut taken = Vec::new();
        let mut remaining = VecDeque::with_capacity(inner.order.len());
        while let Some(key) = inner.order.pop_front() {
            if key.project == project && taken.len() < max.max(1) {
                if let Some(file) = inner.files.remove(&key) {
                    taken.push(file);
                }
            } else {
                remaining.push_back(key);
            }
        }
        inner.order = remaining;
        Ok(Some((project, taken)))
    }

    pub fn contains(&self, key: &QueueKey) -> Result<bool> {
        Ok(self.inner.lock()?.files.contains_key(key))
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.inner.lock()?.files.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(name: &str, project: Uuid, content: &[u8]) -> QueuedTagFile {
        QueuedTagFile {
            key: QueueKey {
                file_name: name.to_string(),
                project,
                asset: Uuid::nil(),
            },
            content: Arc::new(content.to_vec()),
            submitted_utc: Utc::now(),
        }
    }

    #[test]
    fn test_duplicate_key_keeps_first_entry() -> Result<()> {
        let queue = TagFileBufferQueue::new();
        let project = Uuid::new_v4();

        assert!(queue.add(file("a.tag", project, b"first"))?);
        assert!(!queue.add(file("a.tag", project, b"second"))?);
        assert!(queue.add(file("a.tag", Uuid::new_v4(), b"other project"))?);
        assert_eq!(queue.len()?, 2);

        let (_, batch) = queue.take_batch(10)?.expect("batch");
        assert_eq!(batch[0].content.as_slice(), b"first");
        Ok(())
    }

    #[test]
    fn test_batches_group_by_oldest_project() -> Result<()> {
        let queue = TagFileBufferQueue::new();
        let (p1, p2) = (Uuid::new_v4(), Uuid::new_v4());
        queue.add(file("1.tag", p1, b""))?;
        queue.add(file("2.tag", p2, b""))?;
        queue.add(file("3.tag", p1, b""))?;
        queue.add(file("4.tag", p1, b""))?;

        let (project, batch) = queue.take_batch(2)?.expect("batch");
        assert_eq!(project, p1);
        let names: Vec<_> = batch.iter().map(|f| f.key.file_name.as_str()).collect();
        assert_eq!(names, vec!["1.tag", "3.tag"]);

        let (project, batch) = queue.take_batch(2)?.expect("batch");
        assert_eq!(project, p2);
        assert_eq!(batch.len(), 1);

        let (project, batch) = queue.take_batch(2)?.expect("batch");
        assert_eq!(project, p1);
        assert_eq!(batch[0].key.file_name, "4.tag");

        assert!(queue.take_batch(2)?.is_none());
        assert!(queue.is_empty()?);

        // A processed key can be submitted again
        assert!(queue.add(file("1.tag", p1, b""))?);
        Ok(())
    }
}
