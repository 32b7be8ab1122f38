//! Deferred deletion of superseded segments.
//!
//! Rewriting or cleaving a segment leaves its previous blob in storage for
//! readers that still hold the old directory. The blob's key is queued here
//! and only deleted once the retirement age has passed:
//!
//! ```text
//!   add(t0) ──► Pending ──(now - age >= t0)──► Due ──(deleted)──► Removed
//! ```
//!
//! The queue is ordered by insertion time, so the due set is always a
//! prefix.

pub mod service;

pub use service::SegmentRetirementTask;

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use crossbeam_skiplist::SkipMap;
use uuid::Uuid;

use crate::storage::SpatialAffinityKey;

/// A superseded segment blob awaiting deletion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetirementEntry {
    pub project: Uuid,
    pub key: SpatialAffinityKey,
    pub insert_utc: DateTime<Utc>,
    seq: u64,
}

impl RetirementEntry {
    fn queue_key(&self) -> (DateTime<Utc>, u64) {
        (self.insert_utc, self.seq)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetirementState {
    /// Queued, still inside the retirement window
    Pending,
    /// Queued, old enough to delete
    Due,
    /// No longer queued
    Removed,
}

/// Lock-free queue of retirement entries ordered by insertion time.
#[derive(Debug, Default)]
pub struct SegmentRetirementQueue {
    entries: SkipMap<(DateTime<Utc>, u64), RetirementEntry>,
    next_seq: AtomicU64,
}

impl SegmentRetirementQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `key` as superseded at `insert_utc`.
    pub fn add(
        &self,
        project: Uuid,
        key: SpatialAffinityKey,
        insert_utc: DateTime<Utc>,
    ) -> RetirementEntry {
        let entry = RetirementEntry {
            project,
            key,
            insert_utc,
            seq: self.next_seq.fetch_add(1, Ordering::SeqCst),
        };
        self.entries.insert(entry.queue_key(), entry.clone());
        entry
    }

    pub fn add_all(
        &self,
        project: Uuid,
        keys: impl IntoIterator<Item = SpatialAffinityKey>,
        insert_utc: DateTime<Utc>,
    ) -> usize {
        keys.into_iter()
            .map(|key| self.add(project, key, insert_utc))
            .count()
    }

    /// Entries inserted at or before `cutoff`, oldest first.
    pub fn query(&self, cutoff: DateTime<Utc>) -> Vec<RetirementEntry> {
        let upper = (cutoff, u64::MAX);
        self.entries
            .range(..=upper)
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn remove(&self, entries: &[RetirementEntry]) -> usize {
        entries
            .iter()
            .filter(|entry| self.entries.remove(&entry.queue_key()).is_some())
            .count()
    }

    pub fn state(&self, entry: &RetirementEntry, cutoff: DateTime<Utc>) -> RetirementState {
        if !self.entries.contains_key(&entry.queue_key()) {
            RetirementState::Removed
        } else if entry.insert_utc <= cutoff {
            RetirementState::Due
        } else {
            RetirementState::Pending
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subgrid::CellAddress;
    use chrono::Duration;

    fn key(segment: &str) -> SpatialAffinityKey {
        SpatialAffinityKey::new(Uuid::nil(), CellAddress::new(32, 32)).with_segment(segment)
    }

    #[test]
    fn test_query_returns_due_prefix_in_order() {
        let queue = SegmentRetirementQueue::new();
        let base = Utc::now();

        queue.add(Uuid::nil(), key("3-0-1"), base + Duration::seconds(2));
        queue.add(Uuid::nil(), key("1-0-1"), base);
        queue.add(Uuid::nil(), key("2-0-1"), base);
        assert_eq!(queue.len(), 3);

        let due = queue.query(base);
        let segments: Vec<_> = due.iter().map(|e| e.key.segment.clone().unwrap()).collect();
        assert_eq!(segments, vec!["1-0-1", "2-0-1"]);

        assert!(queue.query(base - Duration::milliseconds(1)).is_empty());
        assert_eq!(queue.query(base + Duration::seconds(2)).len(), 3);
    }

    #[test]
    fn test_query_and_state_agree_below_a_millisecond() {
        let queue = SegmentRetirementQueue::new();
        let cutoff = DateTime::from_timestamp(1_700_000_000, 500_000).unwrap();
        let early = queue.add(Uuid::nil(), key("1-0-1"), cutoff);
        let late = queue.add(Uuid::nil(), key("2-0-1"), cutoff + Duration::microseconds(300));

        assert_eq!(queue.query(cutoff), vec![early.clone()]);
        assert_eq!(queue.state(&early, cutoff), RetirementState::Due);
        assert_eq!(queue.state(&late, cutoff), RetirementState::Pending);
    }

    #[test]
    fn test_state_machine() {
        let queue = SegmentRetirementQueue::new();
        let inserted = Utc::now();
        let entry = queue.add(Uuid::nil(), key("1-0-1"), inserted);

        assert_eq!(
            queue.state(&entry, inserted - Duration::seconds(1)),
            RetirementState::Pending
        );
        assert_eq!(queue.state(&entry, inserted), RetirementState::Due);

        assert_eq!(queue.remove(&[entry.clone()]), 1);
        assert_eq!(queue.state(&entry, inserted), RetirementState::Removed);
        assert_eq!(queue.remove(&[entry]), 0);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_same_key_queued_twice_is_two_entries() {
        let queue = SegmentRetirementQueue::new();
        let now = Utc::now();
        let added = queue.add_all(Uuid::nil(), vec![key("1-0-1"), key("1-0-1")], now);
        assert_eq!(added, 2);
        assert_eq!(queue.len(), 2);
    }
}
