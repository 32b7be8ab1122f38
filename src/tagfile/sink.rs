use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::matchers::{MatcherRegistry, ValueMatcher, ValueMatcherTarget};
use super::TagDictionaryEntry;

/// Receives decoded values from [`super::TagFileReader`]. Returning `false`
/// from any read stops the reader with `ProcessingAborted`.
pub trait TagValueSink {
    fn starting(&mut self) -> bool {
        true
    }

    fn read_empty(&mut self, entry: &TagDictionaryEntry) -> bool;

    fn read_integer(&mut self, entry: &TagDictionaryEntry, value: i32) -> bool;

    fn read_unsigned(&mut self, entry: &TagDictionaryEntry, value: u32) -> bool;

    fn read_single(&mut self, entry: &TagDictionaryEntry, value: f32) -> bool;

    fn read_double(&mut self, entry: &TagDictionaryEntry, value: f64) -> bool;

    fn read_ansi(&mut self, entry: &TagDictionaryEntry, value: &[u8]) -> bool;

    fn read_unicode(&mut self, entry: &TagDictionaryEntry, value: &str) -> bool;

    fn finishing(&mut self) -> bool {
        true
    }

    /// Called instead of `finishing` when reading stops early.
    fn aborted(&mut self) {}
}

/// Routes values to the registry's matchers by dictionary name.
///
/// Names without a matcher are counted and skipped, as are values whose
/// payload type the matcher does not accept.
pub struct MatcherSink<T: ValueMatcherTarget> {
    registry: Arc<MatcherRegistry>,
    target: T,
    unknown: BTreeMap<String, u64>,
    rejected: u64,
    cancel: Option<Arc<AtomicBool>>,
}

impl<T: ValueMatcherTarget> MatcherSink<T> {
    pub fn new(registry: Arc<MatcherRegistry>, target: T) -> Self {
        Self {
            registry,
            target,
            unknown: BTreeMap::new(),
            rejected: 0,
            cancel: None,
        }
    }

    /// Aborts reading at the next value once `flag` is set.
    pub fn with_cancellation(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    pub fn target(&self) -> &T {
        &self.target
    }

    pub fn into_target(self) -> T {
        self.target
    }

    /// Occurrences of each name that had no matcher.
    pub fn unknown_values(&self) -> &BTreeMap<String, u64> {
        &self.unknown
    }

    pub fn rejected_values(&self) -> u64 {
        self.rejected
    }

    fn dispatch(
        &mut self,
        entry: &TagDictionaryEntry,
        apply: impl FnOnce(&dyn ValueMatcher, &mut dyn ValueMatcherTarget) -> bool,
    ) -> bool {
        if self
            .cancel
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Relaxed))
        {
            return false;
        }

        match self.registry.get(&entry.name) {
            Some(matcher) => {
                if !apply(matcher.as_ref(), &mut self.target) {
                    self.rejected += 1;
                }
            }
            None => *self.unknown.entry(entry.name.clone()).or_default() += 1,
        }
        true
    }
}

impl<T: ValueMatcherTarget> TagValueSink for MatcherSink<T> {
    fn read_empty(&mut self, entry: &TagDictionaryEntry) -> bool {
        self.dispatch(entry, |m, t| m.process_empty(entry, t))
    }

    fn read_integer(&mut self, entry: &TagDictionaryEntry, value: i32) -> bool {
        self.dispatch(entry, |m, t| m.process_integer(entry, value, t))
    }

    fn read_unsigned(&mut self, entry: &TagDictionaryEntry, value: u32) -> bool {
        self.dispatch(entry, |m, t| m.process_unsigned(entry, value, t))
    }

    fn read_single(&mut self, entry: &TagDictionaryEntry, value: f32) -> bool {
        self.dispatch(entry, |m, t| m.process_single(entry, value, t))
    }

    fn read_double(&mut self, entry: &TagDictionaryEntry, value: f64) -> bool {
        self.dispatch(entry, |m, t| m.process_double(entry, value, t))
    }

    fn read_ansi(&mut self, entry: &TagDictionaryEntry, value: &[u8]) -> bool {
        self.dispatch(entry, |m, t| m.process_ansi(entry, value, t))
    }

    fn read_unicode(&mut self, entry: &TagDictionaryEntry, value: &str) -> bool {
        self.dispatch(entry, |m, t| m.process_unicode(entry, value, t))
    }

    /// Flushes the final epoch.
    fn finishing(&mut self) -> bool {
        if self.target.state().have_seen_a_time_value {
            self.target.process_epoch_context();
        }
        true
    }
}
