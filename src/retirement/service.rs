use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::{RetirementEntry, SegmentRetirementQueue};
use crate::config::RetirementConfig;
use crate::error::{Error, Result};
use crate::scheduler::{BackgroundTask, Context};
use crate::storage::{StorageContext, StorageProxy};

/// Deletes due segment blobs from both stores.
///
/// Each cycle removes every due key in one transaction per store. Entries
/// leave the queue only after the commit succeeds; a failed cycle leaves
/// them queued for the next tick.
pub struct SegmentRetirementTask {
    queue: Arc<SegmentRetirementQueue>,
    storage: StorageContext,
    config: RetirementConfig,
}

impl SegmentRetirementTask {
    pub fn new(
        queue: Arc<SegmentRetirementQueue>,
        storage: StorageContext,
        config: RetirementConfig,
    ) -> Self {
        Self {
            queue,
            storage,
            config,
        }
    }

    /// Latest insertion time that is old enough to retire at `now`.
    pub fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match chrono::Duration::from_std(self.config.retirement_age) {
            Ok(age) => now.checked_sub_signed(age).unwrap_or(DateTime::<Utc>::MIN_UTC),
            Err(_) => DateTime::<Utc>::MIN_UTC,
        }
    }

    /// Runs one retirement cycle as of `now`. Returns the number of entries
    /// retired.
    pub fn retire_due(&self, now: DateTime<Utc>) -> Result<usize> {
        let due = self.queue.query(self.cutoff(now));
        if due.is_empty() {
            tracing::debug!(queued = self.queue.len(), "No segments due for retirement");
            return Ok(0);
        }

        self.delete(&due)?;
        let removed = self.queue.remove(&due);

        tracing::info!(
            retired = removed,
            remaining = self.queue.len(),
            "Retired superseded segments"
        );
        Ok(removed)
    }

    fn delete(&self, due: &[RetirementEntry]) -> Result<()> {
        let proxy = self.storage.transactional_proxy();
        for entry in due {
            if let Err(e) = proxy.remove_spatial(&entry.key) {
                proxy.clear();
                return Err(e);
            }
        }

        match proxy.commit() {
            Ok(()) => Ok(()),
            Err(e) => {
                proxy.clear();
                tracing::warn!(
                    due = due.len(),
                    error = %e,
                    "Failed to delete retired segments"
                );
                Err(Error::CommitFailed(format!("retirement cycle: {}", e)))
            }
        }
    }
}

#[async_trait::async_trait]
impl BackgroundTask for SegmentRetirementTask {
    fn name(&self) -> &'static str {
        "segment-retirement"
    }

    fn interval(&self) -> Duration {
        self.config.interval
    }

    async fn execute(&self, ctx: Context) -> Result<()> {
        let retired = self.retire_due(Utc::now())?;
        tracing::debug!(run_id = ctx.run_id, retired = retired, "Retirement cycle complete");
        Ok(())
    }
}
