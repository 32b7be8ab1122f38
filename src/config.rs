use std::time::Duration;

use crate::segment::SegmentForm;
use crate::subgrid::{DEFAULT_CELL_SIZE, DEFAULT_TREE_LEVELS};

/// Configuration for a tagdb instance
#[derive(Debug, Clone)]
pub struct TagDbConfig {
    /// Ground size of one cell in metres (default: 0.34)
    pub cell_size: f64,

    /// Number of levels in every subgrid tree (default: 6)
    pub tree_levels: u8,

    /// A segment holding more passes than this is cleaved (default: 10 000)
    pub max_segment_cell_passes: u32,

    /// Segments below this pass count are never cleaved (default: 1 000)
    pub min_cleave_pass_count: u32,

    /// Compress segment blobs written to the immutable store (default: true)
    pub compress_immutable: bool,

    /// Form of segment blobs written to the immutable store
    pub immutable_form: SegmentForm,

    /// Segment retirement settings
    pub retirement: RetirementConfig,

    /// TAG file buffer queue settings
    pub queue: QueueConfig,
}

#[derive(Debug, Clone)]
pub struct RetirementConfig {
    /// Minimum age of a superseded segment before it is deleted (default: 10min)
    pub retirement_age: Duration,

    /// How often the retirement task wakes (default: 30s)
    pub interval: Duration,
}

impl Default for RetirementConfig {
    fn default() -> Self {
        Self {
            retirement_age: Duration::from_secs(10 * 60),
            interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// How long the consumer sleeps when the queue is empty (default: 250ms)
    pub poll_interval: Duration,

    /// Maximum files taken from the queue per cycle (default: 20)
    pub max_files_per_batch: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(250),
            max_files_per_batch: 20,
        }
    }
}

impl Default for TagDbConfig {
    fn default() -> Self {
        Self {
            cell_size: DEFAULT_CELL_SIZE,
            tree_levels: DEFAULT_TREE_LEVELS,
            max_segment_cell_passes: 10_000,
            min_cleave_pass_count: 1_000,
            compress_immutable: true,
            immutable_form: SegmentForm::FullPassStack,
            retirement: RetirementConfig::default(),
            queue: QueueConfig::default(),
        }
    }
}

impl TagDbConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the cell size in metres
    pub fn cell_size(mut self, size: f64) -> Self {
        self.cell_size = size;
        self
    }

    /// Set the number of tree levels
    pub fn tree_levels(mut self, levels: u8) -> Self {
        self.tree_levels = levels;
        self
    }

    /// Set the segment cleaving threshold
    pub fn max_segment_cell_passes(mut self, limit: u32) -> Self {
        self.max_segment_cell_passes = limit;
        self
    }

    /// Set the smallest segment eligible for cleaving
    pub fn min_cleave_pass_count(mut self, count: u32) -> Self {
        self.min_cleave_pass_count = count;
        self
    }

    /// Enable or disable immutable segment compression
    pub fn compress_immutable(mut self, enabled: bool) -> Self {
        self.compress_immutable = enabled;
        self
    }

    /// Set the form of immutable segment blobs
    pub fn immutable_form(mut self, form: SegmentForm) -> Self {
        self.immutable_form = form;
        self
    }

    /// Configure segment retirement
    pub fn retirement(mut self, config: RetirementConfig) -> Self {
        self.retirement = config;
        self
    }

    /// Configure the TAG file buffer queue
    pub fn queue(mut self, config: QueueConfig) -> Self {
        self.queue = config;
        self
    }
}

impl RetirementConfig {
    /// Set the retirement consistency window
    pub fn retirement_age(mut self, age: Duration) -> Self {
        self.retirement_age = age;
        self
    }

    /// Set the retirement task interval
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

impl QueueConfig {
    /// Set the empty-queue sleep
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the batch size
    pub fn max_files_per_batch(mut self, max: usize) -> Self {
        self.max_files_per_batch = max;
        self
    }
}
