//! Server leaf subgrid: the owner of a 32×32 block's cell pass history.
//!
//! The leaf keeps its directory of segment descriptors in memory and loads
//! segment bodies lazily from a storage proxy. Every pass lands in the
//! segment whose half-open time range contains it:
//!
//! ```text
//!  add_pass(t)
//!      │
//!      ▼
//!  segment containing t? ──yes──► append to its stacks, mark dirty
//!      │ no (gap left by explicit allocation)
//!      ▼
//!  allocate [end of previous, start of next) and append there
//! ```
//!
//! Saving writes each dirty segment under a fresh identifier and reports
//! the identifiers it replaced so they can be retired.

use chrono::{DateTime, Utc};

use super::{Addressable, CellAddress, SUBGRID_TREE_DIMENSION};
use crate::cells::CellPass;
use crate::error::{Error, Result};
use crate::segment::{
    encode_parts, plan_split_times, split_segment, CellPassStacks, LatestPasses, SegmentBlob,
    SegmentDirectory, SegmentForm, SegmentInfo, MAX_SEGMENT_TIME, MIN_SEGMENT_TIME,
};
use crate::storage::{SpatialAffinityKey, StorageProxy, StreamKind};

/// Segment management shared by anything that partitions a cell history
/// by time.
pub trait SegmentOwner {
    fn segments(&self) -> &[SubGridSegment];

    /// Allocates the single segment spanning the whole time axis.
    fn create_default_segment(&mut self) -> Result<usize> {
        self.allocate_segment(SegmentInfo::unbounded())
    }

    /// Inserts a segment keeping start order. Overlap is an error.
    fn allocate_segment(&mut self, info: SegmentInfo) -> Result<usize>;

    fn segment_index_for(&self, time: DateTime<Utc>) -> Option<usize> {
        let segments = self.segments();
        let candidate = segments.partition_point(|s| s.info.start_time <= time);
        candidate
            .checked_sub(1)
            .filter(|i| segments[*i].info.contains(time))
    }
}

/// A segment descriptor with its in-memory body, when loaded.
#[derive(Debug, Clone)]
pub struct SubGridSegment {
    pub info: SegmentInfo,
    pub passes: Option<CellPassStacks>,
    pub latest: Option<LatestPasses>,
    pub dirty: bool,
}

impl SubGridSegment {
    fn new(info: SegmentInfo) -> Self {
        // A segment that was never persisted has nothing to load
        let passes = if info.exists_in_store {
            None
        } else {
            Some(CellPassStacks::new())
        };
        Self {
            info,
            passes,
            latest: None,
            dirty: false,
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.passes.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct ServerLeafSubGrid {
    origin: CellAddress,
    level: u8,
    segments: Vec<SubGridSegment>,
    next_version: u64,
    global_latest: LatestPasses,
    storage_checked: bool,
    /// Identifiers replaced in memory but not yet handed out for retirement
    superseded: Vec<String>,
}

impl ServerLeafSubGrid {
    pub fn new(origin: CellAddress, level: u8) -> Self {
        Self {
            origin,
            level,
            segments: Vec::new(),
            next_version: 1,
            global_latest: LatestPasses::new(),
            storage_checked: false,
            superseded: Vec::new(),
        }
    }

    /// Whether this leaf has consulted storage for its full history.
    pub fn is_loaded(&self) -> bool {
        self.storage_checked
    }

    pub fn is_dirty(&self) -> bool {
        self.segments.iter().any(|s| s.dirty) || !self.superseded.is_empty()
    }

    pub fn next_version(&self) -> u64 {
        self.next_version
    }

    pub fn global_latest(&self) -> &LatestPasses {
        &self.global_latest
    }

    pub fn pass_count(&self) -> u64 {
        self.segments.iter().map(|s| s.info.pass_count as u64).sum()
    }

    /// True when no cell of the block holds a pass.
    pub fn is_empty(&self) -> bool {
        self.global_latest.is_empty() && self.pass_count() == 0
    }

    /// Appends a pass for the cell at offset (`x`, `y`) within the block.
    pub fn add_pass(&mut self, x: u32, y: u32, pass: CellPass) -> Result<()> {
        if x >= SUBGRID_TREE_DIMENSION || y >= SUBGRID_TREE_DIMENSION {
            return Err(Error::InvalidArgument(format!(
                "cell offset ({}, {}) outside a leaf",
                x, y
            )));
        }
        if pass.time < MIN_SEGMENT_TIME || pass.time >= MAX_SEGMENT_TIME {
            return Err(Error::InvalidArgument(format!(
                "pass time {} outside the segment time axis",
                pass.time
            )));
        }

        if self.segments.is_empty() {
            self.create_default_segment()?;
        }
        let index = match self.segment_index_for(pass.time) {
            Some(index) => index,
            None => self.fill_gap(pass.time)?,
        };

        let segment = &mut self.segments[index];
        let stacks = match segment.passes.as_mut() {
            Some(stacks) => stacks,
            None => {
                return Err(Error::InvalidState(format!(
                    "segment {} of leaf {} is not loaded",
                    segment.info.segment_identifier(),
                    self.origin
                )))
            }
        };

        stacks.add(x, y, pass);
        segment.info.pass_count += 1;
        segment.dirty = true;
        if let Some(latest) = segment.latest.as_mut() {
            latest.merge_pass(x, y, &pass);
        }
        self.global_latest.merge_pass(x, y, &pass);
        Ok(())
    }

    fn fill_gap(&mut self, time: DateTime<Utc>) -> Result<usize> {
        let after = self
            .segments
            .partition_point(|s| s.info.start_time <= time);
        let start = after
            .checked_sub(1)
            .map_or(MIN_SEGMENT_TIME, |i| self.segments[i].info.end_time);
        let end = self
            .segments
            .get(after)
            .map_or(MAX_SEGMENT_TIME, |s| s.info.start_time);

        self.allocate_segment(SegmentInfo::new(start, end))
    }

    /// Passes of one cell across all loaded segments, oldest first.
    pub fn cell_passes(&self, x: u32, y: u32) -> Vec<CellPass> {
        self.segments
            .iter()
            .filter_map(|s| s.passes.as_ref())
            .flat_map(|stacks| stacks.passes(x, y).iter().copied())
            .collect()
    }

    pub fn latest_pass(&self, x: u32, y: u32) -> Option<&CellPass> {
        self.global_latest.get(x, y)
    }

    /// Rebuilds each loaded segment's latest grid, then the leaf-wide one.
    /// Later segments win; within a cell the latest time wins.
    pub fn compute_latest_pass_information(&mut self) {
        for segment in self.segments.iter_mut() {
            if let Some(stacks) = &segment.passes {
                segment.latest = Some(LatestPasses::from_stacks(stacks));
            }
        }

        let complete = self.segments.iter().all(|s| s.latest.is_some());
        let mut global = if complete {
            LatestPasses::new()
        } else {
            self.global_latest.clone()
        };
        for latest in self.segments.iter().filter_map(|s| s.latest.as_ref()) {
            global.merge(latest);
        }
        self.global_latest = global;
    }

    /// Splits loaded segments holding more than `max_passes` passes.
    /// Segments below `min_passes` are left alone. Returns the number of
    /// segments split.
    pub fn cleave(&mut self, max_passes: u32, min_passes: u32) -> usize {
        let mut split = 0;
        let mut index = 0;

        while index < self.segments.len() {
            let segment = &self.segments[index];
            let count = segment.info.pass_count;
            let eligible = segment.is_loaded() && count > max_passes && count >= min_passes;
            let split_times = match (&segment.passes, eligible) {
                (Some(stacks), true) => plan_split_times(&stacks.sorted_times(), max_passes as usize),
                _ => Vec::new(),
            };
            if split_times.is_empty() {
                index += 1;
                continue;
            }

            let old = self.segments.remove(index);
            if old.info.exists_in_store {
                self.superseded.push(old.info.segment_identifier());
            }
            let stacks = old.passes.unwrap_or_default();
            let pieces = split_segment(&old.info, stacks, &split_times);
            let added = pieces.len();

            tracing::debug!(
                leaf = %self.origin,
                segment = %old.info.segment_identifier(),
                pieces = added,
                "Cleaving segment"
            );

            let replacements = pieces.into_iter().map(|(info, stacks)| SubGridSegment {
                latest: Some(LatestPasses::from_stacks(&stacks)),
                info,
                passes: Some(stacks),
                dirty: true,
            });
            self.segments.splice(index..index, replacements);

            index += added;
            split += 1;
        }
        split
    }

    /// Loads the directory and, when asked, every persisted segment body.
    ///
    /// Returns `false` when there is no usable data: the directory is
    /// missing, or a read or decode fails. The leaf is then left empty and
    /// callers treat it as holding no history.
    pub fn load_from_storage(
        &mut self,
        proxy: &dyn StorageProxy,
        key: &SpatialAffinityKey,
        load_latest: bool,
        load_all_passes: bool,
    ) -> bool {
        let loaded = self.try_load(proxy, key, load_latest, load_all_passes);
        if load_all_passes {
            self.storage_checked = true;
        }

        match loaded {
            Ok(true) => true,
            Ok(false) => {
                self.reset();
                false
            }
            Err(e) => {
                tracing::warn!(
                    key = %key,
                    error = %e,
                    "Failed to load leaf, treating as no data"
                );
                self.reset();
                false
            }
        }
    }

    /// Loads the full history ahead of a write. Unlike `load_from_storage`,
    /// a failed read or decode is returned: writing over history that could
    /// not be read would orphan it.
    pub fn load_for_update(
        &mut self,
        proxy: &dyn StorageProxy,
        key: &SpatialAffinityKey,
    ) -> Result<bool> {
        match self.try_load(proxy, key, true, true) {
            Ok(found) => {
                if !found {
                    self.reset();
                }
                self.storage_checked = true;
                Ok(found)
            }
            Err(e) => {
                self.reset();
                Err(e)
            }
        }
    }

    fn reset(&mut self) {
        self.segments.clear();
        self.global_latest = LatestPasses::new();
        self.superseded.clear();
    }

    fn try_load(
        &mut self,
        proxy: &dyn StorageProxy,
        key: &SpatialAffinityKey,
        load_latest: bool,
        load_all_passes: bool,
    ) -> Result<bool> {
        let bytes = match proxy.read_spatial(&key.directory(), StreamKind::Directory)? {
            Some(bytes) => bytes,
            None => return Ok(false),
        };
        let directory = SegmentDirectory::decode(&bytes)?;

        let mut segments: Vec<SubGridSegment> = directory
            .segments
            .into_iter()
            .map(SubGridSegment::new)
            .collect();

        if load_all_passes {
            for segment in segments.iter_mut().filter(|s| s.info.exists_in_store) {
                let id = segment.info.segment_identifier();
                let bytes = proxy
                    .read_spatial(&key.with_segment(id.as_str()), StreamKind::SegmentPasses)?
                    .ok_or_else(|| Error::InvalidState(format!("segment {} missing", id)))?;

                let blob = SegmentBlob::decode(&bytes)?;
                if blob.form != SegmentForm::FullPassStack {
                    return Err(Error::InvalidState(format!(
                        "segment {} holds no pass stacks",
                        id
                    )));
                }
                segment.passes = blob.passes;
                segment.latest = Some(blob.latest);
            }
        }

        self.segments = segments;
        self.next_version = self.next_version.max(directory.next_version);
        self.global_latest = match (load_latest, directory.global_latest) {
            (true, Some(latest)) => latest,
            _ => LatestPasses::new(),
        };
        Ok(true)
    }

    /// Writes every dirty segment under a new identifier. Identifiers of
    /// persisted segments this replaces are appended to `superseded`.
    pub fn save_dirty_segments(
        &mut self,
        proxy: &dyn StorageProxy,
        key: &SpatialAffinityKey,
        superseded: &mut Vec<SpatialAffinityKey>,
    ) -> bool {
        for segment in self.segments.iter_mut().filter(|s| s.dirty) {
            let stacks = match &segment.passes {
                Some(stacks) => stacks,
                None => continue,
            };
            let latest = segment
                .latest
                .get_or_insert_with(|| LatestPasses::from_stacks(stacks));

            let previous = segment.info.touch(self.next_version);
            self.next_version += 1;

            let bytes = encode_parts(SegmentForm::FullPassStack, Some(stacks), latest, false);
            let segment_key = key.with_segment(segment.info.segment_identifier());
            if let Err(e) = proxy.write_spatial(&segment_key, StreamKind::SegmentPasses, bytes) {
                tracing::warn!(key = %segment_key, error = %e, "Failed to save segment");
                return false;
            }

            if segment.info.exists_in_store {
                superseded.push(key.with_segment(previous));
            }
            segment.info.exists_in_store = true;
            segment.info.form = SegmentForm::FullPassStack;
            segment.dirty = false;
        }

        superseded.extend(self.superseded.drain(..).map(|id| key.with_segment(id)));
        true
    }

    pub fn save_directory(&self, proxy: &dyn StorageProxy, key: &SpatialAffinityKey) -> bool {
        let directory = SegmentDirectory {
            next_version: self.next_version,
            segments: self.segments.iter().map(|s| s.info.clone()).collect(),
            global_latest: Some(self.global_latest.clone()),
        };

        match proxy.write_spatial(&key.directory(), StreamKind::Directory, directory.encode()) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Failed to save leaf directory");
                false
            }
        }
    }
}

impl Addressable for ServerLeafSubGrid {
    fn origin(&self) -> CellAddress {
        self.origin
    }

    fn level(&self) -> u8 {
        self.level
    }
}

impl SegmentOwner for ServerLeafSubGrid {
    fn segments(&self) -> &[SubGridSegment] {
        &self.segments
    }

    fn allocate_segment(&mut self, info: SegmentInfo) -> Result<usize> {
        if info.start_time >= info.end_time {
            return Err(Error::InvalidArgument(format!(
                "segment range {} .. {} is empty",
                info.start_time, info.end_time
            )));
        }
        if let Some(existing) = self.segments.iter().find(|s| s.info.overlaps(&info)) {
            return Err(Error::InvalidArgument(format!(
                "segment {} .. {} overlaps {}",
                info.start_time,
                info.end_time,
                existing.info.segment_identifier()
            )));
        }

        let index = self
            .segments
            .partition_point(|s| s.info.start_time < info.start_time);
        self.segments.insert(index, SubGridSegment::new(info));
        Ok(index)
    }
}
