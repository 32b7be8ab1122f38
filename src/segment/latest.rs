use std::io::Cursor;

use super::{CellPassStacks, MIN_SEGMENT_TIME};
use crate::cells::CellPass;
use crate::error::Result;
use crate::subgrid::{SubGridBits, SUBGRID_CELL_COUNT, SUBGRID_TREE_DIMENSION};

/// Most recent pass per cell, with a presence mask.
///
/// Read paths needing only the current state of a cell use this grid
/// instead of scanning full pass stacks.
#[derive(Debug, Clone, PartialEq)]
pub struct LatestPasses {
    present: SubGridBits,
    passes: Vec<CellPass>,
}

impl Default for LatestPasses {
    fn default() -> Self {
        Self::new()
    }
}

impl LatestPasses {
    pub fn new() -> Self {
        Self {
            present: SubGridBits::new(),
            passes: vec![CellPass::null_at(MIN_SEGMENT_TIME); SUBGRID_CELL_COUNT],
        }
    }

    pub fn from_stacks(stacks: &CellPassStacks) -> Self {
        let mut latest = Self::new();
        for (x, y, stack) in stacks.iter_cells() {
            if let Some(last) = stack.last() {
                latest.merge_pass(x, y, last);
            }
        }
        latest
    }

    /// Keeps `pass` if it is at least as recent as the current entry.
    pub fn merge_pass(&mut self, x: u32, y: u32, pass: &CellPass) {
        let index = (x * SUBGRID_TREE_DIMENSION + y) as usize;
        if !self.present.is_set(x, y) || pass.time >= self.passes[index].time {
            self.passes[index] = *pass;
            self.present.set(x, y);
        }
    }

    pub fn merge(&mut self, other: &LatestPasses) {
        for (x, y) in other.present.iter_set() {
            if let Some(pass) = other.get(x, y) {
                self.merge_pass(x, y, pass);
            }
        }
    }

    pub fn get(&self, x: u32, y: u32) -> Option<&CellPass> {
        if self.present.is_set(x, y) {
            Some(&self.passes[(x * SUBGRID_TREE_DIMENSION + y) as usize])
        } else {
            None
        }
    }

    pub fn present(&self) -> &SubGridBits {
        &self.present
    }

    pub fn count(&self) -> u32 {
        self.present.count()
    }

    pub fn is_empty(&self) -> bool {
        self.present.is_empty()
    }

    /// Presence mask followed by the passes of present cells, x-major.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        self.present.encode_into(buf);
        for (x, y) in self.present.iter_set() {
            self.passes[(x * SUBGRID_TREE_DIMENSION + y) as usize].encode_into(buf);
        }
    }

    pub fn decode_from(cursor: &mut Cursor<&[u8]>) -> Result<Self> {
        let mut latest = Self::new();
        latest.present = SubGridBits::decode_from(cursor)?;
        let cells: Vec<_> = latest.present.iter_set().collect();
        for (x, y) in cells {
            latest.passes[(x * SUBGRID_TREE_DIMENSION + y) as usize] = CellPass::decode_from(cursor)?;
        }
        Ok(latest)
    }
}
