//! Subgrid tree: a fixed fan-out quad-tree over the cell grid.
//!
//! Every subgrid covers a square block of cells. Each level of the tree
//! consumes `SUBGRID_INDEX_BITS_PER_LEVEL` bits of a cell coordinate, so a
//! node has `SUBGRID_TREE_DIMENSION`² children and the leaves, which always
//! sit on the last level, own a 32×32 block of cells.
//!
//! ```text
//!  cell x (30 bits with 6 levels):
//!  | L1 idx | L2 idx | L3 idx | L4 idx | L5 idx | cell in leaf |
//!  | 5 bits | 5 bits | 5 bits | 5 bits | 5 bits |    5 bits    |
//! ```
//!
//! Locating the leaf for a cell is `levels` shifts and masks, no
//! comparisons.

pub mod bitmask;
pub mod factory;
pub mod leaf;
pub mod tree;

pub use bitmask::{BitmaskLeaf, SubGridBits};
pub use factory::{BitmaskLeafFactory, ServerLeafFactory, SubGridFactory};
pub use leaf::{SegmentOwner, ServerLeafSubGrid, SubGridSegment};
pub use tree::{NodeSubGrid, SubGrid, SubGridRef, SubGridTree};

pub const SUBGRID_INDEX_BITS_PER_LEVEL: u32 = 5;
pub const SUBGRID_TREE_DIMENSION: u32 = 1 << SUBGRID_INDEX_BITS_PER_LEVEL;
pub const SUBGRID_TREE_DIMENSION_MINUS_ONE: u32 = SUBGRID_TREE_DIMENSION - 1;
pub const SUBGRID_CELL_COUNT: usize = (SUBGRID_TREE_DIMENSION * SUBGRID_TREE_DIMENSION) as usize;

pub const DEFAULT_TREE_LEVELS: u8 = 6;
pub const MAX_TREE_LEVELS: u8 = 6;
pub const DEFAULT_CELL_SIZE: f64 = 0.34;

/// Absolute address of a cell in the tree's cell grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct CellAddress {
    pub x: u32,
    pub y: u32,
}

impl CellAddress {
    pub const fn new(x: u32, y: u32) -> Self {
        Self { x, y }
    }

    /// Origin of the leaf subgrid holding this cell.
    pub fn leaf_origin(&self) -> CellAddress {
        CellAddress::new(
            self.x & !SUBGRID_TREE_DIMENSION_MINUS_ONE,
            self.y & !SUBGRID_TREE_DIMENSION_MINUS_ONE,
        )
    }

    /// Offset of this cell inside its leaf subgrid.
    pub fn leaf_offset(&self) -> (u32, u32) {
        (
            self.x & SUBGRID_TREE_DIMENSION_MINUS_ONE,
            self.y & SUBGRID_TREE_DIMENSION_MINUS_ONE,
        )
    }

    /// Address of the leaf subgrid holding this cell, in subgrid units.
    pub fn subgrid_address(&self) -> CellAddress {
        CellAddress::new(
            self.x >> SUBGRID_INDEX_BITS_PER_LEVEL,
            self.y >> SUBGRID_INDEX_BITS_PER_LEVEL,
        )
    }
}

impl std::fmt::Display for CellAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// Inclusive rectangle of cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellExtent {
    pub min_x: u32,
    pub min_y: u32,
    pub max_x: u32,
    pub max_y: u32,
}

impl CellExtent {
    pub fn new(min_x: u32, min_y: u32, max_x: u32, max_y: u32) -> Self {
        Self {
            min_x,
            min_y,
            max_x,
            max_y,
        }
    }

    pub fn includes(&self, cell: CellAddress) -> bool {
        cell.x >= self.min_x && cell.x <= self.max_x && cell.y >= self.min_y && cell.y <= self.max_y
    }

    pub fn intersects(&self, other: &CellExtent) -> bool {
        self.min_x <= other.max_x
            && other.min_x <= self.max_x
            && self.min_y <= other.max_y
            && other.min_y <= self.max_y
    }

    pub fn include(&mut self, cell: CellAddress) {
        self.min_x = self.min_x.min(cell.x);
        self.min_y = self.min_y.min(cell.y);
        self.max_x = self.max_x.max(cell.x);
        self.max_y = self.max_y.max(cell.y);
    }
}

/// Something that occupies a square block of the cell grid.
pub trait Addressable {
    fn origin(&self) -> CellAddress;

    /// Tree level, 1 being the root.
    fn level(&self) -> u8;

    /// Width of the block in cells.
    fn span(&self) -> u32 {
        SUBGRID_TREE_DIMENSION
    }

    fn extent(&self) -> CellExtent {
        let origin = self.origin();
        let last = self.span() - 1;
        CellExtent::new(origin.x, origin.y, origin.x + last, origin.y + last)
    }

    fn contains(&self, cell: CellAddress) -> bool {
        self.extent().includes(cell)
    }

    /// Offset of `cell` from this block's origin.
    fn cell_offset(&self, cell: CellAddress) -> (u32, u32) {
        let origin = self.origin();
        (cell.x - origin.x, cell.y - origin.y)
    }
}
