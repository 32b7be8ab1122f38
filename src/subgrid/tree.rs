use std::sync::Arc;

use super::{
    Addressable, CellAddress, CellExtent, SubGridFactory, MAX_TREE_LEVELS,
    SUBGRID_INDEX_BITS_PER_LEVEL, SUBGRID_TREE_DIMENSION, SUBGRID_TREE_DIMENSION_MINUS_ONE,
};
use crate::error::{Error, Result};

const CHILD_COUNT: usize = (SUBGRID_TREE_DIMENSION * SUBGRID_TREE_DIMENSION) as usize;

/// A child slot of a node: either another node or, on the last level, a leaf.
pub enum SubGrid<L> {
    Node(Box<NodeSubGrid<L>>),
    Leaf(Box<L>),
}

/// Borrowed view of a subgrid returned by tree iteration.
pub enum SubGridRef<'a, L> {
    Node(&'a NodeSubGrid<L>),
    Leaf(&'a L),
}

impl<'a, L: Addressable> SubGridRef<'a, L> {
    pub fn origin(&self) -> CellAddress {
        match self {
            SubGridRef::Node(node) => node.origin(),
            SubGridRef::Leaf(leaf) => leaf.origin(),
        }
    }

    pub fn level(&self) -> u8 {
        match self {
            SubGridRef::Node(node) => node.level(),
            SubGridRef::Leaf(leaf) => leaf.level(),
        }
    }

    pub fn as_leaf(&self) -> Option<&'a L> {
        match self {
            SubGridRef::Leaf(leaf) => Some(leaf),
            SubGridRef::Node(_) => None,
        }
    }
}

/// Interior node used purely for spatial subdivision.
pub struct NodeSubGrid<L> {
    origin: CellAddress,
    level: u8,
    /// Cells of the grid covered by one child, as a power of two.
    child_shift: u32,
    children: Vec<Option<SubGrid<L>>>,
    child_count: usize,
}

impl<L> NodeSubGrid<L> {
    fn new(origin: CellAddress, level: u8, tree_levels: u8) -> Self {
        let mut children = Vec::with_capacity(CHILD_COUNT);
        children.resize_with(CHILD_COUNT, || None);
        Self {
            origin,
            level,
            child_shift: (tree_levels - level) as u32 * SUBGRID_INDEX_BITS_PER_LEVEL,
            children,
            child_count: 0,
        }
    }

    fn child_index(&self, x: u32, y: u32) -> usize {
        let cx = (x >> self.child_shift) & SUBGRID_TREE_DIMENSION_MINUS_ONE;
        let cy = (y >> self.child_shift) & SUBGRID_TREE_DIMENSION_MINUS_ONE;
        (cx * SUBGRID_TREE_DIMENSION + cy) as usize
    }

    fn child_origin(&self, x: u32, y: u32) -> CellAddress {
        let mask = !((1u32 << self.child_shift) - 1);
        CellAddress::new(x & mask, y & mask)
    }

    pub fn child_count(&self) -> usize {
        self.child_count
    }

    pub fn children(&self) -> impl Iterator<Item = &SubGrid<L>> {
        self.children.iter().flatten()
    }
}

impl<L> Addressable for NodeSubGrid<L> {
    fn origin(&self) -> CellAddress {
        self.origin
    }

    fn level(&self) -> u8 {
        self.level
    }

    fn span(&self) -> u32 {
        // A node spans all of its children: one more level of index bits
        1u32 << (self.child_shift + SUBGRID_INDEX_BITS_PER_LEVEL)
    }
}

/// The addressable quad-tree over a project's cell grid.
pub struct SubGridTree<L> {
    levels: u8,
    cell_size: f64,
    root: NodeSubGrid<L>,
    factory: Arc<dyn SubGridFactory<L>>,
}

impl<L: Addressable> SubGridTree<L> {
    pub fn new(levels: u8, cell_size: f64, factory: Arc<dyn SubGridFactory<L>>) -> Result<Self> {
        if !(2..=MAX_TREE_LEVELS).contains(&levels) {
            return Err(Error::InvalidArgument(format!(
                "tree levels must be between 2 and {}, got {}",
                MAX_TREE_LEVELS, levels
            )));
        }
        if !cell_size.is_finite() || cell_size <= 0.0 {
            return Err(Error::InvalidArgument(format!(
                "cell size must be positive, got {}",
                cell_size
            )));
        }

        Ok(Self {
            levels,
            cell_size,
            root: NodeSubGrid::new(CellAddress::new(0, 0), 1, levels),
            factory,
        })
    }

    pub fn levels(&self) -> u8 {
        self.levels
    }

    pub fn cell_size(&self) -> f64 {
        self.cell_size
    }

    pub fn cells_per_dimension(&self) -> u32 {
        1u32 << (self.levels as u32 * SUBGRID_INDEX_BITS_PER_LEVEL)
    }

    /// Offset added to world cell indices so that negative world
    /// coordinates land inside the grid.
    pub fn index_origin_offset(&self) -> u32 {
        self.cells_per_dimension() / 2
    }

    pub fn in_bounds(&self, x: u32, y: u32) -> bool {
        let limit = self.cells_per_dimension();
        x < limit && y < limit
    }

    /// Cell containing the world position, or `None` when it falls outside
    /// the grid.
    pub fn cell_for_world(&self, easting: f64, northing: f64) -> Option<CellAddress> {
        let offset = self.index_origin_offset() as i64;
        let limit = self.cells_per_dimension() as i64;
        let cx = (easting / self.cell_size).floor();
        let cy = (northing / self.cell_size).floor();
        if !cx.is_finite() || !cy.is_finite() {
            return None;
        }

        let x = cx as i64 + offset;
        let y = cy as i64 + offset;
        if (0..limit).contains(&x) && (0..limit).contains(&y) {
            Some(CellAddress::new(x as u32, y as u32))
        } else {
            None
        }
    }

    /// World position of the centre of a cell.
    pub fn cell_center(&self, cell: CellAddress) -> (f64, f64) {
        let offset = self.index_origin_offset() as f64;
        (
            (cell.x as f64 - offset + 0.5) * self.cell_size,
            (cell.y as f64 - offset + 0.5) * self.cell_size,
        )
    }

    fn check_bounds(&self, x: u32, y: u32) -> Result<()> {
        if self.in_bounds(x, y) {
            Ok(())
        } else {
            Err(Error::InvalidArgument(format!(
                "cell ({}, {}) outside a tree of {} cells per side",
                x,
                y,
                self.cells_per_dimension()
            )))
        }
    }

    /// Leaf owning the cell, creating it and any missing nodes on the way.
    pub fn locate(&mut self, x: u32, y: u32) -> Result<&mut L> {
        self.check_bounds(x, y)?;

        let levels = self.levels;
        let factory = &self.factory;
        let mut node = &mut self.root;

        loop {
            let index = node.child_index(x, y);

            if node.children[index].is_none() {
                let child_level = node.level + 1;
                let origin = node.child_origin(x, y);
                let child = if child_level == levels {
                    SubGrid::Leaf(Box::new(factory.create_leaf(child_level, levels, origin)?))
                } else {
                    SubGrid::Node(Box::new(NodeSubGrid::new(origin, child_level, levels)))
                };
                node.children[index] = Some(child);
                node.child_count += 1;
            }

            match node.children[index].as_mut() {
                Some(SubGrid::Node(child)) => node = child.as_mut(),
                Some(SubGrid::Leaf(leaf)) => return Ok(leaf.as_mut()),
                None => {
                    return Err(Error::InvalidState(format!(
                        "child slot {} vanished during locate",
                        index
                    )))
                }
            }
        }
    }

    /// Leaf owning the cell if it already exists.
    pub fn lookup(&self, x: u32, y: u32) -> Option<&L> {
        if !self.in_bounds(x, y) {
            return None;
        }

        let mut node = &self.root;
        loop {
            match node.children[node.child_index(x, y)].as_ref()? {
                SubGrid::Node(child) => node = child,
                SubGrid::Leaf(leaf) => return Some(leaf),
            }
        }
    }

    pub fn lookup_mut(&mut self, x: u32, y: u32) -> Option<&mut L> {
        if !self.in_bounds(x, y) {
            return None;
        }

        let mut node = &mut self.root;
        loop {
            let index = node.child_index(x, y);
            match node.children[index].as_mut()? {
                SubGrid::Node(child) => node = child.as_mut(),
                SubGrid::Leaf(leaf) => return Some(leaf.as_mut()),
            }
        }
    }

    /// Detaches the leaf owning the cell. Interior nodes are left in place.
    pub fn remove_leaf(&mut self, x: u32, y: u32) -> Option<L> {
        if !self.in_bounds(x, y) {
            return None;
        }

        let levels = self.levels;
        let mut node = &mut self.root;
        while node.level + 1 < levels {
            let index = node.child_index(x, y);
            match node.children[index].as_mut()? {
                SubGrid::Node(child) => node = child.as_mut(),
                SubGrid::Leaf(_) => return None,
            }
        }

        let index = node.child_index(x, y);
        match node.children[index].take()? {
            SubGrid::Leaf(leaf) => {
                node.child_count -= 1;
                Some(*leaf)
            }
            other => {
                node.children[index] = Some(other);
                None
            }
        }
    }

    /// Subgrids on `level` intersecting `region` (all of them when `None`),
    /// in child order.
    pub fn iterate(&self, level: u8, region: Option<&CellExtent>) -> Vec<SubGridRef<'_, L>> {
        let mut found = Vec::new();
        if level == 1 {
            if region.map_or(true, |r| r.intersects(&self.root.extent())) {
                found.push(SubGridRef::Node(&self.root));
            }
            return found;
        }
        if level <= self.levels {
            Self::collect(&self.root, level, region, &mut found);
        }
        found
    }

    fn collect<'a>(
        node: &'a NodeSubGrid<L>,
        level: u8,
        region: Option<&CellExtent>,
        found: &mut Vec<SubGridRef<'a, L>>,
    ) {
        for child in node.children() {
            match child {
                SubGrid::Node(child) => {
                    if region.map_or(false, |r| !r.intersects(&child.extent())) {
                        continue;
                    }
                    if child.level == level {
                        found.push(SubGridRef::Node(child));
                    } else {
                        Self::collect(child, level, region, found);
                    }
                }
                SubGrid::Leaf(leaf) => {
                    if leaf.level() == level
                        && region.map_or(true, |r| r.intersects(&leaf.extent()))
                    {
                        found.push(SubGridRef::Leaf(leaf));
                    }
                }
            }
        }
    }

    pub fn leaves(&self) -> Vec<&L> {
        self.iterate(self.levels, None)
            .into_iter()
            .filter_map(|subgrid| subgrid.as_leaf())
            .collect()
    }

    pub fn leaf_count(&self) -> usize {
        self.leaves().len()
    }

    pub fn for_each_leaf_mut(&mut self, mut f: impl FnMut(&mut L)) {
        fn visit<L>(node: &mut NodeSubGrid<L>, f: &mut dyn FnMut(&mut L)) {
            for child in node.children.iter_mut().flatten() {
                match child {
                    SubGrid::Node(child) => visit(child, f),
                    SubGrid::Leaf(leaf) => f(leaf),
                }
            }
        }
        visit(&mut self.root, &mut f);
    }

    pub fn clear(&mut self) {
        self.root = NodeSubGrid::new(CellAddress::new(0, 0), 1, self.levels);
    }
}
