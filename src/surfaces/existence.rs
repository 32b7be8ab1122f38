use std::collections::HashMap;
use std::io::Cursor;
use std::sync::{Arc, Mutex};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::encoding::{expect_magic, seal, unseal};
use crate::error::{Error, Result};
use crate::storage::{NonSpatialAffinityKey, StorageContext, StorageProxy, StreamKind};
use crate::subgrid::{
    Addressable, BitmaskLeaf, BitmaskLeafFactory, CellAddress, SubGridBits, SubGridTree,
    SUBGRID_TREE_DIMENSION,
};

const MAGIC: &[u8; 4] = b"TEXM";

/// Which subgrids of a site grid a surface covers.
///
/// Bit (sx, sy) stands for the leaf subgrid whose cells are
/// `sx * 32 .. sx * 32 + 32` by `sy * 32 .. sy * 32 + 32`. The bits live in a
/// bitmask tree one level shallower than the site grid, with cells 32
/// times larger, so a world position maps to its subgrid bit through the
/// ordinary cell lookup.
///
/// ```text
/// | "TEXM" | tree_levels:u8 | cell_size:f64 | leaf_count:u32 |
/// | (origin_x:u32 | origin_y:u32 | rows:[u32; 32])* | crc32:u32 |
/// ```
pub struct ExistenceMap {
    tree_levels: u8,
    cell_size: f64,
    bits: SubGridTree<BitmaskLeaf>,
}

impl ExistenceMap {
    /// An empty map over a site grid of `tree_levels` levels and
    /// `cell_size` metre cells.
    pub fn new(tree_levels: u8, cell_size: f64) -> Result<Self> {
        if tree_levels < 3 {
            return Err(Error::InvalidArgument(format!(
                "existence maps need a site grid of at least 3 levels, got {}",
                tree_levels
            )));
        }
        let bits = SubGridTree::new(
            tree_levels - 1,
            cell_size * SUBGRID_TREE_DIMENSION as f64,
            Arc::new(BitmaskLeafFactory),
        )?;
        Ok(Self {
            tree_levels,
            cell_size,
            bits,
        })
    }

    /// Map with the subgrid of every listed cell set.
    pub fn from_cells(
        tree_levels: u8,
        cell_size: f64,
        cells: impl IntoIterator<Item = CellAddress>,
    ) -> Result<Self> {
        let mut map = Self::new(tree_levels, cell_size)?;
        for cell in cells {
            map.set_subgrid(cell)?;
        }
        Ok(map)
    }

    /// Map with every subgrid touched by the world rectangle set.
    pub fn from_world_extent(
        tree_levels: u8,
        cell_size: f64,
        extent: &WorldExtent,
    ) -> Result<Self> {
        let mut map = Self::new(tree_levels, cell_size)?;
        let outside = || Error::InvalidArgument(format!("extent {:?} outside the grid", extent));
        let min = map
            .bits
            .cell_for_world(extent.min_x, extent.min_y)
            .ok_or_else(outside)?;
        let max = map
            .bits
            .cell_for_world(extent.max_x, extent.max_y)
            .ok_or_else(outside)?;

        for x in min.x..=max.x {
            for y in min.y..=max.y {
                let (ox, oy) = CellAddress::new(x, y).leaf_offset();
                map.bits.locate(x, y)?.set(ox, oy);
            }
        }
        Ok(map)
    }

    pub fn tree_levels(&self) -> u8 {
        self.tree_levels
    }

    pub fn cell_size(&self) -> f64 {
        self.cell_size
    }

    /// Marks the subgrid holding `cell`.
    pub fn set_subgrid(&mut self, cell: CellAddress) -> Result<()> {
        let subgrid = cell.subgrid_address();
        let (x, y) = subgrid.leaf_offset();
        self.bits.locate(subgrid.x, subgrid.y)?.set(x, y);
        Ok(())
    }

    pub fn clear_subgrid(&mut self, cell: CellAddress) {
        let subgrid = cell.subgrid_address();
        let (x, y) = subgrid.leaf_offset();
        if let Some(leaf) = self.bits.lookup_mut(subgrid.x, subgrid.y) {
            leaf.bits.clear(x, y);
        }
    }

    /// Whether the subgrid holding `cell` is covered.
    pub fn is_set(&self, cell: CellAddress) -> bool {
        let subgrid = cell.subgrid_address();
        let (x, y) = subgrid.leaf_offset();
        self.bits
            .lookup(subgrid.x, subgrid.y)
            .is_some_and(|leaf| leaf.is_set(x, y))
    }

    /// Number of covered subgrids.
    pub fn count(&self) -> u64 {
        self.bits
            .leaves()
            .iter()
            .map(|leaf| leaf.bits.count() as u64)
            .sum()
    }

    /// Origins of the covered subgrids, in cell units of the site grid.
    pub fn subgrid_origins(&self) -> Vec<CellAddress> {
        let mut origins = Vec::new();
        for leaf in self.bits.leaves() {
            let origin = leaf.origin();
            for (x, y) in leaf.bits.iter_set() {
                origins.push(CellAddress::new(
                    (origin.x + x) * SUBGRID_TREE_DIMENSION,
                    (origin.y + y) * SUBGRID_TREE_DIMENSION,
                ));
            }
        }
        origins
    }

    pub fn union(&mut self, other: &ExistenceMap) -> Result<()> {
        if other.tree_levels != self.tree_levels {
            return Err(Error::InvalidArgument(format!(
                "cannot merge a {} level map into a {} level map",
                other.tree_levels, self.tree_levels
            )));
        }
        for leaf in other.bits.leaves() {
            let origin = leaf.origin();
            self.bits.locate(origin.x, origin.y)?.bits.union(&leaf.bits);
        }
        Ok(())
    }

    pub fn encode(&self) -> Vec<u8> {
        let leaves = self.bits.leaves();
        let mut buf = Vec::with_capacity(17 + leaves.len() * 136 + 4);
        buf.extend_from_slice(MAGIC);
        buf.write_u8(self.tree_levels).unwrap();
        buf.write_f64::<BigEndian>(self.cell_size).unwrap();
        buf.write_u32::<BigEndian>(leaves.len() as u32).unwrap();
        for leaf in leaves {
            let origin = leaf.origin();
            buf.write_u32::<BigEndian>(origin.x).unwrap();
            buf.write_u32::<BigEndian>(origin.y).unwrap();
            leaf.bits.encode_into(&mut buf);
        }
        seal(&mut buf);
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        expect_magic(bytes, MAGIC, "existence map")?;
        let body = unseal(bytes, "existence map")?;
        if body.len() < MAGIC.len() {
            return Err(Error::Decode("existence map: truncated header".to_string()));
        }
        let mut cursor = Cursor::new(&body[4..]);

        let tree_levels = cursor.read_u8()?;
        let cell_size = cursor.read_f64::<BigEndian>()?;
        let mut map = Self::new(tree_levels, cell_size)
            .map_err(|e| Error::Decode(format!("existence map: {}", e)))?;

        let count = cursor.read_u32::<BigEndian>()?;
        for _ in 0..count {
            let x = cursor.read_u32::<BigEndian>()?;
            let y = cursor.read_u32::<BigEndian>()?;
            let bits = SubGridBits::decode_from(&mut cursor)?;
            let leaf = map
                .bits
                .locate(x, y)
                .map_err(|e| Error::Decode(format!("existence map: {}", e)))?;
            if leaf.origin() != CellAddress::new(x, y) {
                return Err(Error::Decode(format!(
                    "existence map: ({}, {}) is not a leaf origin",
                    x, y
                )));
            }
            leaf.bits.union(&bits);
        }
        Ok(map)
    }
}

impl std::fmt::Debug for ExistenceMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExistenceMap")
            .field("tree_levels", &self.tree_levels)
            .field("cell_size", &self.cell_size)
            .field("subgrids", &self.count())
            .finish()
    }
}

impl PartialEq for ExistenceMap {
    fn eq(&self, other: &Self) -> bool {
        if self.tree_levels != other.tree_levels || self.cell_size != other.cell_size {
            return false;
        }
        let mut ours = self.subgrid_origins();
        let mut theirs = other.subgrid_origins();
        ours.sort_by_key(|c| (c.x, c.y));
        theirs.sort_by_key(|c| (c.x, c.y));
        ours == theirs
    }
}

/// World rectangle in metres, inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WorldExtent {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl WorldExtent {
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        Self {
            min_x: min_x.min(max_x),
            min_y: min_y.min(max_y),
            max_x: min_x.max(max_x),
            max_y: min_y.max(max_y),
        }
    }
}

/// Name of the stream holding the existence map of `surface`.
pub fn existence_map_key(project: Uuid, surface: Uuid) -> NonSpatialAffinityKey {
    NonSpatialAffinityKey::new(project, format!("ExistenceMap-{}", surface))
}

/// Surface existence maps of every project, read through to storage.
pub struct ExistenceMaps {
    storage: StorageContext,
    cache: Mutex<HashMap<(Uuid, Uuid), Arc<ExistenceMap>>>,
}

impl ExistenceMaps {
    pub fn new(storage: StorageContext) -> Self {
        Self {
            storage,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Persists `map` in its own transaction and caches it.
    pub fn put(&self, project: Uuid, surface: Uuid, map: ExistenceMap) -> Result<Arc<ExistenceMap>> {
        let key = existence_map_key(project, surface);
        let proxy = self.storage.transactional_proxy();
        proxy.write_non_spatial(&key, StreamKind::ExistenceMap, map.encode())?;
        if let Err(e) = proxy.commit() {
            proxy.clear();
            return Err(e);
        }

        tracing::debug!(%project, %surface, subgrids = map.count(), "Stored existence map");
        let map = Arc::new(map);
        self.cache.lock()?.insert((project, surface), map.clone());
        Ok(map)
    }

    pub fn get(&self, project: Uuid, surface: Uuid) -> Result<Option<Arc<ExistenceMap>>> {
        if let Some(map) = self.cache.lock()?.get(&(project, surface)) {
            return Ok(Some(map.clone()));
        }

        let key = existence_map_key(project, surface);
        let bytes = match self
            .storage
            .direct_proxy()
            .read_non_spatial(&key, StreamKind::ExistenceMap)?
        {
            Some(bytes) => bytes,
            None => return Ok(None),
        };
        let map = Arc::new(ExistenceMap::decode(&bytes)?);
        self.cache.lock()?.insert((project, surface), map.clone());
        Ok(Some(map))
    }

    /// Drops the map from the cache and both stores.
    pub fn remove(&self, project: Uuid, surface: Uuid) -> Result<()> {
        self.cache.lock()?.remove(&(project, surface));
        let key = existence_map_key(project, surface);
        let proxy = self.storage.transactional_proxy();
        proxy.remove_non_spatial(&key)?;
        if let Err(e) = proxy.commit() {
            proxy.clear();
            return Err(e);
        }
        Ok(())
    }
}
