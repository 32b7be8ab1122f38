use std::io::Cursor;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use super::{Addressable, CellAddress, SUBGRID_TREE_DIMENSION};
use crate::error::Result;

/// One bit per cell of a 32×32 block, one `u32` row per x.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SubGridBits([u32; SUBGRID_TREE_DIMENSION as usize]);

impl SubGridBits {
    pub const ENCODED_SIZE: usize = SUBGRID_TREE_DIMENSION as usize * 4;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn full() -> Self {
        Self([u32::MAX; SUBGRID_TREE_DIMENSION as usize])
    }

    #[inline]
    pub fn set(&mut self, x: u32, y: u32) {
        self.0[x as usize] |= 1 << y;
    }

    #[inline]
    pub fn clear(&mut self, x: u32, y: u32) {
        self.0[x as usize] &= !(1 << y);
    }

    #[inline]
    pub fn is_set(&self, x: u32, y: u32) -> bool {
        self.0[x as usize] & (1 << y) != 0
    }

    pub fn count(&self) -> u32 {
        self.0.iter().map(|row| row.count_ones()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|row| *row == 0)
    }

    pub fn union(&mut self, other: &SubGridBits) {
        for (row, other) in self.0.iter_mut().zip(other.0.iter()) {
            *row |= other;
        }
    }

    /// Offsets of all set bits, x-major.
    pub fn iter_set(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        (0..SUBGRID_TREE_DIMENSION).flat_map(move |x| {
            (0..SUBGRID_TREE_DIMENSION)
                .filter(move |y| self.is_set(x, *y))
                .map(move |y| (x, y))
        })
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        for row in &self.0 {
            buf.write_u32::<BigEndian>(*row).unwrap();
        }
    }

    pub fn decode_from(cursor: &mut Cursor<&[u8]>) -> Result<Self> {
        let mut bits = Self::default();
        for row in bits.0.iter_mut() {
            *row = cursor.read_u32::<BigEndian>()?;
        }
        Ok(bits)
    }
}

/// Leaf holding a single bit per cell. Used by existence maps.
#[derive(Debug, Clone, PartialEq)]
pub struct BitmaskLeaf {
    origin: CellAddress,
    level: u8,
    pub bits: SubGridBits,
}

impl BitmaskLeaf {
    pub fn new(origin: CellAddress, level: u8) -> Self {
        Self {
            origin,
            level,
            bits: SubGridBits::new(),
        }
    }

    pub fn set(&mut self, x: u32, y: u32) {
        self.bits.set(x, y);
    }

    pub fn is_set(&self, x: u32, y: u32) -> bool {
        self.bits.is_set(x, y)
    }
}

impl Addressable for BitmaskLeaf {
    fn origin(&self) -> CellAddress {
        self.origin
    }

    fn level(&self) -> u8 {
        self.level
    }
}
