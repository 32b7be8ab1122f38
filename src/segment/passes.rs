use std::io::Cursor;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use chrono::{DateTime, Utc};

use crate::cells::CellPass;
use crate::error::{Error, Result};
use crate::subgrid::{SUBGRID_CELL_COUNT, SUBGRID_TREE_DIMENSION};

#[inline]
fn cell_index(x: u32, y: u32) -> usize {
    (x * SUBGRID_TREE_DIMENSION + y) as usize
}

/// Time-ordered passes for every cell of a 32×32 block.
#[derive(Debug, Clone, PartialEq)]
pub struct CellPassStacks {
    cells: Vec<Vec<CellPass>>,
    pass_count: u32,
}

impl Default for CellPassStacks {
    fn default() -> Self {
        Self::new()
    }
}

impl CellPassStacks {
    pub fn new() -> Self {
        Self {
            cells: vec![Vec::new(); SUBGRID_CELL_COUNT],
            pass_count: 0,
        }
    }

    /// Inserts keeping the stack ordered by time. A pass with the same time
    /// as existing passes goes after them.
    pub fn add(&mut self, x: u32, y: u32, pass: CellPass) {
        let stack = &mut self.cells[cell_index(x, y)];
        let at = stack.partition_point(|p| p.time <= pass.time);
        stack.insert(at, pass);
        self.pass_count += 1;
    }

    pub fn passes(&self, x: u32, y: u32) -> &[CellPass] {
        &self.cells[cell_index(x, y)]
    }

    pub fn pass_count(&self) -> u32 {
        self.pass_count
    }

    pub fn is_empty(&self) -> bool {
        self.pass_count == 0
    }

    /// Non-empty stacks with their cell offsets, x-major.
    pub fn iter_cells(&self) -> impl Iterator<Item = (u32, u32, &[CellPass])> + '_ {
        self.cells.iter().enumerate().filter(|(_, s)| !s.is_empty()).map(|(i, s)| {
            let i = i as u32;
            (i / SUBGRID_TREE_DIMENSION, i % SUBGRID_TREE_DIMENSION, s.as_slice())
        })
    }

    /// Every pass time in the block, sorted.
    pub fn sorted_times(&self) -> Vec<DateTime<Utc>> {
        let mut times: Vec<_> = self.cells.iter().flatten().map(|p| p.time).collect();
        times.sort_unstable();
        times
    }

    /// Moves every pass at or after `time` into a new set of stacks.
    pub fn split_off(&mut self, time: DateTime<Utc>) -> CellPassStacks {
        let mut upper = CellPassStacks::new();
        for (stack, target) in self.cells.iter_mut().zip(upper.cells.iter_mut()) {
            let at = stack.partition_point(|p| p.time < time);
            *target = stack.split_off(at);
            upper.pass_count += target.len() as u32;
        }
        self.pass_count -= upper.pass_count;
        upper
    }

    /// Sparse layout: `cells u32 | { index u16 | count u32 | passes }*`.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        let occupied = self.cells.iter().filter(|s| !s.is_empty()).count();
        buf.write_u32::<BigEndian>(occupied as u32).unwrap();

        for (index, stack) in self.cells.iter().enumerate() {
            if stack.is_empty() {
                continue;
            }
            buf.write_u16::<BigEndian>(index as u16).unwrap();
            buf.write_u32::<BigEndian>(stack.len() as u32).unwrap();
            for pass in stack {
                pass.encode_into(buf);
            }
        }
    }

    pub fn decode_from(cursor: &mut Cursor<&[u8]>) -> Result<Self> {
        let mut stacks = CellPassStacks::new();
        let occupied = cursor.read_u32::<BigEndian>()? as usize;
        if occupied > SUBGRID_CELL_COUNT {
            return Err(Error::Decode(format!("{} occupied cells", occupied)));
        }

        for _ in 0..occupied {
            let index = cursor.read_u16::<BigEndian>()? as usize;
            if index >= SUBGRID_CELL_COUNT {
                return Err(Error::Decode(format!("cell index {}", index)));
            }
            let count = cursor.read_u32::<BigEndian>()? as usize;

            let mut stack = Vec::with_capacity(count.min(4096));
            for _ in 0..count {
                stack.push(CellPass::decode_from(cursor)?);
            }
            if stack.windows(2).any(|w| w[0].time > w[1].time) {
                return Err(Error::Decode(format!("unordered passes in cell {}", index)));
            }

            stacks.pass_count += stack.len() as u32;
            stacks.cells[index] = stack;
        }

        Ok(stacks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cells::pass_at;

    #[test]
    fn test_insert_orders_by_time_and_keeps_ties_in_arrival_order() {
        let mut stacks = CellPassStacks::new();
        stacks.add(3, 4, pass_at(2_000, 2.0));
        stacks.add(3, 4, pass_at(1_000, 1.0));
        stacks.add(3, 4, pass_at(2_000, 3.0));

        let heights: Vec<_> = stacks.passes(3, 4).iter().map(|p| p.height).collect();
        assert_eq!(heights, vec![1.0, 2.0, 3.0]);
        assert_eq!(stacks.pass_count(), 3);
        assert!(stacks.passes(4, 3).is_empty());
    }

    #[test]
    fn test_split_off() {
        let mut stacks = CellPassStacks::new();
        for (i, millis) in [100, 200, 300, 400].iter().enumerate() {
            stacks.add(i as u32, 0, pass_at(*millis, 0.0));
            stacks.add(0, 31, pass_at(*millis, 0.0));
        }

        let upper = stacks.split_off(DateTime::from_timestamp_millis(300).unwrap());
        assert_eq!(stacks.pass_count(), 4);
        assert_eq!(upper.pass_count(), 4);
        assert_eq!(upper.passes(0, 31).len(), 2);
        assert_eq!(upper.passes(2, 0).len(), 1);
        assert!(upper.passes(1, 0).is_empty());
    }

    #[test]
    fn test_codec() -> Result<()> {
        let mut stacks = CellPassStacks::new();
        stacks.add(0, 0, pass_at(10, 1.0));
        stacks.add(0, 0, pass_at(20, 2.0));
        stacks.add(31, 31, pass_at(15, 3.0));

        let mut buf = Vec::new();
        stacks.encode_into(&mut buf);
        let decoded = CellPassStacks::decode_from(&mut Cursor::new(buf.as_slice()))?;
        assert_eq!(decoded, stacks);

        let cells: Vec<_> = decoded.iter_cells().map(|(x, y, s)| (x, y, s.len())).collect();
        assert_eq!(cells, vec![(0, 0, 2), (31, 31, 1)]);
        Ok(())
    }
}
