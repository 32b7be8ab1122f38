//! Segments: time-bounded partitions of a leaf's cell pass history.
//!
//! A leaf's segments are kept sorted by start time and together partition
//! `[MIN_SEGMENT_TIME, MAX_SEGMENT_TIME)`:
//!
//! ```text
//!  MIN                 t1                  t2                       MAX
//!   |---- v3-min-t1 ----|---- v7-t1-t2 ----|------- v9-t2-max -------|
//! ```
//!
//! Each segment is persisted as its own blob named by its identifier
//! (`{version}-{start_ms}-{end_ms}`); the leaf's directory blob lists the
//! descriptors. Rewriting a segment always produces a new identifier, so
//! the superseded blob can be retired later without racing readers.

pub mod body;
pub mod cleaver;
pub mod directory;
pub mod info;
pub mod latest;
pub mod passes;

pub use body::{encode_parts, SegmentBlob};
pub use cleaver::{plan_split_times, split_segment};
pub use directory::SegmentDirectory;
pub use info::SegmentInfo;
pub use latest::LatestPasses;
pub use passes::CellPassStacks;

use std::io::Cursor;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use chrono::{DateTime, Utc};

use crate::error::{Error, Result};

/// Start of the first segment of every leaf. TAG time cannot precede it.
pub const MIN_SEGMENT_TIME: DateTime<Utc> = DateTime::<Utc>::UNIX_EPOCH;

/// Open end of the last segment of every leaf.
pub const MAX_SEGMENT_TIME: DateTime<Utc> = DateTime::<Utc>::MAX_UTC;

/// How a segment body is laid out in storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum SegmentForm {
    /// Every pass of every cell plus the latest pass grid
    #[default]
    FullPassStack = 0,
    /// The latest pass grid only
    LatestPassGrid = 1,
}

impl SegmentForm {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(SegmentForm::FullPassStack),
            1 => Some(SegmentForm::LatestPassGrid),
            _ => None,
        }
    }
}

/// Segment boundaries are written with full precision so the open end
/// survives a round trip.
pub(crate) fn write_time(buf: &mut Vec<u8>, time: &DateTime<Utc>) {
    buf.write_i64::<BigEndian>(time.timestamp()).unwrap();
    buf.write_u32::<BigEndian>(time.timestamp_subsec_nanos())
        .unwrap();
}

pub(crate) fn read_time(cursor: &mut Cursor<&[u8]>) -> Result<DateTime<Utc>> {
    let secs = cursor.read_i64::<BigEndian>()?;
    let nanos = cursor.read_u32::<BigEndian>()?;
    DateTime::from_timestamp(secs, nanos)
        .ok_or_else(|| Error::Decode(format!("segment time {}.{:09}", secs, nanos)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_boundary_times_roundtrip() -> Result<()> {
        for time in [MIN_SEGMENT_TIME, MAX_SEGMENT_TIME] {
            let mut buf = Vec::new();
            write_time(&mut buf, &time);
            assert_eq!(read_time(&mut Cursor::new(buf.as_slice()))?, time);
        }
        Ok(())
    }
}
