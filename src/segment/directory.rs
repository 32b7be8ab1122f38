use std::io::Cursor;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use super::{LatestPasses, SegmentInfo};
use crate::encoding::{expect_magic, seal, unseal};
use crate::error::{Error, Result};

const MAGIC: &[u8; 4] = b"TDIR";
const VERSION: u8 = 1;

/// Persisted directory of a leaf subgrid.
///
/// ```text
/// | "TDIR" | version:u8 | next_version:u64 | count:u32 | SegmentInfo* |
/// | has_latest:u8 | LatestPasses? | crc32:u32 |
/// ```
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SegmentDirectory {
    /// Version handed to the next segment the leaf writes
    pub next_version: u64,
    pub segments: Vec<SegmentInfo>,
    pub global_latest: Option<LatestPasses>,
}

impl SegmentDirectory {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(MAGIC);
        buf.write_u8(VERSION).unwrap();
        buf.write_u64::<BigEndian>(self.next_version).unwrap();
        buf.write_u32::<BigEndian>(self.segments.len() as u32)
            .unwrap();
        for info in &self.segments {
            info.encode_into(&mut buf);
        }

        match &self.global_latest {
            Some(latest) => {
                buf.write_u8(1).unwrap();
                latest.encode_into(&mut buf);
            }
            None => buf.write_u8(0).unwrap(),
        }

        seal(&mut buf);
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        expect_magic(bytes, MAGIC, "directory")?;
        let body = unseal(bytes, "directory")?;
        if body.len() < MAGIC.len() {
            return Err(Error::Decode("directory: truncated header".to_string()));
        }
        let mut cursor = Cursor::new(&body[4..]);

        let version = cursor.read_u8()?;
        if version != VERSION {
            return Err(Error::Decode(format!("directory: version {}", version)));
        }

        let next_version = cursor.read_u64::<BigEndian>()?;
        let count = cursor.read_u32::<BigEndian>()? as usize;
        let mut segments = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            segments.push(SegmentInfo::decode_from(&mut cursor)?);
        }

        if segments
            .windows(2)
            .any(|w| w[0].end_time > w[1].start_time)
        {
            return Err(Error::Decode(
                "directory: overlapping or unordered segments".to_string(),
            ));
        }

        let global_latest = match cursor.read_u8()? {
            0 => None,
            _ => Some(LatestPasses::decode_from(&mut cursor)?),
        };

        let trailing = cursor.get_ref().len() as u64 - cursor.position();
        if trailing != 0 {
            return Err(Error::Decode(format!(
                "directory: {} trailing bytes",
                trailing
            )));
        }

        Ok(Self {
            next_version,
            segments,
            global_latest,
        })
    }
}
