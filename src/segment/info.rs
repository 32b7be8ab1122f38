use std::io::Cursor;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use chrono::{DateTime, Utc};

use super::{read_time, write_time, SegmentForm, MAX_SEGMENT_TIME, MIN_SEGMENT_TIME};
use crate::error::{Error, Result};

/// Descriptor of one segment in a leaf's directory.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentInfo {
    /// Inclusive start
    pub start_time: DateTime<Utc>,
    /// Exclusive end
    pub end_time: DateTime<Utc>,
    pub version: u64,
    pub form: SegmentForm,
    pub exists_in_store: bool,
    pub pass_count: u32,
}

impl SegmentInfo {
    pub fn new(start_time: DateTime<Utc>, end_time: DateTime<Utc>) -> Self {
        Self {
            start_time,
            end_time,
            version: 0,
            form: SegmentForm::FullPassStack,
            exists_in_store: false,
            pass_count: 0,
        }
    }

    /// A segment spanning the whole time axis.
    pub fn unbounded() -> Self {
        Self::new(MIN_SEGMENT_TIME, MAX_SEGMENT_TIME)
    }

    pub fn contains(&self, time: DateTime<Utc>) -> bool {
        self.start_time <= time && time < self.end_time
    }

    pub fn overlaps(&self, other: &SegmentInfo) -> bool {
        self.start_time < other.end_time && other.start_time < self.end_time
    }

    pub fn is_open_ended(&self) -> bool {
        self.end_time == MAX_SEGMENT_TIME
    }

    /// Name of the segment's blob under its leaf's key.
    pub fn segment_identifier(&self) -> String {
        format!(
            "{}-{}-{}",
            self.version,
            self.start_time.timestamp_millis(),
            self.end_time.timestamp_millis()
        )
    }

    /// Moves the segment to `version`, returning the identifier it had.
    pub fn touch(&mut self, version: u64) -> String {
        let previous = self.segment_identifier();
        self.version = version;
        previous
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        write_time(buf, &self.start_time);
        write_time(buf, &self.end_time);
        buf.write_u64::<BigEndian>(self.version).unwrap();
        buf.write_u8(self.form as u8).unwrap();
        buf.write_u8(self.exists_in_store as u8).unwrap();
        buf.write_u32::<BigEndian>(self.pass_count).unwrap();
    }

    pub fn decode_from(cursor: &mut Cursor<&[u8]>) -> Result<Self> {
        let start_time = read_time(cursor)?;
        let end_time = read_time(cursor)?;
        let version = cursor.read_u64::<BigEndian>()?;
        let form_byte = cursor.read_u8()?;
        let form = SegmentForm::from_u8(form_byte)
            .ok_or_else(|| Error::Decode(format!("segment form {}", form_byte)))?;
        let exists_in_store = cursor.read_u8()? != 0;
        let pass_count = cursor.read_u32::<BigEndian>()?;

        if start_time >= end_time {
            return Err(Error::Decode(format!(
                "segment range {} .. {}",
                start_time, end_time
            )));
        }

        Ok(Self {
            start_time,
            end_time,
            version,
            form,
            exists_in_store,
            pass_count,
        })
    }
}
