//! TAG file decoding: from a machine's telemetry byte stream to cell passes.
//!
//! A TAG file is a self-describing stream of small typed values packed at
//! nybble granularity. The dictionary at the end of the file names each
//! value type; the data section is a sequence of `(type id, payload)`
//! records.
//!
//! ```text
//!  0        16                                 dictionary_offset        EOF
//!  | header |  record record record ... 0 pad  | name\0 type id ... \0   |
//!             │
//!             ▼
//!  TagFileReader ──► TagValueSink ──► MatcherSink ──► ValueMatcher ──► TagProcessor
//!                                                      (by name)        (epoch commit)
//! ```
//!
//! Decoding never fails with an error value: every outcome is a
//! [`TagReadResult`].

pub mod converter;
pub mod matchers;
pub mod nybble;
pub mod processor;
pub mod reader;
pub mod sink;
pub mod state;
pub mod writer;

pub use converter::{ConvertedTagFile, TagFileConverter};
pub use matchers::{MatcherRegistry, ValueMatcher, ValueMatcherTarget};
pub use processor::{EpochStats, TagProcessor};
pub use reader::TagFileReader;
pub use sink::{MatcherSink, TagValueSink};
pub use state::{MachineIdentity, PointSet, TagProcessorState};
pub use writer::TagFileWriter;

use std::fmt;

/// Size of the fixed file header in bytes.
pub const TAG_HEADER_SIZE: usize = 16;

/// Highest major format version the reader understands.
pub const TAG_FORMAT_MAJOR_VERSION: u8 = 1;

/// Outcome of reading one TAG file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TagReadResult {
    NoError,
    ZeroLengthFile,
    InvalidHeader,
    InvalidDictionary,
    InvalidDictionaryEntry,
    InvalidValueTypeId,
    InvalidValue,
    UnexpectedEndOfData,
    SinkStartingFailure,
    SinkFinishingFailure,
    ProcessingAborted,
}

impl TagReadResult {
    pub fn is_ok(&self) -> bool {
        *self == TagReadResult::NoError
    }
}

impl fmt::Display for TagReadResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            TagReadResult::NoError => "no error",
            TagReadResult::ZeroLengthFile => "file is empty",
            TagReadResult::InvalidHeader => "invalid header",
            TagReadResult::InvalidDictionary => "invalid dictionary",
            TagReadResult::InvalidDictionaryEntry => "invalid dictionary entry",
            TagReadResult::InvalidValueTypeId => "value with unknown type id",
            TagReadResult::InvalidValue => "invalid value",
            TagReadResult::UnexpectedEndOfData => "unexpected end of data",
            TagReadResult::SinkStartingFailure => "sink failed to start",
            TagReadResult::SinkFinishingFailure => "sink failed to finish",
            TagReadResult::ProcessingAborted => "processing aborted",
        };
        f.write_str(reason)
    }
}

/// Payload type of a dictionary entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TagDataType {
    Int4 = 0,
    Int8 = 1,
    Int12 = 2,
    Int16 = 3,
    Int32 = 4,
    UInt4 = 5,
    UInt8 = 6,
    UInt12 = 7,
    UInt16 = 8,
    UInt32 = 9,
    Single = 10,
    Double = 11,
    Empty = 12,
    AnsiString = 13,
    UnicodeString = 14,
}

impl TagDataType {
    pub fn from_u8(value: u8) -> Option<Self> {
        use TagDataType::*;
        let data_type = match value {
            0 => Int4,
            1 => Int8,
            2 => Int12,
            3 => Int16,
            4 => Int32,
            5 => UInt4,
            6 => UInt8,
            7 => UInt12,
            8 => UInt16,
            9 => UInt32,
            10 => Single,
            11 => Double,
            12 => Empty,
            13 => AnsiString,
            14 => UnicodeString,
            _ => return None,
        };
        Some(data_type)
    }

    /// Payload width in nybbles. `None` for NUL-terminated strings.
    pub fn nybble_width(&self) -> Option<usize> {
        use TagDataType::*;
        match self {
            Int4 | UInt4 => Some(1),
            Int8 | UInt8 => Some(2),
            Int12 | UInt12 => Some(3),
            Int16 | UInt16 => Some(4),
            Int32 | UInt32 | Single => Some(8),
            Double => Some(16),
            Empty => Some(0),
            AnsiString | UnicodeString => None,
        }
    }

    pub fn is_signed(&self) -> bool {
        use TagDataType::*;
        matches!(self, Int4 | Int8 | Int12 | Int16 | Int32)
    }

    pub fn is_unsigned(&self) -> bool {
        use TagDataType::*;
        matches!(self, UInt4 | UInt8 | UInt12 | UInt16 | UInt32)
    }
}

/// One dictionary entry: a value type's name, payload type and id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TagDictionaryEntry {
    pub name: String,
    pub data_type: TagDataType,
    pub id: u16,
}

impl TagDictionaryEntry {
    pub fn new(name: impl Into<String>, data_type: TagDataType, id: u16) -> Self {
        Self {
            name: name.into(),
            data_type,
            id,
        }
    }
}

/// The fixed 16 byte file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TagHeader {
    pub major_version: u8,
    pub minor_version: u8,
    pub dictionary_id: u32,
    pub dictionary_major_version: u8,
    pub dictionary_minor_version: u8,
    pub dictionary_offset: u64,
}

impl Default for TagHeader {
    fn default() -> Self {
        Self {
            major_version: TAG_FORMAT_MAJOR_VERSION,
            minor_version: 0,
            dictionary_id: 0,
            dictionary_major_version: 1,
            dictionary_minor_version: 0,
            dictionary_offset: TAG_HEADER_SIZE as u64,
        }
    }
}
