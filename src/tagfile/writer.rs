use std::collections::HashMap;

use byteorder::{BigEndian, WriteBytesExt};

use super::nybble::NybbleWriter;
use super::{TagDataType, TagDictionaryEntry, TagHeader, TAG_HEADER_SIZE};

/// Builds TAG byte streams: synthetic machine files for replay and tests.
///
/// Dictionary ids are assigned from 1 in order of first use of each
/// `(name, type)` pair.
#[derive(Debug, Default)]
pub struct TagFileWriter {
    header: TagHeader,
    entries: Vec<TagDictionaryEntry>,
    ids: HashMap<(String, TagDataType), u16>,
    data: NybbleWriter,
}

impl TagFileWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dictionary_id(mut self, id: u32) -> Self {
        self.header.dictionary_id = id;
        self
    }

    fn id_for(&mut self, name: &str, data_type: TagDataType) -> u16 {
        let key = (name.to_string(), data_type);
        if let Some(id) = self.ids.get(&key) {
            return *id;
        }
        let id = self.entries.len() as u16 + 1;
        self.entries.push(TagDictionaryEntry::new(name, data_type, id));
        self.ids.insert(key, id);
        id
    }

    fn record(&mut self, name: &str, data_type: TagDataType) {
        let id = self.id_for(name, data_type);
        self.data.write_varint(id as u32);
    }

    /// A signed value, truncated to the width of `data_type`.
    pub fn integer(&mut self, name: &str, data_type: TagDataType, value: i32) -> &mut Self {
        self.record(name, data_type);
        let width = data_type.nybble_width().unwrap_or(0);
        self.data.write_bits(value as u32 as u64, width);
        self
    }

    pub fn unsigned(&mut self, name: &str, data_type: TagDataType, value: u32) -> &mut Self {
        self.record(name, data_type);
        let width = data_type.nybble_width().unwrap_or(0);
        self.data.write_bits(value as u64, width);
        self
    }

    pub fn single(&mut self, name: &str, value: f32) -> &mut Self {
        self.record(name, TagDataType::Single);
        self.data.write_bits(value.to_bits() as u64, 8);
        self
    }

    pub fn double(&mut self, name: &str, value: f64) -> &mut Self {
        self.record(name, TagDataType::Double);
        self.data.write_bits(value.to_bits(), 16);
        self
    }

    pub fn empty(&mut self, name: &str) -> &mut Self {
        self.record(name, TagDataType::Empty);
        self
    }

    /// Bytes of `value` up to any interior NUL.
    pub fn ansi(&mut self, name: &str, value: &str) -> &mut Self {
        self.record(name, TagDataType::AnsiString);
        for byte in value.bytes().take_while(|b| *b != 0) {
            self.data.write_byte(byte);
        }
        self.data.write_byte(0);
        self
    }

    pub fn unicode(&mut self, name: &str, value: &str) -> &mut Self {
        self.record(name, TagDataType::UnicodeString);
        for unit in value.encode_utf16().take_while(|u| *u != 0) {
            self.data.write_bits(unit as u64, 4);
        }
        self.data.write_bits(0, 4);
        self
    }

    /// A record with an arbitrary type id and payload nybbles, which need
    /// not match any dictionary entry.
    pub fn raw_record(&mut self, id: u32, nybbles: &[u8]) -> &mut Self {
        self.data.write_varint(id);
        for nybble in nybbles {
            self.data.write_nybble(*nybble);
        }
        self
    }

    pub fn finish(self) -> Vec<u8> {
        let data = self.data.into_bytes();
        let mut buf = Vec::with_capacity(TAG_HEADER_SIZE + data.len() + 16 * self.entries.len());

        buf.write_u8(self.header.major_version).unwrap();
        buf.write_u8(self.header.minor_version).unwrap();
        buf.write_u32::<BigEndian>(self.header.dictionary_id).unwrap();
        buf.write_u8(self.header.dictionary_major_version).unwrap();
        buf.write_u8(self.header.dictionary_minor_version).unwrap();
        buf.write_u64::<BigEndian>((TAG_HEADER_SIZE + data.len()) as u64)
            .unwrap();
        buf.extend_from_slice(&data);

        for entry in &self.entries {
            buf.extend_from_slice(entry.name.as_bytes());
            buf.write_u8(0).unwrap();
            buf.write_u8(entry.data_type as u8).unwrap();
            buf.write_u16::<BigEndian>(entry.id).unwrap();
        }
        buf.write_u8(0).unwrap();
        buf
    }
}
