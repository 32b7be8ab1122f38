use std::collections::HashMap;
use std::io::Cursor;

use byteorder::{BigEndian, ReadBytesExt};

use super::nybble::{NybbleReader, NybbleResult};
use super::sink::TagValueSink;
use super::{
    TagDataType, TagDictionaryEntry, TagHeader, TagReadResult, TAG_FORMAT_MAJOR_VERSION,
    TAG_HEADER_SIZE,
};

/// Decodes a TAG byte stream into sink calls.
///
/// `Start -> (read value -> dispatch)* -> Finish`. Any malformed input ends
/// the read with the matching [`TagReadResult`]; the sink's `aborted` is
/// called when it had been started.
pub struct TagFileReader;

impl TagFileReader {
    pub fn read(bytes: &[u8], sink: &mut dyn TagValueSink) -> TagReadResult {
        let (header, dictionary) = match Self::read_preamble(bytes) {
            Ok(preamble) => preamble,
            Err(result) => return result,
        };

        if !sink.starting() {
            return TagReadResult::SinkStartingFailure;
        }

        let end = header.dictionary_offset as usize;
        let mut data = NybbleReader::new(bytes, TAG_HEADER_SIZE, end);
        if let Err(result) = Self::read_records(&mut data, &dictionary, sink) {
            sink.aborted();
            return result;
        }

        if !sink.finishing() {
            return TagReadResult::SinkFinishingFailure;
        }
        TagReadResult::NoError
    }

    /// Reads the header and dictionary without touching the data section.
    pub fn read_preamble(
        bytes: &[u8],
    ) -> NybbleResult<(TagHeader, HashMap<u16, TagDictionaryEntry>)> {
        if bytes.is_empty() {
            return Err(TagReadResult::ZeroLengthFile);
        }
        let header = Self::read_header(bytes)?;
        let dictionary = Self::read_dictionary(bytes, header.dictionary_offset as usize)?;
        Ok((header, dictionary))
    }

    fn read_header(bytes: &[u8]) -> NybbleResult<TagHeader> {
        if bytes.len() < TAG_HEADER_SIZE {
            return Err(TagReadResult::InvalidHeader);
        }

        let mut cursor = Cursor::new(&bytes[..TAG_HEADER_SIZE]);
        let invalid = |_| TagReadResult::InvalidHeader;
        let header = TagHeader {
            major_version: cursor.read_u8().map_err(invalid)?,
            minor_version: cursor.read_u8().map_err(invalid)?,
            dictionary_id: cursor.read_u32::<BigEndian>().map_err(invalid)?,
            dictionary_major_version: cursor.read_u8().map_err(invalid)?,
            dictionary_minor_version: cursor.read_u8().map_err(invalid)?,
            dictionary_offset: cursor.read_u64::<BigEndian>().map_err(invalid)?,
        };

        if header.major_version == 0 || header.major_version > TAG_FORMAT_MAJOR_VERSION {
            return Err(TagReadResult::InvalidHeader);
        }
        if header.dictionary_offset < TAG_HEADER_SIZE as u64
            || header.dictionary_offset > bytes.len() as u64
        {
            return Err(TagReadResult::InvalidHeader);
        }
        Ok(header)
    }

    fn read_dictionary(
        bytes: &[u8],
        offset: usize,
    ) -> NybbleResult<HashMap<u16, TagDictionaryEntry>> {
        let mut dictionary = HashMap::new();
        let mut rest = &bytes[offset..];

        loop {
            let nul = rest
                .iter()
                .position(|b| *b == 0)
                .ok_or(TagReadResult::InvalidDictionary)?;
            if nul == 0 {
                return Ok(dictionary);
            }

            let name = std::str::from_utf8(&rest[..nul])
                .map_err(|_| TagReadResult::InvalidDictionaryEntry)?
                .to_string();
            let fields = rest
                .get(nul + 1..nul + 4)
                .ok_or(TagReadResult::InvalidDictionary)?;
            let data_type =
                TagDataType::from_u8(fields[0]).ok_or(TagReadResult::InvalidDictionaryEntry)?;
            let id = u16::from_be_bytes([fields[1], fields[2]]);

            if id == 0 || dictionary.contains_key(&id) {
                return Err(TagReadResult::InvalidDictionaryEntry);
            }
            dictionary.insert(id, TagDictionaryEntry::new(name, data_type, id));
            rest = &rest[nul + 4..];
        }
    }

    fn read_records(
        data: &mut NybbleReader<'_>,
        dictionary: &HashMap<u16, TagDictionaryEntry>,
        sink: &mut dyn TagValueSink,
    ) -> NybbleResult<()> {
        while !data.is_empty() {
            let id = data.read_varint()?;
            if id == 0 {
                break;
            }
            let entry = u16::try_from(id)
                .ok()
                .and_then(|id| dictionary.get(&id))
                .ok_or(TagReadResult::InvalidValueTypeId)?;

            if !Self::read_value(data, entry, sink)? {
                return Err(TagReadResult::ProcessingAborted);
            }
        }
        Ok(())
    }

    fn read_value(
        data: &mut NybbleReader<'_>,
        entry: &TagDictionaryEntry,
        sink: &mut dyn TagValueSink,
    ) -> NybbleResult<bool> {
        let data_type = entry.data_type;
        let accepted = match data_type {
            TagDataType::Empty => sink.read_empty(entry),
            TagDataType::Single => {
                let bits = data.read_bits(8)? as u32;
                sink.read_single(entry, f32::from_bits(bits))
            }
            TagDataType::Double => {
                let bits = data.read_bits(16)?;
                sink.read_double(entry, f64::from_bits(bits))
            }
            TagDataType::AnsiString => {
                let mut value = Vec::new();
                loop {
                    match data.read_byte()? {
                        0 => break,
                        byte => value.push(byte),
                    }
                }
                sink.read_ansi(entry, &value)
            }
            TagDataType::UnicodeString => {
                let mut units = Vec::new();
                loop {
                    match data.read_bits(4)? as u16 {
                        0 => break,
                        unit => units.push(unit),
                    }
                }
                let value = String::from_utf16(&units).map_err(|_| TagReadResult::InvalidValue)?;
                sink.read_unicode(entry, &value)
            }
            _ => {
                let width = data_type.nybble_width().unwrap_or(0);
                let raw = data.read_bits(width)?;
                if data_type.is_signed() {
                    sink.read_integer(entry, sign_extend(raw, width * 4))
                } else {
                    sink.read_unsigned(entry, raw as u32)
                }
            }
        };
        Ok(accepted)
    }
}

fn sign_extend(raw: u64, bits: usize) -> i32 {
    let shift = 64 - bits;
    ((raw << shift) as i64 >> shift) as i32
}
