//! Segment blob codec.
//!
//! ```text
//! +-------------+-----------+--------+---------+-----------------+----------+
//! | magic "TSEG"| version:u8| form:u8| flags:u8| payload         | crc32:u32|
//! +-------------+-----------+--------+---------+-----------------+----------+
//! ```
//!
//! The payload is the pass stacks followed by the latest pass grid
//! (`FullPassStack`) or the latest pass grid alone (`LatestPassGrid`).
//! With `FLAG_COMPRESSED` set the payload is LZ4 compressed with its
//! uncompressed size prepended. Mutable stores hold uncompressed full pass
//! stacks; the immutable form is chosen by configuration.

use std::io::Cursor;

use byteorder::{ReadBytesExt, WriteBytesExt};

use super::{CellPassStacks, LatestPasses, SegmentForm};
use crate::encoding::{expect_magic, seal, unseal};
use crate::error::{Error, Result};

const MAGIC: &[u8; 4] = b"TSEG";
const VERSION: u8 = 1;
const HEADER_SIZE: usize = 7;
const FLAG_COMPRESSED: u8 = 0x01;

/// A decoded segment body.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentBlob {
    pub form: SegmentForm,
    /// Present for `FullPassStack` only
    pub passes: Option<CellPassStacks>,
    pub latest: LatestPasses,
}

impl SegmentBlob {
    pub fn full(passes: CellPassStacks) -> Self {
        let latest = LatestPasses::from_stacks(&passes);
        Self {
            form: SegmentForm::FullPassStack,
            passes: Some(passes),
            latest,
        }
    }

    /// Rebuilds the blob in another form. Dropping to `LatestPassGrid`
    /// discards the stacks; the reverse is not possible.
    pub fn into_form(self, form: SegmentForm) -> Result<Self> {
        match (form, self.passes) {
            (SegmentForm::FullPassStack, None) => Err(Error::InvalidArgument(
                "latest pass grid cannot be expanded into pass stacks".to_string(),
            )),
            (SegmentForm::FullPassStack, passes) => Ok(Self {
                form,
                passes,
                latest: self.latest,
            }),
            (SegmentForm::LatestPassGrid, _) => Ok(Self {
                form,
                passes: None,
                latest: self.latest,
            }),
        }
    }

    pub fn encode(&self, compress: bool) -> Vec<u8> {
        encode_parts(self.form, self.passes.as_ref(), &self.latest, compress)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        expect_magic(bytes, MAGIC, "segment")?;
        let body = unseal(bytes, "segment")?;
        if body.len() < HEADER_SIZE {
            return Err(Error::Decode("segment: truncated header".to_string()));
        }

        let mut header = Cursor::new(&body[4..HEADER_SIZE]);
        let version = header.read_u8()?;
        if version != VERSION {
            return Err(Error::Decode(format!("segment: version {}", version)));
        }
        let form_byte = header.read_u8()?;
        let form = SegmentForm::from_u8(form_byte)
            .ok_or_else(|| Error::Decode(format!("segment form {}", form_byte)))?;
        let flags = header.read_u8()?;

        let raw = &body[HEADER_SIZE..];
        let decompressed;
        let payload = if flags & FLAG_COMPRESSED != 0 {
            decompressed = lz4_flex::decompress_size_prepended(raw)
                .map_err(|e| Error::Decode(format!("segment payload: {}", e)))?;
            decompressed.as_slice()
        } else {
            raw
        };

        let mut cursor = Cursor::new(payload);
        let passes = match form {
            SegmentForm::FullPassStack => Some(CellPassStacks::decode_from(&mut cursor)?),
            SegmentForm::LatestPassGrid => None,
        };
        let latest = LatestPasses::decode_from(&mut cursor)?;

        if cursor.position() as usize != payload.len() {
            return Err(Error::Decode(format!(
                "segment: {} trailing bytes",
                payload.len() - cursor.position() as usize
            )));
        }

        Ok(Self {
            form,
            passes,
            latest,
        })
    }
}

/// Encodes a segment body from borrowed parts. Missing stacks in the
/// `FullPassStack` form are written as empty.
pub fn encode_parts(
    form: SegmentForm,
    passes: Option<&CellPassStacks>,
    latest: &LatestPasses,
    compress: bool,
) -> Vec<u8> {
    let mut payload = Vec::new();
    if form == SegmentForm::FullPassStack {
        match passes {
            Some(passes) => passes.encode_into(&mut payload),
            None => CellPassStacks::new().encode_into(&mut payload),
        }
    }
    latest.encode_into(&mut payload);

    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len() + 4);
    buf.extend_from_slice(MAGIC);
    buf.write_u8(VERSION).unwrap();
    buf.write_u8(form as u8).unwrap();

    if compress {
        buf.write_u8(FLAG_COMPRESSED).unwrap();
        buf.extend_from_slice(&lz4_flex::compress_prepend_size(&payload));
    } else {
        buf.write_u8(0).unwrap();
        buf.extend_from_slice(&payload);
    }

    seal(&mut buf);
    buf
}
