//! Nybble-granular cursor and builder over byte buffers. Within a byte the
//! high nybble comes first.

use super::TagReadResult;

/// Longest varint accepted; keeps type ids within `u32`.
const MAX_VARINT_NYBBLES: usize = 11;

pub type NybbleResult<T> = std::result::Result<T, TagReadResult>;

pub struct NybbleReader<'a> {
    data: &'a [u8],
    /// Next nybble to read
    pos: usize,
    /// One past the last readable nybble
    end: usize,
}

impl<'a> NybbleReader<'a> {
    /// Reads nybbles of `data[start..end]` (byte offsets).
    pub fn new(data: &'a [u8], start: usize, end: usize) -> Self {
        let end = end.min(data.len());
        Self {
            data,
            pos: start.min(end) * 2,
            end: end * 2,
        }
    }

    pub fn remaining(&self) -> usize {
        self.end - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.end
    }

    pub fn read_nybble(&mut self) -> NybbleResult<u8> {
        if self.pos >= self.end {
            return Err(TagReadResult::UnexpectedEndOfData);
        }
        let byte = self.data[self.pos / 2];
        let nybble = if self.pos % 2 == 0 {
            byte >> 4
        } else {
            byte & 0x0F
        };
        self.pos += 1;
        Ok(nybble)
    }

    /// Big-endian value spread over `count` nybbles (at most 16).
    pub fn read_bits(&mut self, count: usize) -> NybbleResult<u64> {
        if count > self.remaining() {
            return Err(TagReadResult::UnexpectedEndOfData);
        }
        let mut value = 0u64;
        for _ in 0..count {
            value = (value << 4) | self.read_nybble()? as u64;
        }
        Ok(value)
    }

    /// Variable length unsigned value: 3 value bits per nybble, most
    /// significant group first, high bit set on every nybble but the last.
    pub fn read_varint(&mut self) -> NybbleResult<u32> {
        let mut value = 0u64;
        for _ in 0..MAX_VARINT_NYBBLES {
            let nybble = self.read_nybble()?;
            value = (value << 3) | (nybble & 0x07) as u64;
            if nybble & 0x08 == 0 {
                return u32::try_from(value).map_err(|_| TagReadResult::InvalidValueTypeId);
            }
        }
        Err(TagReadResult::InvalidValueTypeId)
    }

    pub fn read_byte(&mut self) -> NybbleResult<u8> {
        Ok(self.read_bits(2)? as u8)
    }
}

/// Builds a nybble stream. The last byte is padded with a zero nybble.
#[derive(Debug, Default)]
pub struct NybbleWriter {
    bytes: Vec<u8>,
    half: bool,
}

impl NybbleWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_nybble(&mut self, nybble: u8) {
        let nybble = nybble & 0x0F;
        if self.half {
            if let Some(last) = self.bytes.last_mut() {
                *last |= nybble;
            }
        } else {
            self.bytes.push(nybble << 4);
        }
        self.half = !self.half;
    }

    pub fn write_bits(&mut self, value: u64, count: usize) {
        for i in (0..count).rev() {
            self.write_nybble(((value >> (i * 4)) & 0x0F) as u8);
        }
    }

    pub fn write_varint(&mut self, value: u32) {
        let mut groups = vec![(value & 0x07) as u8];
        let mut rest = value >> 3;
        while rest != 0 {
            groups.push((rest & 0x07) as u8 | 0x08);
            rest >>= 3;
        }
        for group in groups.into_iter().rev() {
            self.write_nybble(group);
        }
    }

    pub fn write_byte(&mut self, byte: u8) {
        self.write_bits(byte as u64, 2);
    }

    pub fn nybble_len(&self) -> usize {
        self.bytes.len() * 2 - usize::from(self.half)
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_varint_boundaries() {
        let values = [0u32, 1, 7, 8, 63, 64, 4_095, 100_000, u32::MAX];
        let mut writer = NybbleWriter::new();
        for value in values {
            writer.write_varint(value);
        }
        let bytes = writer.into_bytes();

        let mut reader = NybbleReader::new(&bytes, 0, bytes.len());
        for value in values {
            assert_eq!(reader.read_varint(), Ok(value));
        }
    }

    #[test]
    fn test_odd_nybble_alignment() {
        let mut writer = NybbleWriter::new();
        writer.write_nybble(0xA);
        writer.write_bits(0x1234, 4);
        assert_eq!(writer.nybble_len(), 5);
        let bytes = writer.into_bytes();
        assert_eq!(bytes, vec![0xA1, 0x23, 0x40]);

        let mut reader = NybbleReader::new(&bytes, 0, bytes.len());
        assert_eq!(reader.read_nybble(), Ok(0xA));
        assert_eq!(reader.read_bits(4), Ok(0x1234));
        assert_eq!(reader.remaining(), 1);
        assert_eq!(reader.read_bits(2), Err(TagReadResult::UnexpectedEndOfData));
    }

    #[test]
    fn test_unterminated_varint() {
        let bytes = [0xFF; 8];
        let mut reader = NybbleReader::new(&bytes, 0, bytes.len());
        assert_eq!(reader.read_varint(), Err(TagReadResult::InvalidValueTypeId));

        let bytes = [0x88];
        let mut reader = NybbleReader::new(&bytes, 0, bytes.len());
        assert_eq!(reader.read_varint(), Err(TagReadResult::UnexpectedEndOfData));
    }
}
