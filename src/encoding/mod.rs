pub mod bincode;

use byteorder::{BigEndian, ByteOrder};
use crc::{Crc, CRC_32_ISCSI};

use crate::error::{Error, Result};

/// Checksum used by every persisted blob and store log batch.
pub const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Trait for encoding values for storage.
///
/// Used for the small metadata streams (machine lists, design lists) that
/// don't warrant a hand-written binary layout.
pub trait Value {
    /// Encode the value to bytes
    fn encode(&self) -> Result<Vec<u8>>;

    /// Decode bytes back to the original value type
    fn decode(bytes: &[u8]) -> Result<Self>
    where
        Self: Sized;
}

/// Appends the CRC-32 of everything already in `buf`.
pub fn seal(buf: &mut Vec<u8>) {
    let checksum = CRC32.checksum(buf);
    buf.extend_from_slice(&checksum.to_be_bytes());
}

/// Verifies a trailing CRC-32 and returns the bytes it covers.
pub fn unseal<'a>(bytes: &'a [u8], what: &'static str) -> Result<&'a [u8]> {
    if bytes.len() < 4 {
        return Err(Error::Decode(format!("{}: {} bytes", what, bytes.len())));
    }

    let (body, trailer) = bytes.split_at(bytes.len() - 4);
    if CRC32.checksum(body) != BigEndian::read_u32(trailer) {
        return Err(Error::ChecksumMismatch(what));
    }
    Ok(body)
}

/// Checks a 4-byte magic at the start of `bytes`.
pub fn expect_magic(bytes: &[u8], magic: &[u8; 4], what: &'static str) -> Result<()> {
    if bytes.len() < 4 || &bytes[..4] != magic {
        return Err(Error::Decode(format!("{}: bad magic", what)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_and_unseal() -> Result<()> {
        let mut buf = b"payload".to_vec();
        seal(&mut buf);
        assert_eq!(buf.len(), 11);
        assert_eq!(unseal(&buf, "test")?, b"payload");

        buf[2] ^= 0xFF;
        assert!(matches!(
            unseal(&buf, "test"),
            Err(Error::ChecksumMismatch("test"))
        ));
        assert!(matches!(unseal(&[1, 2], "test"), Err(Error::Decode(_))));
        Ok(())
    }
}
