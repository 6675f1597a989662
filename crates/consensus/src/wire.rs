//! Wire codec primitives.
//!
//! All consensus messages share one encoding discipline: little-endian
//! integers, Bitcoin-style compact varints for lengths, and var-length byte
//! strings framed by a varint. Every reader checks the remaining buffer
//! before touching it; a short or malformed buffer is a [`WireError`], never
//! a panic.

use bytes::{Buf, BufMut};

/// Upper bound on any var-length field. Inbound messages are adversarial;
/// a length prefix beyond this is treated as malformed rather than allocated.
const MAX_VAR_LEN: u64 = 1 << 20;

/// Errors produced while encoding or decoding wire data
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    /// Buffer ended before the field was complete
    #[error("unexpected end of buffer: needed {needed} more bytes")]
    UnexpectedEof {
        /// Bytes missing from the buffer
        needed: usize,
    },

    /// Varint prefix was not minimally encoded or exceeds bounds
    #[error("malformed varint")]
    BadVarint,

    /// A var-length field declared an unreasonable size
    #[error("declared length {len} exceeds maximum {max}")]
    LengthOutOfBounds {
        /// Declared length
        len: u64,
        /// Allowed maximum
        max: u64,
    },

    /// A fixed-length field had the wrong size
    #[error("invalid field length: expected {expected}, got {actual}")]
    InvalidLength {
        /// Expected byte count
        expected: usize,
        /// Actual byte count
        actual: usize,
    },

    /// Unknown enum discriminant on the wire
    #[error("invalid discriminant: {0}")]
    InvalidDiscriminant(u8),

    /// Embedded public key bytes failed curve validation
    #[error("invalid embedded public key")]
    InvalidKey,

    /// A list carried the wrong number of elements
    #[error("invalid element count: expected {expected}, got {actual}")]
    InvalidCount {
        /// Expected element count
        expected: u64,
        /// Actual element count
        actual: u64,
    },
}

fn ensure(buf: &impl Buf, needed: usize) -> Result<(), WireError> {
    if buf.remaining() < needed {
        return Err(WireError::UnexpectedEof {
            needed: needed - buf.remaining(),
        });
    }
    Ok(())
}

/// Write a compact varint.
///
/// Values below 0xfd are a single byte; larger values carry a one-byte marker
/// followed by the little-endian u16/u32/u64.
pub fn write_varint(buf: &mut impl BufMut, value: u64) {
    match value {
        0..=0xfc => buf.put_u8(value as u8),
        0xfd..=0xffff => {
            buf.put_u8(0xfd);
            buf.put_u16_le(value as u16);
        }
        0x1_0000..=0xffff_ffff => {
            buf.put_u8(0xfe);
            buf.put_u32_le(value as u32);
        }
        _ => {
            buf.put_u8(0xff);
            buf.put_u64_le(value);
        }
    }
}

/// Read a compact varint, rejecting non-minimal encodings.
pub fn read_varint(buf: &mut impl Buf) -> Result<u64, WireError> {
    ensure(buf, 1)?;
    let marker = buf.get_u8();
    let value = match marker {
        0..=0xfc => u64::from(marker),
        0xfd => {
            ensure(buf, 2)?;
            let v = u64::from(buf.get_u16_le());
            if v < 0xfd {
                return Err(WireError::BadVarint);
            }
            v
        }
        0xfe => {
            ensure(buf, 4)?;
            let v = u64::from(buf.get_u32_le());
            if v <= 0xffff {
                return Err(WireError::BadVarint);
            }
            v
        }
        0xff => {
            ensure(buf, 8)?;
            let v = buf.get_u64_le();
            if v <= 0xffff_ffff {
                return Err(WireError::BadVarint);
            }
            v
        }
    };
    Ok(value)
}

/// Write a varint-length-prefixed byte string.
pub fn write_varbytes(buf: &mut impl BufMut, bytes: &[u8]) {
    write_varint(buf, bytes.len() as u64);
    buf.put_slice(bytes);
}

/// Read a varint-length-prefixed byte string.
pub fn read_varbytes(buf: &mut impl Buf) -> Result<Vec<u8>, WireError> {
    let len = read_varint(buf)?;
    if len > MAX_VAR_LEN {
        return Err(WireError::LengthOutOfBounds {
            len,
            max: MAX_VAR_LEN,
        });
    }
    let len = len as usize;
    ensure(buf, len)?;
    let mut out = vec![0u8; len];
    buf.copy_to_slice(&mut out);
    Ok(out)
}

/// Write a little-endian u64.
pub fn write_u64_le(buf: &mut impl BufMut, value: u64) {
    buf.put_u64_le(value);
}

/// Read a little-endian u64.
pub fn read_u64_le(buf: &mut impl Buf) -> Result<u64, WireError> {
    ensure(buf, 8)?;
    Ok(buf.get_u64_le())
}

/// Write a little-endian i64.
pub fn write_i64_le(buf: &mut impl BufMut, value: i64) {
    buf.put_i64_le(value);
}

/// Read a little-endian i64.
pub fn read_i64_le(buf: &mut impl Buf) -> Result<i64, WireError> {
    ensure(buf, 8)?;
    Ok(buf.get_i64_le())
}

/// Write a single byte.
pub fn write_u8(buf: &mut impl BufMut, value: u8) {
    buf.put_u8(value);
}

/// Read a single byte.
pub fn read_u8(buf: &mut impl Buf) -> Result<u8, WireError> {
    ensure(buf, 1)?;
    Ok(buf.get_u8())
}

/// Write a fixed-length byte array.
pub fn write_array<const N: usize>(buf: &mut impl BufMut, bytes: &[u8; N]) {
    buf.put_slice(bytes);
}

/// Read a fixed-length byte array.
pub fn read_array<const N: usize>(buf: &mut impl Buf) -> Result<[u8; N], WireError> {
    ensure(buf, N)?;
    let mut out = [0u8; N];
    buf.copy_to_slice(&mut out);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    fn roundtrip_varint(value: u64) -> u64 {
        let mut buf = BytesMut::new();
        write_varint(&mut buf, value);
        read_varint(&mut buf.freeze()).unwrap()
    }

    #[test]
    fn test_varint_roundtrip_boundaries() {
        for v in [
            0u64,
            1,
            0xfc,
            0xfd,
            0xffff,
            0x1_0000,
            0xffff_ffff,
            0x1_0000_0000,
            u64::MAX,
        ] {
            assert_eq!(roundtrip_varint(v), v);
        }
    }

    #[test]
    fn test_varint_rejects_non_minimal() {
        // 0x05 encoded with the u16 marker
        let mut buf = BytesMut::new();
        buf.put_u8(0xfd);
        buf.put_u16_le(5);
        assert_eq!(read_varint(&mut buf.freeze()), Err(WireError::BadVarint));
    }

    #[test]
    fn test_varbytes_roundtrip() {
        let mut buf = BytesMut::new();
        write_varbytes(&mut buf, b"hello");
        let read = read_varbytes(&mut buf.freeze()).unwrap();
        assert_eq!(read, b"hello");
    }

    #[test]
    fn test_varbytes_rejects_oversized_length() {
        let mut buf = BytesMut::new();
        write_varint(&mut buf, MAX_VAR_LEN + 1);
        assert!(matches!(
            read_varbytes(&mut buf.freeze()),
            Err(WireError::LengthOutOfBounds { .. })
        ));
    }

    #[test]
    fn test_short_buffer_is_eof() {
        let mut buf = BytesMut::new();
        write_varint(&mut buf, 10);
        buf.put_slice(b"abc");
        assert!(matches!(
            read_varbytes(&mut buf.freeze()),
            Err(WireError::UnexpectedEof { .. })
        ));
    }

    #[test]
    fn test_array_roundtrip() {
        let mut buf = BytesMut::new();
        write_array(&mut buf, &[7u8; 32]);
        let arr: [u8; 32] = read_array(&mut buf.freeze()).unwrap();
        assert_eq!(arr, [7u8; 32]);
    }
}
