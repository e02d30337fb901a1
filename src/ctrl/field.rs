use std::io::{self, Read};

use super::ProtoError;

/// Type tag of a control-plane field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FieldType {
    /// Fixed-length ASCII descriptor of a registered remote buffer.
    RemoteBufferDescriptor = 0,

    /// Task attribute bitmask as 8 hex digits.
    TaskAttributes = 1,
}

impl TryFrom<u8> for FieldType {
    type Error = ProtoError;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        match tag {
            0 => Ok(Self::RemoteBufferDescriptor),
            1 => Ok(Self::TaskAttributes),
            other => Err(ProtoError::UnknownFieldType(other)),
        }
    }
}

/// Size of the `{type}{length}` field header.
pub const FIELD_HEADER_LEN: usize = 3;

/// Largest payload a field can carry.
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize;

/// Encoded size of a field with a payload of `payload_len` bytes.
#[inline]
pub fn encoded_len(payload_len: usize) -> usize {
    FIELD_HEADER_LEN + payload_len
}

/// Encode one field at the start of `dst` and return its encoded size.
///
/// The length prefix is little-endian.
pub fn encode_field(dst: &mut [u8], ty: FieldType, payload: &[u8]) -> Result<usize, ProtoError> {
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(ProtoError::PayloadTooLong(payload.len()));
    }
    let needed = encoded_len(payload.len());
    if dst.len() < needed {
        return Err(ProtoError::InsufficientCapacity {
            needed,
            capacity: dst.len(),
        });
    }

    dst[0] = ty as u8;
    dst[1..FIELD_HEADER_LEN].copy_from_slice(&(payload.len() as u16).to_le_bytes());
    dst[FIELD_HEADER_LEN..needed].copy_from_slice(payload);
    Ok(needed)
}

/// Decode the field at the start of `src`.
///
/// Return the field type, its payload, and the number of bytes consumed.
pub fn decode_field(src: &[u8]) -> Result<(FieldType, &[u8], usize), ProtoError> {
    if src.len() < FIELD_HEADER_LEN {
        return Err(ProtoError::ShortRead {
            expected: FIELD_HEADER_LEN,
            got: src.len(),
        });
    }
    let ty = FieldType::try_from(src[0])?;
    let len = u16::from_le_bytes([src[1], src[2]]) as usize;

    let rest = &src[FIELD_HEADER_LEN..];
    if rest.len() < len {
        return Err(ProtoError::ShortRead {
            expected: len,
            got: rest.len(),
        });
    }
    Ok((ty, &rest[..len], encoded_len(len)))
}

/// Read one field from a stream into a receive buffer of `max_len` bytes.
///
/// A declared length beyond `max_len` is rejected before any payload byte
/// is read.
pub fn read_field<R: Read>(r: &mut R, max_len: usize) -> Result<(FieldType, Vec<u8>), ProtoError> {
    let mut header = [0u8; FIELD_HEADER_LEN];
    read_full(r, &mut header)?;
    let ty = FieldType::try_from(header[0])?;
    let len = u16::from_le_bytes([header[1], header[2]]) as usize;
    if len > max_len {
        return Err(ProtoError::FieldTooLong { ty, len, max: max_len });
    }

    let mut payload = vec![0u8; len];
    read_full(r, &mut payload)?;
    Ok((ty, payload))
}

/// Fill `buf` completely from `r`.
///
/// End of stream before the buffer is full is a [`ProtoError::ShortRead`]
/// carrying how many bytes did arrive.
pub fn read_full<R: Read>(r: &mut R, buf: &mut [u8]) -> Result<(), ProtoError> {
    let mut got = 0;
    while got < buf.len() {
        match r.read(&mut buf[got..]) {
            Ok(0) => {
                return Err(ProtoError::ShortRead {
                    expected: buf.len(),
                    got,
                })
            }
            Ok(n) => got += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_encode_layout() {
        let mut buf = [0u8; 8];
        let n = encode_field(&mut buf, FieldType::TaskAttributes, b"abcd").unwrap();
        assert_eq!(n, 7);
        assert_eq!(&buf[..n], &[1, 4, 0, b'a', b'b', b'c', b'd']);
    }

    #[test]
    fn test_encode_capacity() {
        let mut buf = [0u8; 6];
        let err = encode_field(&mut buf, FieldType::TaskAttributes, b"abcd").unwrap_err();
        assert!(matches!(
            err,
            ProtoError::InsufficientCapacity { needed: 7, capacity: 6 }
        ));

        let big = vec![0u8; MAX_PAYLOAD_LEN + 1];
        let mut buf = vec![0u8; encoded_len(big.len())];
        let err = encode_field(&mut buf, FieldType::TaskAttributes, &big).unwrap_err();
        assert!(matches!(err, ProtoError::PayloadTooLong(_)));
    }

    #[test]
    fn test_decode_errors() {
        assert!(matches!(
            decode_field(&[0, 1]),
            Err(ProtoError::ShortRead { expected: 3, got: 2 })
        ));
        assert!(matches!(
            decode_field(&[7, 0, 0]),
            Err(ProtoError::UnknownFieldType(7))
        ));
        assert!(matches!(
            decode_field(&[0, 10, 0, 1, 2]),
            Err(ProtoError::ShortRead { expected: 10, got: 2 })
        ));
    }

    #[test]
    fn test_read_field_stream() {
        let mut wire = Vec::new();
        let mut buf = [0u8; 16];
        let n = encode_field(&mut buf, FieldType::RemoteBufferDescriptor, b"xyz").unwrap();
        wire.extend_from_slice(&buf[..n]);
        wire.extend_from_slice(&[1, 200, 0]);

        let mut r = Cursor::new(wire);
        let (ty, payload) = read_field(&mut r, 16).unwrap();
        assert_eq!(ty, FieldType::RemoteBufferDescriptor);
        assert_eq!(payload, b"xyz");

        let err = read_field(&mut r, 16).unwrap_err();
        assert!(matches!(
            err,
            ProtoError::FieldTooLong { ty: FieldType::TaskAttributes, len: 200, max: 16 }
        ));
    }

    #[test]
    fn test_read_full_short() {
        let mut r = Cursor::new(vec![1u8, 2, 3]);
        let mut buf = [0u8; 5];
        let err = read_full(&mut r, &mut buf).unwrap_err();
        assert!(matches!(err, ProtoError::ShortRead { expected: 5, got: 3 }));
    }
}
