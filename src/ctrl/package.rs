use std::io::{Read, Write};

use super::desc::{RemoteBufferDescriptor, DESC_WIRE_LEN};
use super::field::*;
use super::flags::{TaskFlags, FLAGS_RECV_LEN, FLAGS_WIRE_LEN};
use super::ProtoError;

/// Acknowledgment token the responder sends after each completed task,
/// NUL included.
pub const ACK_MSG: &[u8; 20] = b"rdma_task completed\0";

/// One task request: a descriptor field followed by a task-attributes
/// field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlPackage {
    pub desc: RemoteBufferDescriptor,
    pub flags: TaskFlags,
}

impl ControlPackage {
    pub fn new(desc: RemoteBufferDescriptor, flags: TaskFlags) -> Self {
        Self { desc, flags }
    }

    /// Sum of the encoded sizes of both fields.
    pub const fn encoded_len() -> usize {
        FIELD_HEADER_LEN + DESC_WIRE_LEN + FIELD_HEADER_LEN + FLAGS_WIRE_LEN
    }

    /// Encode both fields into `dst` and return the number of bytes used.
    pub fn encode_into(&self, dst: &mut [u8]) -> Result<usize, ProtoError> {
        let n = encode_field(
            dst,
            FieldType::RemoteBufferDescriptor,
            &self.desc.to_wire(),
        )?;
        let m = encode_field(&mut dst[n..], FieldType::TaskAttributes, &self.flags.to_wire())?;
        Ok(n + m)
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtoError> {
        let mut buf = vec![0u8; Self::encoded_len()];
        let n = self.encode_into(&mut buf)?;
        buf.truncate(n);
        Ok(buf)
    }

    /// Decode a package held entirely in memory.
    pub fn decode(src: &[u8]) -> Result<Self, ProtoError> {
        let (ty, payload, n) = decode_field(src)?;
        let desc = Self::parse_desc(ty, payload)?;
        let (ty, payload, _) = decode_field(&src[n..])?;
        let flags = Self::parse_flags(ty, payload)?;
        Ok(Self::new(desc, flags))
    }

    /// Read one package from a stream, descriptor first.
    pub fn read_from<R: Read>(r: &mut R) -> Result<Self, ProtoError> {
        let (ty, payload) = read_field(r, DESC_WIRE_LEN)?;
        let desc = Self::parse_desc(ty, &payload)?;
        let (ty, payload) = read_field(r, FLAGS_RECV_LEN)?;
        let flags = Self::parse_flags(ty, &payload)?;
        Ok(Self::new(desc, flags))
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<(), ProtoError> {
        w.write_all(&self.encode()?)?;
        Ok(())
    }

    fn parse_desc(ty: FieldType, payload: &[u8]) -> Result<RemoteBufferDescriptor, ProtoError> {
        if ty != FieldType::RemoteBufferDescriptor {
            return Err(ProtoError::UnexpectedField {
                expected: FieldType::RemoteBufferDescriptor,
                got: ty,
            });
        }
        if payload.len() != DESC_WIRE_LEN {
            return Err(ProtoError::ShortRead {
                expected: DESC_WIRE_LEN,
                got: payload.len(),
            });
        }
        RemoteBufferDescriptor::from_wire(payload)
    }

    fn parse_flags(ty: FieldType, payload: &[u8]) -> Result<TaskFlags, ProtoError> {
        if ty != FieldType::TaskAttributes {
            return Err(ProtoError::UnexpectedField {
                expected: FieldType::TaskAttributes,
                got: ty,
            });
        }
        if payload.len() > FLAGS_RECV_LEN {
            return Err(ProtoError::FieldTooLong {
                ty,
                len: payload.len(),
                max: FLAGS_RECV_LEN,
            });
        }
        TaskFlags::from_wire(payload)
    }
}

pub fn write_ack<W: Write>(w: &mut W) -> Result<(), ProtoError> {
    w.write_all(ACK_MSG)?;
    w.flush()?;
    Ok(())
}

/// Read one acknowledgment token and check it.
pub fn read_ack<R: Read>(r: &mut R) -> Result<(), ProtoError> {
    let mut buf = [0u8; ACK_MSG.len()];
    read_full(r, &mut buf)?;
    if &buf != ACK_MSG {
        return Err(ProtoError::BadAck(String::from_utf8_lossy(&buf).into_owned()));
    }
    Ok(())
}
