use std::fmt;

use serde::{Deserialize, Serialize};

use super::ProtoError;

/// Length of the flags text: 8 hex digits.
pub const FLAGS_STR_LEN: usize = 8;

/// Length of the flags payload as sent: the text and a NUL.
pub const FLAGS_WIRE_LEN: usize = FLAGS_STR_LEN + 1;

/// Size of the receive buffer for the flags field.
pub const FLAGS_RECV_LEN: usize = 16;

/// The one-sided operation a task asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskOp {
    /// Write the responder's buffer into the initiator's.
    Write,
    /// Read the initiator's buffer into the responder's.
    Read,
}

/// Task attribute bitmask. Bit 0 selects [`TaskOp::Read`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskFlags(u32);

impl TaskFlags {
    pub const READ: u32 = 1 << 0;

    #[inline]
    pub fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    #[inline]
    pub fn bits(self) -> u32 {
        self.0
    }

    /// Flags asking for `op`, with no other bit set.
    pub fn for_op(op: TaskOp) -> Self {
        match op {
            TaskOp::Write => Self(0),
            TaskOp::Read => Self(Self::READ),
        }
    }

    pub fn op(self) -> TaskOp {
        if self.0 & Self::READ != 0 {
            TaskOp::Read
        } else {
            TaskOp::Write
        }
    }

    pub fn to_wire(self) -> [u8; FLAGS_WIRE_LEN] {
        let mut wire = [0u8; FLAGS_WIRE_LEN];
        wire[..FLAGS_STR_LEN].copy_from_slice(self.to_string().as_bytes());
        wire
    }

    /// Parse up to 8 hex digits, stopping at the first NUL.
    pub fn from_wire(payload: &[u8]) -> Result<Self, ProtoError> {
        let end = payload.iter().position(|&b| b == 0).unwrap_or(payload.len());
        let digits = &payload[..end];
        if digits.is_empty()
            || digits.len() > FLAGS_STR_LEN
            || !digits.iter().all(u8::is_ascii_hexdigit)
        {
            return Err(ProtoError::MalformedFlags(
                String::from_utf8_lossy(digits).into_owned(),
            ));
        }

        // Only hex digits remain, so both steps succeed.
        let text = std::str::from_utf8(digits)
            .map_err(|_| ProtoError::MalformedFlags(String::new()))?;
        u32::from_str_radix(text, 16)
            .map(Self)
            .map_err(|_| ProtoError::MalformedFlags(text.to_owned()))
    }
}

impl fmt::Display for TaskFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

impl From<TaskOp> for TaskFlags {
    fn from(op: TaskOp) -> Self {
        Self::for_op(op)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_op_bit() {
        assert_eq!(TaskFlags::from_bits(0).op(), TaskOp::Write);
        assert_eq!(TaskFlags::from_bits(1).op(), TaskOp::Read);
        assert_eq!(TaskFlags::from_bits(0xfffe).op(), TaskOp::Write);
        assert_eq!(TaskFlags::from_bits(3).op(), TaskOp::Read);
    }

    #[test]
    fn test_wire() {
        let wire = TaskFlags::from_bits(0x1f).to_wire();
        assert_eq!(&wire, b"0000001f\0");
        assert_eq!(TaskFlags::from_wire(&wire).unwrap().bits(), 0x1f);
        assert_eq!(TaskFlags::from_wire(b"1").unwrap().op(), TaskOp::Read);

        for bad in [&b""[..], b"\0", b"123456789", b"xyz"] {
            assert!(matches!(
                TaskFlags::from_wire(bad),
                Err(ProtoError::MalformedFlags(_))
            ));
        }
    }
}
