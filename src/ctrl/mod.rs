//! Control plane: the wire codec of task requests and the plain-socket
//! bootstrap they travel over.
//!
//! A request is a sequence of fields, each `{type: u8}{len: u16 LE}{payload}`.
//! The initiator sends a [`ControlPackage`] per iteration and waits for
//! [`ACK_MSG`].

mod connecter;
mod desc;
mod field;
mod flags;
mod package;

use std::io;

use thiserror::Error;

pub use self::connecter::*;
pub use self::desc::*;
pub use self::field::*;
pub use self::flags::*;
pub use self::package::*;

/// Control-plane protocol error type.
#[derive(Debug, Error)]
pub enum ProtoError {
    /// The destination buffer cannot hold the encoded field.
    #[error("destination too small: need {needed} bytes, have {capacity}")]
    InsufficientCapacity { needed: usize, capacity: usize },

    #[error("payload of {0} bytes exceeds the field length limit")]
    PayloadTooLong(usize),

    #[error("unknown field type {0}")]
    UnknownFieldType(u8),

    #[error("expected a {expected:?} field, got {got:?}")]
    UnexpectedField { expected: FieldType, got: FieldType },

    /// A declared field length exceeds the receive buffer for that field.
    #[error("{ty:?} field of {len} bytes exceeds the {max}-byte receive buffer")]
    FieldTooLong {
        ty: FieldType,
        len: usize,
        max: usize,
    },

    /// The stream ended, or a field declared fewer bytes than required.
    #[error("short read: expected {expected} bytes, got {got}")]
    ShortRead { expected: usize, got: usize },

    #[error("malformed buffer descriptor: {0}")]
    MalformedDescriptor(String),

    #[error("malformed task flags {0:?}")]
    MalformedFlags(String),

    #[error("unexpected acknowledgment {0:?}")]
    BadAck(String),

    #[error("I/O error on the control stream")]
    Io(#[from] io::Error),
}
