//! Connection manager: event channels, identifiers, and events.

mod channel;
mod event;
mod id;

use std::io;

use thiserror::Error;

pub use self::channel::*;
pub use self::event::*;
pub(crate) use self::id::CmIdInner;
pub use self::id::CmId;
use crate::poller::PollerError;
use crate::rdma::cq::{CqCreationError, WcStatus};
use crate::rdma::qp::QpCreationError;

/// Connection manager error type.
#[derive(Debug, Error)]
pub enum CmError {
    /// The connection manager or the device rejected a request.
    #[error("I/O error from the connection manager")]
    Io(#[from] io::Error),

    /// An event the state machine has no transition for.
    #[error("unsupported event {0}")]
    UnsupportedEvent(CmEventKind),

    /// A connection request arrived on a device other than the one the
    /// process already built its resources on.
    #[error("cannot handle events in more than one context (have {have}, got {got})")]
    ForeignDevice { have: String, got: String },

    /// A connection request carried no device.
    #[error("connection request without a device")]
    NoDevice,

    #[error("QP creation failed")]
    QpCreation(#[from] QpCreationError),

    #[error("CQ creation failed")]
    CqCreation(#[from] CqCreationError),

    /// An event names an identifier no live connection belongs to.
    #[error("no connection behind identifier {0}")]
    UnknownConnection(u32),

    /// Connecting failed with the given event.
    #[error("connection failed: {kind} (status {status})")]
    ConnectFailed { kind: CmEventKind, status: i32 },

    /// A work request on a connection failed.
    #[error("work request {wr_id} failed: {status}")]
    Completion { wr_id: u64, status: WcStatus },

    #[error("event channel closed")]
    ChannelClosed,

    /// The completion poller stopped on an error; no completion is
    /// handled anymore.
    #[error("completion poller stopped")]
    Poller(#[from] PollerError),
}
