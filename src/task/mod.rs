//! Transfer orchestration over the control plane.
//!
//! The [`Initiator`] registers a buffer and sends one [`ControlPackage`]
//! per iteration describing it. The [`Responder`] decodes each package,
//! performs the requested one-sided read or write between its own buffer
//! and the described one, waits for the completion, and acknowledges.
//!
//! [`ControlPackage`]: crate::ctrl::ControlPackage

mod device;
mod initiator;
mod report;
mod responder;
mod sgl;

use std::io;

use thiserror::Error;

pub use self::device::*;
pub use self::initiator::*;
pub use self::report::*;
pub use self::responder::*;
pub use self::sgl::*;
use crate::ctrl::ProtoError;
use crate::rdma::cq::{CqCreationError, WcStatus};
use crate::rdma::qp::QpCreationError;

/// Transfer error type.
#[derive(Debug, Error)]
pub enum TaskError {
    /// Opening, registering on, or resetting the device failed.
    #[error("device error")]
    Device(#[source] io::Error),

    #[error("CQ creation failed")]
    CqCreation(#[from] CqCreationError),

    #[error("QP creation failed")]
    QpCreation(#[from] QpCreationError),

    #[error("failed to submit task {wr_id}")]
    Submit {
        wr_id: u64,
        #[source]
        source: io::Error,
    },

    /// A task completed with a non-success status.
    #[error("iteration {iteration}: work request {wr_id} failed: {status} ({})", .status.code())]
    Completion {
        iteration: u64,
        wr_id: u64,
        status: WcStatus,
    },

    #[error("interrupted")]
    Interrupted,

    /// The control stream failed or carried a malformed request.
    #[error("iteration {iteration}: control plane failure")]
    Control {
        iteration: u64,
        #[source]
        source: ProtoError,
    },

    #[error("iteration {iteration}: failed to send the acknowledgment")]
    AckWrite {
        iteration: u64,
        #[source]
        source: io::Error,
    },

    /// A descriptor could not be built for a local buffer.
    #[error("cannot describe buffer")]
    Descriptor(#[from] ProtoError),

    #[error("{0} scatter/gather segments exceed the maximum of {max}", max = MAX_SGES)]
    TooManySegments(usize),

    #[error("{size} bytes cannot be split into {num_sges} 64-byte aligned segments")]
    SegmentTooSmall { size: usize, num_sges: usize },

    #[error("failed to accept an initiator")]
    Accept(#[source] io::Error),

    #[error("I/O error")]
    Io(#[from] io::Error),
}
