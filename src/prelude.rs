//! The `rdmatask` prelude.
//!
//! The purpose of this module is to alleviate imports of common
//! functionalities.

pub use crate::cm::{CmError, CmEvent, CmEventKind, CmId, EventChannel};
pub use crate::ctrl::{ControlPackage, ProtoError, RemoteBufferDescriptor, TaskFlags, TaskOp};
pub use crate::fabric::Fabric;
pub use crate::poller::{CompletionPoller, CompletionSink};
pub use crate::rdma::context::Context;
pub use crate::rdma::cq::{CompChannel, Cq, Wc, WcOpcode, WcStatus};
pub use crate::rdma::mr::{Buffer, MemoryKind, Mr, MrRemote, MrSlice, Permission, Slicing};
pub use crate::rdma::pd::Pd;
pub use crate::rdma::qp::{Qp, QpCaps, QpEndpoint, QpState, QpType};
pub use crate::server::{CmClient, ConnectionServer, Notice, ServerConfig};
pub use crate::task::{Initiator, OneSidedDevice, RdmaDevice, Responder, TaskBuffer, TaskError};
