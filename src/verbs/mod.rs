//! libibverbs backend of the transfer loop.
//!
//! [`VerbsDevice`] drives mlx5 dynamically connected (DC) queue pairs: a DC
//! target that peers address with the QP number of a buffer descriptor, and
//! a DC initiator that reaches any described buffer without connecting to
//! it first. It implements [`OneSidedDevice`](crate::task::OneSidedDevice),
//! so [`Responder`](crate::task::Responder) and
//! [`Initiator`](crate::task::Initiator) run on it unchanged and the two
//! sides can live on different hosts.

mod device;
mod sys;

pub use self::device::*;
