//! RDMA connection lifecycle, completion polling, and one-sided transfer
//! orchestration.
//!
//! `rdmatask` provides `Arc`-based RDMA resource types ([`Context`], [`Pd`],
//! [`Cq`], [`Mr`], and [`Qp`]); clones are references to the same underlying
//! resource, so sharing them across threads needs nothing beyond `clone()`.
//! The resources live on a [`fabric::Fabric`], an in-process provider that
//! executes work requests with the checks a NIC applies and reports their
//! outcomes as work completions.
//!
//! On top of the verbs sit three subsystems:
//!
//! - [`server`]: a connection manager driven server that builds per-peer
//!   resources on connect requests and tears them down on disconnect, with
//!   a [`poller::CompletionPoller`] consuming completions in the background;
//! - [`ctrl`]: the control-plane codec exchanging buffer descriptors and
//!   task flags over a byte stream;
//! - [`task`]: the initiator/responder loop performing one RDMA read or
//!   write per control package.
//!
//! With the `verbs` feature, [`task`] also runs over real hardware through
//! `verbs::VerbsDevice`, an mlx5 DC backend on libibverbs.
//!
//! # Example
//!
//! ```rust
//! use rdmatask::fabric::Fabric;
//! use rdmatask::*;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let fabric = Fabric::new();
//!     fabric.add_nic("soft0", "10.0.0.1".parse()?)?;
//!
//!     let context = Context::open(&fabric, Some("soft0"))?;
//!     let pd = Pd::new(&context)?;
//!     let mr = Mr::reg(&pd, Buffer::alloc(4096, MemoryKind::Host)?, Permission::default())?;
//!     assert_eq!(mr.len(), 4096);
//!     Ok(())
//! }
//! ```

mod rdma;
pub use rdma::gid::Gid;
pub use rdma::{context::Context, cq::*, mr::*, pd::Pd, qp::*};

pub mod cm;
pub mod config;
pub mod ctrl;
pub mod fabric;
pub mod poller;
pub mod prelude;
pub mod server;
pub mod task;
pub mod utils;
#[cfg(feature = "verbs")]
pub mod verbs;
