//! RDMA verbs over the soft provider.

pub mod context;
pub mod cq;
pub mod gid;
pub mod mr;
pub mod pd;
pub mod qp;
