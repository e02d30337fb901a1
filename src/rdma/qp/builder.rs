use crate::rdma::cq::Cq;
use crate::rdma::pd::Pd;

use super::{Qp, QpCreationError, QpType};

/// Queue depths and scatter/gather limits of a queue pair.
///
/// Each value is checked against the device attributes when the QP is built.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QpCaps {
    /// Send-queue slots: sends, RDMA reads and RDMA writes alike.
    pub max_send_wr: u32,

    /// Receive requests that may sit posted and unconsumed.
    pub max_recv_wr: u32,

    pub max_send_sge: u32,
    pub max_recv_sge: u32,
}

impl QpCaps {
    /// A connection QP: `depth` slots on both queues, one SGE per request.
    pub fn for_connection(depth: u32) -> Self {
        QpCaps {
            max_send_wr: depth,
            max_recv_wr: depth,
            max_send_sge: 1,
            max_recv_sge: 1,
        }
    }

    /// A DC initiator carrying segment lists of up to `max_send_sge`
    /// entries. DC initiators have no receive queue.
    pub fn for_dc(max_send_sge: u32) -> Self {
        QpCaps {
            max_send_wr: 128,
            max_recv_wr: 0,
            max_send_sge,
            max_recv_sge: 0,
        }
    }
}

/// Collects the attributes of a queue pair before it is created.
///
/// Everything except [`QpCaps`] is mandatory; a QP built without caps
/// cannot post anything.
#[derive(Clone, Default)]
pub struct QpBuilder<'a> {
    pub(super) send_cq: Option<&'a Cq>,
    pub(super) recv_cq: Option<&'a Cq>,
    pub(super) caps: QpCaps,
    pub(super) qp_type: Option<QpType>,
    pub(super) sq_sig_all: Option<bool>,
}

impl<'a> QpBuilder<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn send_cq(self, cq: &'a Cq) -> Self {
        Self {
            send_cq: Some(cq),
            ..self
        }
    }

    /// May be the same CQ as the send side.
    pub fn recv_cq(self, cq: &'a Cq) -> Self {
        Self {
            recv_cq: Some(cq),
            ..self
        }
    }

    pub fn caps(self, caps: QpCaps) -> Self {
        Self { caps, ..self }
    }

    pub fn qp_type(self, qp_type: QpType) -> Self {
        Self {
            qp_type: Some(qp_type),
            ..self
        }
    }

    /// With `true`, every send-queue request produces a completion whether
    /// or not it was posted as signaled.
    pub fn sq_sig_all(self, sq_sig_all: bool) -> Self {
        Self {
            sq_sig_all: Some(sq_sig_all),
            ..self
        }
    }

    /// Create the QP on `pd`, in RESET.
    pub fn build(self, pd: &Pd) -> Result<Qp, QpCreationError> {
        Qp::new(pd, self)
    }

    /// Resolve the builder into owned attributes, naming the first missing
    /// one in [`QpCreationError::MissingAttr`].
    pub(super) fn into_attr(self) -> Result<QpInitAttr, QpCreationError> {
        let missing = QpCreationError::MissingAttr;
        let send_cq = self.send_cq.ok_or(missing("send_cq"))?;
        let recv_cq = self.recv_cq.ok_or(missing("recv_cq"))?;
        let qp_type = self.qp_type.ok_or(missing("qp_type"))?;
        let sq_sig_all = self.sq_sig_all.ok_or(missing("sq_sig_all"))?;
        Ok(QpInitAttr {
            send_cq: send_cq.clone(),
            recv_cq: recv_cq.clone(),
            caps: self.caps,
            qp_type,
            sq_sig_all,
        })
    }
}

pub(crate) struct QpInitAttr {
    pub send_cq: Cq,
    pub recv_cq: Cq,
    pub caps: QpCaps,
    pub qp_type: QpType,
    pub sq_sig_all: bool,
}
