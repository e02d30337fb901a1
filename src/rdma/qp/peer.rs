use std::fmt;

use serde::{Deserialize, Serialize};

use super::Qp;
use crate::rdma::gid::Gid;

/// Where a queue pair lives on the fabric: the port identifiers and the QP
/// number a peer puts in its requests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QpEndpoint {
    pub gid: Gid,
    pub lid: u16,
    pub qpn: u32,
}

impl QpEndpoint {
    /// QP numbers carry 24 significant bits.
    pub const QPN_MASK: u32 = 0x00ff_ffff;

    pub(crate) fn of(qp: &Qp) -> Self {
        let ctx = qp.context();
        QpEndpoint {
            gid: ctx.gid(),
            lid: ctx.lid(),
            qpn: qp.qp_num(),
        }
    }

    /// Whether the QP number fits its 24-bit field.
    #[inline]
    pub fn qpn_fits(&self) -> bool {
        self.qpn & !Self::QPN_MASK == 0
    }
}

impl fmt::Display for QpEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lid {:#x} qpn {:#x} ({})", self.lid, self.qpn, self.gid)
    }
}
