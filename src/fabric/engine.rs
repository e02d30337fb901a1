//! Data movement between registered regions.
//!
//! Work requests execute synchronously at post time. Completions are pushed
//! onto the owning CQs exactly as a NIC would report them, so callers still
//! observe outcomes only through polling.

use super::{Fabric, Sge};
use crate::rdma::cq::{Wc, WcOpcode, WcStatus};
use crate::rdma::mr::{MrRemote, Permission};
use crate::rdma::qp::{QpCore, QpEndpoint, QpState};

/// Operation classes tracked by the fabric counters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum OpKind {
    Send,
    Read,
    Write,
}

/// A send-queue work request after local validation.
pub(crate) struct SendWr {
    pub sgl: Vec<Sge>,
    pub wr_id: u64,
    pub signal: bool,
}

impl SendWr {
    fn total_len(&self) -> usize {
        self.sgl.iter().map(|sge| sge.len).sum()
    }
}

/// Copy the bytes described by a local SGL into one contiguous message.
fn gather_local(qp: &QpCore, sgl: &[Sge]) -> Result<Vec<u8>, WcStatus> {
    let mut payload = Vec::with_capacity(sgl.iter().map(|sge| sge.len).sum());
    for sge in sgl {
        if sge.mem.pd != qp.pd.id() {
            return Err(WcStatus::LocProtErr);
        }
        let bytes = sge.mem.gather(sge.offset, sge.len).ok_or(WcStatus::LocProtErr)?;
        payload.extend_from_slice(&bytes);
    }
    Ok(payload)
}

/// Spread a message over a local SGL that the NIC writes into.
fn scatter_local(qp: &QpCore, sgl: &[Sge], mut payload: &[u8]) -> Result<(), WcStatus> {
    let capacity: usize = sgl.iter().map(|sge| sge.len).sum();
    if capacity < payload.len() {
        return Err(WcStatus::LocLenErr);
    }
    for sge in sgl {
        if sge.mem.pd != qp.pd.id() || !sge.mem.perm.contains(Permission::LOCAL_WRITE) {
            return Err(WcStatus::LocProtErr);
        }
        if payload.is_empty() {
            break;
        }
        let n = sge.len.min(payload.len());
        if !sge.mem.scatter(sge.offset, &payload[..n]) {
            return Err(WcStatus::LocProtErr);
        }
        payload = &payload[n..];
    }
    Ok(())
}

/// Report a failed send-queue request. Errors are always reported, whether
/// the request was signaled or not, and move the QP into the error state.
fn fail_send(fabric: &Fabric, qp: &QpCore, wr_id: u64, opcode: WcOpcode, status: WcStatus) {
    log::debug!(
        "qp {:#x}: wr {} ({:?}) failed: {}",
        qp.qpn,
        wr_id,
        opcode,
        status
    );
    fabric.count_failure();
    qp.set_state(QpState::Error);
    qp.attr
        .send_cq
        .push(Wc::new(wr_id, status, opcode, 0, qp.qpn));
}

fn complete_send(qp: &QpCore, wr: &SendWr, opcode: WcOpcode, bytes: usize) {
    if wr.signal || qp.attr.sq_sig_all {
        qp.attr.send_cq.push(Wc::new(
            wr.wr_id,
            WcStatus::Success,
            opcode,
            bytes as u32,
            qp.qpn,
        ));
    }
}

/// Deliver a two-sided send to the connected peer.
pub(crate) fn execute_send(fabric: &Fabric, qp: &QpCore, wr: SendWr) {
    let opcode = WcOpcode::Send;
    let payload = match gather_local(qp, &wr.sgl) {
        Ok(payload) => payload,
        Err(status) => return fail_send(fabric, qp, wr.wr_id, opcode, status),
    };

    let peer = qp
        .peer()
        .and_then(|ep| fabric.qp(ep.qpn))
        .filter(|peer| matches!(peer.state(), QpState::Rtr | QpState::Rts));
    let Some(peer) = peer else {
        return fail_send(fabric, qp, wr.wr_id, opcode, WcStatus::RetryExcErr);
    };

    // No receive posted at the peer: retries are exhausted at once.
    let Some(recv) = peer.recvs.lock().pop_front() else {
        return fail_send(fabric, qp, wr.wr_id, opcode, WcStatus::RnrRetryExcErr);
    };

    match scatter_local(&peer, &recv.sgl, &payload) {
        Ok(()) => {
            peer.attr.recv_cq.push(Wc::new(
                recv.wr_id,
                WcStatus::Success,
                WcOpcode::Recv,
                payload.len() as u32,
                peer.qpn,
            ));
            fabric.count_op(OpKind::Send, payload.len());
            complete_send(qp, &wr, opcode, payload.len());
        }
        Err(status) => {
            peer.set_state(QpState::Error);
            peer.attr
                .recv_cq
                .push(Wc::new(recv.wr_id, status, WcOpcode::Recv, 0, peer.qpn));
            let remote_status = if status == WcStatus::LocLenErr {
                WcStatus::RemInvReqErr
            } else {
                WcStatus::RemOpErr
            };
            fail_send(fabric, qp, wr.wr_id, opcode, remote_status);
        }
    }
}

/// Execute an RDMA read or write against the region behind `remote`, which
/// must live on the NIC and in the protection domain of `target`.
pub(crate) fn execute_one_sided(
    fabric: &Fabric,
    qp: &QpCore,
    op: OpKind,
    wr: SendWr,
    remote: &MrRemote,
    target: &QpEndpoint,
) {
    let opcode = match op {
        OpKind::Read => WcOpcode::RdmaRead,
        _ => WcOpcode::RdmaWrite,
    };

    let target_qp = fabric
        .nic_by_lid(target.lid)
        .zip(fabric.qp(target.qpn))
        .filter(|(nic, tqp)| {
            tqp.nic_index() == nic.index() && matches!(tqp.state(), QpState::Rtr | QpState::Rts)
        })
        .map(|(_, tqp)| tqp);
    let Some(target_qp) = target_qp else {
        return fail_send(fabric, qp, wr.wr_id, opcode, WcStatus::RetryExcErr);
    };

    let needed = match op {
        OpKind::Read => Permission::REMOTE_READ,
        _ => Permission::REMOTE_WRITE,
    };
    let total = wr.total_len();
    let region = fabric
        .mem(remote.rkey)
        .filter(|mem| mem.nic == target_qp.nic_index() && mem.pd == target_qp.pd.id())
        .filter(|mem| mem.perm.contains(needed))
        .and_then(|mem| mem.offset_of(remote.addr, total).map(|off| (mem, off)));
    let Some((region, offset)) = region else {
        return fail_send(fabric, qp, wr.wr_id, opcode, WcStatus::RemAccessErr);
    };

    let moved = match op {
        OpKind::Read => region
            .gather(offset, total)
            .ok_or(WcStatus::RemAccessErr)
            .and_then(|data| scatter_local(qp, &wr.sgl, &data)),
        _ => gather_local(qp, &wr.sgl).and_then(|data| {
            if region.scatter(offset, &data) {
                Ok(())
            } else {
                Err(WcStatus::RemAccessErr)
            }
        }),
    };

    match moved {
        Ok(()) => {
            fabric.count_op(op, total);
            complete_send(qp, &wr, opcode, total);
        }
        Err(status) => fail_send(fabric, qp, wr.wr_id, opcode, status),
    }
}
