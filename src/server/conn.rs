use std::io;

use super::device::DeviceContext;
use super::table::ConnHandle;
use super::ServerConfig;
use crate::cm::{CmError, CmId};
use crate::rdma::mr::{Buffer, MemoryKind, Mr, Permission, Slicing};
use crate::rdma::qp::{Qp, QpCaps};

/// Per-peer resources: the queue pair and a send and a receive region.
///
/// Dropping a connection detaches its QP from the identifier and
/// deregisters both regions.
pub struct Connection {
    handle: ConnHandle,
    id: CmId,
    qp: Qp,
    send_mr: Mr,
    recv_mr: Mr,
}

impl Connection {
    /// Create the QP on the shared CQ and register both regions.
    ///
    /// The send region is local-only; the receive region accepts local
    /// writes, as incoming messages land there.
    pub(crate) fn build(
        handle: ConnHandle,
        id: &CmId,
        dev: &DeviceContext,
        config: &ServerConfig,
    ) -> Result<Self, CmError> {
        let caps = QpCaps {
            max_send_wr: config.max_send_wr,
            max_recv_wr: config.max_recv_wr,
            max_send_sge: 1,
            max_recv_sge: 1,
        };
        let builder = Qp::builder()
            .send_cq(dev.cq())
            .recv_cq(dev.cq())
            .caps(caps)
            .sq_sig_all(false);
        let qp = id.create_qp(dev.pd(), builder)?;

        let send_mr = Mr::reg(
            dev.pd(),
            Buffer::alloc(config.buffer_size, MemoryKind::Host)?,
            Permission::EMPTY,
        )?;
        let recv_mr = Mr::reg(
            dev.pd(),
            Buffer::alloc(config.buffer_size, MemoryKind::Host)?,
            Permission::LOCAL_WRITE,
        )?;

        Ok(Self {
            handle,
            id: id.clone(),
            qp,
            send_mr,
            recv_mr,
        })
    }

    pub fn handle(&self) -> ConnHandle {
        self.handle
    }

    pub fn id(&self) -> &CmId {
        &self.id
    }

    pub fn qp(&self) -> &Qp {
        &self.qp
    }

    /// Post one receive covering the whole receive region.
    pub fn post_receive(&self) -> io::Result<()> {
        self.qp
            .recv(&[self.recv_mr.as_slice()], self.handle.wr_id())
    }

    /// Write `message` into the send region, NUL-terminated and truncated to
    /// fit, and post a signaled send of the whole region.
    pub fn post_send_message(&self, message: &str) -> io::Result<()> {
        self.send_mr.write(|buf| fill_message(buf, message));
        self.qp
            .send(&[self.send_mr.as_slice()], self.handle.wr_id(), true)
    }

    /// The text in the receive region, up to the first NUL.
    pub fn received_message(&self) -> String {
        self.recv_mr.read(message_text)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        log::debug!("releasing {:?} of {:?}", self.handle, self.id);
        self.id.destroy_qp();
    }
}

/// Fill `buf` with `message` the way `snprintf` would.
pub(crate) fn fill_message(buf: &mut [u8], message: &str) {
    buf.fill(0);
    let n = message.len().min(buf.len().saturating_sub(1));
    buf[..n].copy_from_slice(&message.as_bytes()[..n]);
}

pub(crate) fn message_text(buf: &[u8]) -> String {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}
