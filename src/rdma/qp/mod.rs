//! Queue pair and related types.

mod builder;
mod peer;
mod ty;

use std::collections::VecDeque;
use std::fmt;
use std::io::{self, Error as IoError, ErrorKind as IoErrorKind};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

pub use self::builder::*;
pub use self::peer::*;
pub use self::ty::*;
use crate::fabric::{self, Fabric, OpKind, SendWr, Sge};
use crate::rdma::context::Context;
use crate::rdma::cq::{Cq, Wc, WcOpcode, WcStatus};
use crate::rdma::mr::{MrRemote, MrSlice};
use crate::rdma::pd::Pd;

/// Queue pair creation error type.
#[derive(Debug, Error)]
pub enum QpCreationError {
    /// The device rejected the request.
    #[error("I/O error from the device")]
    IoError(#[from] io::Error),

    /// Specified capabilities are not supported by the device.
    /// The three fields are for the capability name, the maximum supported
    /// value, and the required value.
    #[error("capability not enough: {0} supports up to {1}, {2} required")]
    CapabilityNotEnough(String, u32, u32),

    /// A mandatory builder attribute was not set.
    #[error("mandatory QP attribute not set: {0}")]
    MissingAttr(&'static str),
}

/// A posted receive request waiting for an incoming message.
pub(crate) struct RecvWr {
    pub wr_id: u64,
    pub sgl: Vec<Sge>,
}

/// Ownership holder of queue pair.
pub(crate) struct QpCore {
    pub qpn: u32,
    pub pd: Pd,
    pub attr: QpInitAttr,
    pub recvs: Mutex<VecDeque<RecvWr>>,
    state: Mutex<QpState>,
    peer: Mutex<Option<QpEndpoint>>,
}

impl QpCore {
    pub fn state(&self) -> QpState {
        *self.state.lock()
    }

    /// Move the QP to `state`.
    ///
    /// Entering RESET discards every posted receive; entering ERR flushes
    /// them to the receive CQ.
    pub fn set_state(&self, state: QpState) {
        {
            let mut cur = self.state.lock();
            if *cur == state {
                return;
            }
            log::trace!("qp {:#x}: {} -> {}", self.qpn, *cur, state);
            *cur = state;
        }

        match state {
            QpState::Reset => self.recvs.lock().clear(),
            QpState::Error => {
                let flushed = std::mem::take(&mut *self.recvs.lock());
                for wr in flushed {
                    self.attr.recv_cq.push(Wc::new(
                        wr.wr_id,
                        WcStatus::WrFlushErr,
                        WcOpcode::Recv,
                        0,
                        self.qpn,
                    ));
                }
            }
            _ => {}
        }
    }

    pub fn peer(&self) -> Option<QpEndpoint> {
        *self.peer.lock()
    }

    pub fn nic_index(&self) -> usize {
        self.pd.context().nic_index()
    }

    fn fabric(&self) -> &Fabric {
        self.pd.context().fabric()
    }
}

impl Drop for QpCore {
    fn drop(&mut self) {
        self.fabric().unregister_qp(self.qpn);
    }
}

/// Queue pair.
///
/// Clones share the same underlying queue pair, which is destroyed when the
/// last handle is dropped.
#[derive(Clone)]
pub struct Qp {
    inner: Arc<QpCore>,
}

impl fmt::Debug for Qp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("Qp<{:#x}>", self.inner.qpn))
    }
}

impl Qp {
    /// Check whether the given capabilities are supported by the device.
    fn check_caps(ctx: &Context, caps: &QpCaps) -> Result<(), QpCreationError> {
        let attr = ctx.attr();
        let checks = [
            ("max_send_wr", attr.max_qp_wr, caps.max_send_wr),
            ("max_recv_wr", attr.max_qp_wr, caps.max_recv_wr),
            ("max_send_sge", attr.max_sge, caps.max_send_sge),
            ("max_recv_sge", attr.max_sge, caps.max_recv_sge),
        ];
        for (name, max, required) in checks {
            if required > max {
                return Err(QpCreationError::CapabilityNotEnough(
                    name.to_string(),
                    max,
                    required,
                ));
            }
        }
        Ok(())
    }

    /// Create a new queue pair with the given builder.
    pub(crate) fn new(pd: &Pd, builder: QpBuilder) -> Result<Self, QpCreationError> {
        let init_attr = builder.into_attr()?;
        Self::check_caps(pd.context(), &init_attr.caps)?;
        if init_attr.qp_type == QpType::Dc && init_attr.caps.max_recv_wr > 0 {
            return Err(QpCreationError::CapabilityNotEnough(
                "max_recv_wr".to_string(),
                0,
                init_attr.caps.max_recv_wr,
            ));
        }
        for cq in [&init_attr.send_cq, &init_attr.recv_cq] {
            if !cq.context().same_device(pd.context()) {
                return Err(QpCreationError::IoError(IoError::new(
                    IoErrorKind::InvalidInput,
                    format!("{:?} belongs to another device", cq),
                )));
            }
        }

        let fabric = pd.context().fabric();
        let qpn = fabric.alloc_qpn();
        let inner = Arc::new(QpCore {
            qpn,
            pd: pd.clone(),
            attr: init_attr,
            recvs: Mutex::new(VecDeque::new()),
            state: Mutex::new(QpState::Reset),
            peer: Mutex::new(None),
        });
        fabric.register_qp(qpn, Arc::downgrade(&inner));
        log::debug!(
            "created {:?} qp {:#x} on {}",
            inner.attr.qp_type,
            qpn,
            pd.context().name()
        );
        Ok(Self { inner })
    }

    /// Create a new queue pair builder.
    #[inline]
    pub fn builder<'a>() -> QpBuilder<'a> {
        QpBuilder::new()
    }

    /// Get the protection domain of the queue pair.
    #[inline]
    pub fn pd(&self) -> &Pd {
        &self.inner.pd
    }

    /// Get the underlying [`Context`].
    #[inline]
    pub fn context(&self) -> &Context {
        self.inner.pd.context()
    }

    /// Get the type of the queue pair.
    #[inline]
    pub fn qp_type(&self) -> QpType {
        self.inner.attr.qp_type
    }

    /// Get the number of the queue pair.
    #[inline]
    pub fn qp_num(&self) -> u32 {
        self.inner.qpn
    }

    /// Get the current state of the queue pair.
    #[inline]
    pub fn state(&self) -> QpState {
        self.inner.state()
    }

    /// Get the capabilities of the queue pair.
    #[inline]
    pub fn caps(&self) -> &QpCaps {
        &self.inner.attr.caps
    }

    /// Get the remote peer this queue pair is connected to, if any.
    #[inline]
    pub fn peer(&self) -> Option<QpEndpoint> {
        self.inner.peer()
    }

    /// Get the endpoint information of this QP.
    #[inline]
    pub fn endpoint(&self) -> QpEndpoint {
        QpEndpoint::of(self)
    }

    /// Get the send completion queue of the queue pair.
    #[inline]
    pub fn scq(&self) -> &Cq {
        &self.inner.attr.send_cq
    }

    /// Get the receive completion queue of the queue pair.
    #[inline]
    pub fn rcq(&self) -> &Cq {
        &self.inner.attr.recv_cq
    }

    /// Modify a fresh QP to INIT, so that receives can be posted before the
    /// connection is up.
    pub(crate) fn init(&self) -> io::Result<()> {
        match self.state() {
            QpState::Reset => {
                self.inner.set_state(QpState::Init);
                Ok(())
            }
            QpState::Init => Ok(()),
            state => Err(IoError::new(
                IoErrorKind::InvalidInput,
                format!("cannot initialize QP in {}", state),
            )),
        }
    }

    /// Move the QP to ERR, flushing every posted receive.
    pub(crate) fn modify_to_error(&self) {
        self.inner.set_state(QpState::Error);
    }

    /// Bind the queue pair to a remote peer and bring it up to RTS.
    ///
    /// Only RC QPs in RESET or INIT state can be bound.
    pub fn bind_peer(&self, ep: QpEndpoint) -> io::Result<()> {
        if self.qp_type() != QpType::Rc {
            return Err(IoError::new(
                IoErrorKind::InvalidInput,
                "only RC QPs can be bound to a peer",
            ));
        }
        let state = self.state();
        if !matches!(state, QpState::Reset | QpState::Init) {
            return Err(IoError::new(
                IoErrorKind::InvalidInput,
                format!("cannot bind peer to QP in {}", state),
            ));
        }
        {
            let mut peer = self.inner.peer.lock();
            if peer.is_some() {
                return Err(IoError::new(
                    IoErrorKind::AlreadyExists,
                    "QP already bound to a remote peer",
                ));
            }
            *peer = Some(ep);
        }

        self.init()?;
        self.inner.set_state(QpState::Rtr);
        self.inner.set_state(QpState::Rts);
        Ok(())
    }

    /// Bring a DC initiator up to RTS.
    pub fn activate(&self) -> io::Result<()> {
        if self.qp_type() != QpType::Dc {
            return Err(IoError::new(
                IoErrorKind::InvalidInput,
                "only DC QPs can be activated without a peer",
            ));
        }
        if self.state() != QpState::Reset {
            return Err(IoError::new(
                IoErrorKind::InvalidInput,
                format!("cannot activate QP in {}", self.state()),
            ));
        }
        self.inner.set_state(QpState::Init);
        self.inner.set_state(QpState::Rts);
        Ok(())
    }

    /// Reset the QP.
    /// Modify the QP to RESET state and clear any remote peer binding.
    pub fn reset(&self) -> io::Result<()> {
        self.inner.set_state(QpState::Reset);
        self.inner.peer.lock().take();
        Ok(())
    }

    /// Reset the QP and bring it back to RTS with its previous binding.
    pub fn recover(&self) -> io::Result<()> {
        let peer = self.peer();
        self.reset()?;
        match (self.qp_type(), peer) {
            (QpType::Rc, Some(ep)) => self.bind_peer(ep),
            (QpType::Rc, None) => Ok(()),
            (QpType::Dc, _) => self.activate(),
        }
    }

    /// Post a receive request.
    ///
    /// **NOTE:** This method has no mutable borrows to its parameters, but can
    /// cause the content of the buffers to be modified!
    pub fn recv(&self, local: &[MrSlice], wr_id: u64) -> io::Result<()> {
        if local.len() > self.caps().max_recv_sge as usize {
            return Err(IoError::new(
                IoErrorKind::InvalidInput,
                format!("{} SGEs exceed max_recv_sge", local.len()),
            ));
        }
        match self.state() {
            QpState::Reset => {
                return Err(IoError::new(
                    IoErrorKind::InvalidInput,
                    "cannot post receive to QP in RESET",
                ))
            }
            QpState::Error => {
                self.rcq().push(Wc::new(
                    wr_id,
                    WcStatus::WrFlushErr,
                    WcOpcode::Recv,
                    0,
                    self.qp_num(),
                ));
                return Ok(());
            }
            _ => {}
        }

        let mut recvs = self.inner.recvs.lock();
        if recvs.len() >= self.caps().max_recv_wr as usize {
            return Err(IoError::new(
                IoErrorKind::OutOfMemory,
                "receive queue is full",
            ));
        }
        recvs.push_back(RecvWr {
            wr_id,
            sgl: local.iter().map(|s| s.to_sge()).collect(),
        });
        Ok(())
    }

    /// Post a send request to the connected peer.
    ///
    /// **NOTE:** this function is only equivalent to calling `ibv_post_send`.
    /// It is the caller's responsibility to ensure the completion of the send
    /// by some means, for example by polling the send CQ.
    pub fn send(&self, local: &[MrSlice], wr_id: u64, signal: bool) -> io::Result<()> {
        if !self.qp_type().supports_send() {
            return Err(IoError::new(
                IoErrorKind::InvalidInput,
                format!("{:?} QPs cannot send", self.qp_type()),
            ));
        }
        if !self.ready_to_send(local.len(), wr_id, WcOpcode::Send)? {
            return Ok(());
        }
        fabric::execute_send(
            self.inner.fabric(),
            &self.inner,
            SendWr {
                sgl: local.iter().map(|s| s.to_sge()).collect(),
                wr_id,
                signal,
            },
        );
        Ok(())
    }

    /// Post an RDMA read request.
    ///
    /// `target` names the queue pair whose device and protection domain own
    /// the remote region. RC QPs may pass `None` to target their peer.
    ///
    /// **NOTE:** this function is only equivalent to calling `ibv_post_send`.
    /// It is the caller's responsibility to ensure the completion of the read
    /// by some means, for example by polling the send CQ. Also, this method has
    /// no mutable borrows to its parameters, but can cause the content of the
    /// buffers to be modified!
    pub fn read(
        &self,
        local: &[MrSlice],
        remote: &MrRemote,
        target: Option<&QpEndpoint>,
        wr_id: u64,
        signal: bool,
    ) -> io::Result<()> {
        self.one_sided(OpKind::Read, local, remote, target, wr_id, signal)
    }

    /// Post an RDMA write request.
    ///
    /// See [`Qp::read`] for the meaning of `target`.
    pub fn write(
        &self,
        local: &[MrSlice],
        remote: &MrRemote,
        target: Option<&QpEndpoint>,
        wr_id: u64,
        signal: bool,
    ) -> io::Result<()> {
        self.one_sided(OpKind::Write, local, remote, target, wr_id, signal)
    }

    fn one_sided(
        &self,
        op: OpKind,
        local: &[MrSlice],
        remote: &MrRemote,
        target: Option<&QpEndpoint>,
        wr_id: u64,
        signal: bool,
    ) -> io::Result<()> {
        let opcode = match op {
            OpKind::Read => WcOpcode::RdmaRead,
            _ => WcOpcode::RdmaWrite,
        };
        let target = match (self.qp_type(), target) {
            (QpType::Rc, Some(ep)) if self.peer() != Some(*ep) => {
                return Err(IoError::new(
                    IoErrorKind::InvalidInput,
                    "RC QPs can only target their peer",
                ))
            }
            (_, Some(ep)) => *ep,
            (_, None) => self.peer().ok_or_else(|| {
                IoError::new(IoErrorKind::NotConnected, "no target for one-sided request")
            })?,
        };
        if !self.ready_to_send(local.len(), wr_id, opcode)? {
            return Ok(());
        }

        fabric::execute_one_sided(
            self.inner.fabric(),
            &self.inner,
            op,
            SendWr {
                sgl: local.iter().map(|s| s.to_sge()).collect(),
                wr_id,
                signal,
            },
            remote,
            &target,
        );
        Ok(())
    }

    /// Check whether a send-queue request can be posted.
    /// Return `false` if the request was flushed because the QP is in ERR.
    fn ready_to_send(&self, num_sge: usize, wr_id: u64, opcode: WcOpcode) -> io::Result<bool> {
        let caps = self.caps();
        if caps.max_send_wr == 0 {
            return Err(IoError::new(
                IoErrorKind::InvalidInput,
                "QP has no send queue",
            ));
        }
        if num_sge > caps.max_send_sge as usize {
            return Err(IoError::new(
                IoErrorKind::InvalidInput,
                format!("{} SGEs exceed max_send_sge", num_sge),
            ));
        }
        match self.state() {
            QpState::Rts => Ok(true),
            QpState::Error => {
                self.scq()
                    .push(Wc::new(wr_id, WcStatus::WrFlushErr, opcode, 0, self.qp_num()));
                Ok(false)
            }
            state => Err(IoError::new(
                IoErrorKind::InvalidInput,
                format!("cannot post send to QP in {}", state),
            )),
        }
    }
}
