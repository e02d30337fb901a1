use std::fmt;

use thiserror::Error;

/// What kind of work request a completion reports.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum WcOpcode {
    Send,
    RdmaWrite,
    RdmaRead,
    /// An incoming message consumed a posted receive.
    Recv,
}

/// Outcome of a work request.
///
/// Discriminants follow `enum ibv_wc_status`, so that [`WcStatus::code`]
/// prints the numbers operators are used to seeing next to the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
#[repr(u32)]
pub enum WcStatus {
    /// The work request and every unsignaled request posted before it are
    /// done; their buffers may be reused.
    #[error("success")]
    Success = 0,

    /// A send message exceeded the port limit, or a posted receive buffer was
    /// too small for the incoming message.
    #[error("local length error")]
    LocLenErr = 1,

    /// Internal QP consistency error, e.g. an opcode the transport does not
    /// support.
    #[error("local QP operation error")]
    LocQpOpErr = 2,

    /// A local scatter/gather entry does not reference a memory region valid
    /// for the requested operation.
    #[error("local protection error")]
    LocProtErr = 4,

    /// The request was outstanding when the QP entered the error state.
    #[error("WR flush error")]
    WrFlushErr = 5,

    #[error("bad response error")]
    BadRespErr = 7,

    #[error("local access error")]
    LocAccessErr = 8,

    /// The responder rejected the request, e.g. it had no room for the
    /// incoming message.
    #[error("remote invalid request error")]
    RemInvReqErr = 9,

    /// Protection error on the remote buffer of an RDMA read or write:
    /// unknown rkey, missing permission, or an out-of-bounds range.
    #[error("remote access error")]
    RemAccessErr = 10,

    /// The responder could not complete the operation.
    #[error("remote operation error")]
    RemOpErr = 11,

    /// The remote side never answered. On the first message this usually
    /// means wrong connection attributes; later, that the remote QP is gone.
    #[error("transport retry counter exceeded")]
    RetryExcErr = 12,

    /// The remote side had no receive request posted.
    #[error("RNR retry counter exceeded")]
    RnrRetryExcErr = 13,

    #[error("remote aborted error")]
    RemAbortErr = 16,

    #[error("fatal error")]
    FatalErr = 19,

    #[error("response timeout error")]
    RespTimeoutErr = 20,

    #[error("general error")]
    GeneralErr = 21,
}

impl WcStatus {
    /// Numeric `ibv_wc_status` code.
    #[inline]
    pub fn code(self) -> u32 {
        self as u32
    }

    /// The status behind an `ibv_wc_status` code. Codes without a variant
    /// here map to [`WcStatus::GeneralErr`].
    pub fn from_code(code: u32) -> Self {
        use WcStatus::*;
        [
            Success, LocLenErr, LocQpOpErr, LocProtErr, WrFlushErr, BadRespErr, LocAccessErr,
            RemInvReqErr, RemAccessErr, RemOpErr, RetryExcErr, RnrRetryExcErr, RemAbortErr,
            FatalErr, RespTimeoutErr, GeneralErr,
        ]
        .into_iter()
        .find(|status| status.code() == code)
        .unwrap_or(GeneralErr)
    }
}

/// One completion polled from a [`Cq`](super::Cq).
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Wc {
    wr_id: u64,
    status: WcStatus,
    opcode: WcOpcode,
    byte_len: u32,
    qp_num: u32,
}

impl Wc {
    /// Assemble a work completion.
    ///
    /// Completions normally come out of [`Cq`](super::Cq) polls; building one
    /// by hand is useful to drive completion consumers directly.
    pub fn new(wr_id: u64, status: WcStatus, opcode: WcOpcode, byte_len: u32, qp_num: u32) -> Self {
        Self {
            wr_id,
            status,
            opcode,
            byte_len,
            qp_num,
        }
    }

    /// The ID the request was posted with.
    #[inline]
    pub fn wr_id(&self) -> u64 {
        self.wr_id
    }

    #[inline]
    pub fn status(&self) -> WcStatus {
        self.status
    }

    /// Bytes moved on success, the failed status otherwise.
    #[inline]
    pub fn ok(&self) -> Result<usize, WcStatus> {
        match self.status {
            WcStatus::Success => Ok(self.byte_len as usize),
            status => Err(status),
        }
    }

    #[inline]
    pub fn opcode(&self) -> WcOpcode {
        self.opcode
    }

    /// Bytes moved. Meaningless for failed requests.
    #[inline]
    pub fn bytes(&self) -> usize {
        self.byte_len as usize
    }

    /// Local QP that posted the request.
    #[inline]
    pub fn qp_num(&self) -> u32 {
        self.qp_num
    }
}

impl fmt::Debug for Wc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Wc")
            .field("wr_id", &self.wr_id)
            .field("status", &self.status)
            .field("opcode", &self.opcode)
            .field("byte_len", &self.byte_len)
            .field("qp_num", &format_args!("{:#x}", self.qp_num))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wc_ok() {
        let wc = Wc::new(7, WcStatus::Success, WcOpcode::Recv, 64, 0x100);
        assert_eq!(wc.ok(), Ok(64));
        assert_eq!(wc.wr_id(), 7);

        let wc = Wc::new(7, WcStatus::RemAccessErr, WcOpcode::RdmaWrite, 0, 0x100);
        assert_eq!(wc.ok(), Err(WcStatus::RemAccessErr));
        assert_eq!(WcStatus::RemAccessErr.code(), 10);
        assert_eq!(WcStatus::RnrRetryExcErr.to_string(), "RNR retry counter exceeded");
    }

    #[test]
    fn test_status_from_code() {
        assert_eq!(WcStatus::from_code(0), WcStatus::Success);
        assert_eq!(WcStatus::from_code(13), WcStatus::RnrRetryExcErr);
        assert_eq!(WcStatus::from_code(20), WcStatus::RespTimeoutErr);
        // IBV_WC_MW_BIND_ERR
        assert_eq!(WcStatus::from_code(6), WcStatus::GeneralErr);
    }
}
