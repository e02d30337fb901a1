use std::fmt;

/// Queue pair type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QpType {
    /// Reliable connection. Bound to exactly one remote peer.
    Rc,

    /// Dynamically-connected initiator. Every one-sided request names its
    /// own target, so one QP can reach any peer on the fabric.
    Dc,
}

impl QpType {
    /// Determine whether the QP type is connected to a fixed peer.
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Rc)
    }

    /// Determine whether the QP type supports two-sided sends.
    pub const fn supports_send(self) -> bool {
        matches!(self, Self::Rc)
    }
}

/// Queue pair state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QpState {
    Reset,
    Init,
    /// Ready to receive.
    Rtr,
    /// Ready to send.
    Rts,
    Error,
}

impl fmt::Display for QpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Reset => "RESET",
            Self::Init => "INIT",
            Self::Rtr => "RTR",
            Self::Rts => "RTS",
            Self::Error => "ERR",
        };
        f.write_str(s)
    }
}
