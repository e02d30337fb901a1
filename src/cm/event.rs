use std::fmt;

use super::CmId;

/// Kind of a connection manager event, numbered as `enum rdma_cm_event_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum CmEventKind {
    AddrResolved = 0,
    AddrError = 1,
    RouteResolved = 2,
    RouteError = 3,
    ConnectRequest = 4,
    ConnectResponse = 5,
    ConnectError = 6,
    Unreachable = 7,
    Rejected = 8,
    Established = 9,
    Disconnected = 10,
    DeviceRemoval = 11,
    MulticastJoin = 12,
    MulticastError = 13,
    AddrChange = 14,
    TimewaitExit = 15,
}

impl CmEventKind {
    const ALL: [CmEventKind; 16] = [
        Self::AddrResolved,
        Self::AddrError,
        Self::RouteResolved,
        Self::RouteError,
        Self::ConnectRequest,
        Self::ConnectResponse,
        Self::ConnectError,
        Self::Unreachable,
        Self::Rejected,
        Self::Established,
        Self::Disconnected,
        Self::DeviceRemoval,
        Self::MulticastJoin,
        Self::MulticastError,
        Self::AddrChange,
        Self::TimewaitExit,
    ];

    /// Name of the event as printed by `rdma_event_str`.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AddrResolved => "RDMA_CM_EVENT_ADDR_RESOLVED",
            Self::AddrError => "RDMA_CM_EVENT_ADDR_ERROR",
            Self::RouteResolved => "RDMA_CM_EVENT_ROUTE_RESOLVED",
            Self::RouteError => "RDMA_CM_EVENT_ROUTE_ERROR",
            Self::ConnectRequest => "RDMA_CM_EVENT_CONNECT_REQUEST",
            Self::ConnectResponse => "RDMA_CM_EVENT_CONNECT_RESPONSE",
            Self::ConnectError => "RDMA_CM_EVENT_CONNECT_ERROR",
            Self::Unreachable => "RDMA_CM_EVENT_UNREACHABLE",
            Self::Rejected => "RDMA_CM_EVENT_REJECTED",
            Self::Established => "RDMA_CM_EVENT_ESTABLISHED",
            Self::Disconnected => "RDMA_CM_EVENT_DISCONNECTED",
            Self::DeviceRemoval => "RDMA_CM_EVENT_DEVICE_REMOVAL",
            Self::MulticastJoin => "RDMA_CM_EVENT_MULTICAST_JOIN",
            Self::MulticastError => "RDMA_CM_EVENT_MULTICAST_ERROR",
            Self::AddrChange => "RDMA_CM_EVENT_ADDR_CHANGE",
            Self::TimewaitExit => "RDMA_CM_EVENT_TIMEWAIT_EXIT",
        }
    }
}

impl TryFrom<u32> for CmEventKind {
    type Error = u32;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Self::ALL.get(value as usize).copied().ok_or(value)
    }
}

impl fmt::Display for CmEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event as delivered by an [`EventChannel`](super::EventChannel).
#[derive(Debug, Clone)]
pub struct RawCmEvent {
    /// What happened.
    pub kind: CmEventKind,

    /// The identifier the event is about. For connect requests this is the
    /// newly created child identifier, not the listener.
    pub id: CmId,

    /// Zero on success, a negative errno for error events.
    pub status: i32,
}

/// Connection manager events a passive side reacts to.
///
/// Every other kind becomes [`CmEvent::Unsupported`], which passive sides
/// must treat as fatal.
#[derive(Debug, Clone)]
pub enum CmEvent {
    ConnectRequest(CmId),
    Established(CmId),
    Disconnected(CmId),
    Unsupported { kind: CmEventKind, id: CmId },
}

impl CmEvent {
    /// The identifier the event is about.
    pub fn id(&self) -> &CmId {
        match self {
            Self::ConnectRequest(id) | Self::Established(id) | Self::Disconnected(id) => id,
            Self::Unsupported { id, .. } => id,
        }
    }

    pub fn kind(&self) -> CmEventKind {
        match self {
            Self::ConnectRequest(_) => CmEventKind::ConnectRequest,
            Self::Established(_) => CmEventKind::Established,
            Self::Disconnected(_) => CmEventKind::Disconnected,
            Self::Unsupported { kind, .. } => *kind,
        }
    }
}

impl From<RawCmEvent> for CmEvent {
    fn from(event: RawCmEvent) -> Self {
        match event.kind {
            CmEventKind::ConnectRequest => Self::ConnectRequest(event.id),
            CmEventKind::Established => Self::Established(event.id),
            CmEventKind::Disconnected => Self::Disconnected(event.id),
            kind => Self::Unsupported { kind, id: event.id },
        }
    }
}
