use std::fmt;
use std::io::{self, Error as IoError, ErrorKind as IoErrorKind};
use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use super::{CmEventKind, EventChannel, RawCmEvent};
use crate::fabric::Fabric;
use crate::rdma::context::Context;
use crate::rdma::pd::Pd;
use crate::rdma::qp::{Qp, QpBuilder, QpCreationError, QpType};

#[derive(Default)]
struct CmIdState {
    verbs: Option<Context>,
    qp: Option<Qp>,
    local: Option<SocketAddr>,
    remote: Option<SocketAddr>,

    /// Port reserved in the fabric by this identifier.
    port: Option<u16>,
    backlog: Option<u32>,
    pending: u32,
    route_resolved: bool,

    listener: Option<Weak<CmIdInner>>,
    peer: Option<Weak<CmIdInner>>,
    connected: bool,
    context: u64,
}

pub(crate) struct CmIdInner {
    num: u32,
    fabric: Fabric,
    channel: EventChannel,
    state: Mutex<CmIdState>,
}

impl Drop for CmIdInner {
    fn drop(&mut self) {
        if let Some(port) = self.state.get_mut().port {
            self.fabric.release_port(port);
        }
    }
}

/// Connection manager identifier, the RDMA counterpart of a socket.
///
/// A listener spawns one child identifier per incoming connection request;
/// the child carries the device the request arrived on.
#[derive(Clone)]
pub struct CmId {
    inner: Arc<CmIdInner>,
}

impl fmt::Debug for CmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("CmId<{}>", self.inner.num))
    }
}

impl CmId {
    /// Create an identifier reporting to the given event channel.
    pub fn new(fabric: &Fabric, channel: &EventChannel) -> io::Result<Self> {
        Ok(Self {
            inner: Arc::new(CmIdInner {
                num: fabric.next_object_id(),
                fabric: fabric.clone(),
                channel: channel.clone(),
                state: Mutex::new(CmIdState::default()),
            }),
        })
    }

    fn notify(&self, kind: CmEventKind, status: i32) {
        self.inner.channel.push(RawCmEvent {
            kind,
            id: self.clone(),
            status,
        });
    }

    /// Identifier number, unique within the fabric.
    #[inline]
    pub fn num(&self) -> u32 {
        self.inner.num
    }

    /// The event channel this identifier reports to.
    #[inline]
    pub fn event_channel(&self) -> &EventChannel {
        &self.inner.channel
    }

    /// The device this identifier is bound to, once known.
    pub fn verbs(&self) -> Option<Context> {
        self.inner.state.lock().verbs.clone()
    }

    /// The QP created with [`CmId::create_qp`], if any.
    pub fn qp(&self) -> Option<Qp> {
        self.inner.state.lock().qp.clone()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.state.lock().local
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.state.lock().remote
    }

    /// Local port, or 0 if the identifier is not bound.
    pub fn src_port(&self) -> u16 {
        self.local_addr().map_or(0, |addr| addr.port())
    }

    /// Attach an opaque user value to the identifier.
    pub fn set_context(&self, context: u64) {
        self.inner.state.lock().context = context;
    }

    pub fn context(&self) -> u64 {
        self.inner.state.lock().context
    }

    /// Whether the identifier is currently connected to a peer.
    pub fn is_connected(&self) -> bool {
        self.inner.state.lock().connected
    }

    /// Bind to a local address.
    ///
    /// Port 0 picks an ephemeral port. A specified IP address also binds the
    /// identifier to the device owning that address; the wildcard address
    /// leaves the device open until a connection request arrives.
    pub fn bind_addr(&self, addr: SocketAddr) -> io::Result<()> {
        let mut state = self.inner.state.lock();
        if state.local.is_some() {
            return Err(IoError::new(
                IoErrorKind::InvalidInput,
                "identifier already bound",
            ));
        }

        let verbs = if addr.ip().is_unspecified() {
            None
        } else {
            Some(Context::open_by_addr(&self.inner.fabric, addr.ip())?)
        };
        let port = self
            .inner
            .fabric
            .bind_port(addr.port(), Arc::downgrade(&self.inner))?;

        state.verbs = verbs;
        state.local = Some(SocketAddr::new(addr.ip(), port));
        state.port = Some(port);
        Ok(())
    }

    /// Start listening for connection requests.
    pub fn listen(&self, backlog: u32) -> io::Result<()> {
        let mut state = self.inner.state.lock();
        let Some(local) = state.local else {
            return Err(IoError::new(
                IoErrorKind::InvalidInput,
                "identifier must be bound before listening",
            ));
        };
        state.backlog = Some(backlog.max(1));
        log::debug!("{:?} listening on {} (backlog {})", self, local, backlog);
        Ok(())
    }

    /// Resolve the destination address and pick the local device.
    ///
    /// Reports `ADDR_RESOLVED`, or `ADDR_ERROR` if no device answers to
    /// `dst`. If `src` is `None`, the first device of the fabric is used.
    pub fn resolve_addr(&self, src: Option<IpAddr>, dst: SocketAddr) -> io::Result<()> {
        let fabric = &self.inner.fabric;
        if fabric.nic_by_addr(dst.ip()).is_none() {
            log::debug!("{:?}: no route to {}", self, dst);
            self.notify(CmEventKind::AddrError, -libc::EHOSTUNREACH);
            return Ok(());
        }

        let src = src.unwrap_or(match dst {
            SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        });
        let ctx = Context::open_by_addr(fabric, src)?;

        let mut state = self.inner.state.lock();
        let port = match state.port {
            Some(port) => port,
            None => fabric.bind_port(0, Arc::downgrade(&self.inner))?,
        };
        state.port = Some(port);
        state.local = Some(SocketAddr::new(ctx.addr(), port));
        state.verbs = Some(ctx);
        state.remote = Some(dst);
        drop(state);

        self.notify(CmEventKind::AddrResolved, 0);
        Ok(())
    }

    /// Resolve the route to the destination. Reports `ROUTE_RESOLVED`.
    pub fn resolve_route(&self) -> io::Result<()> {
        let mut state = self.inner.state.lock();
        if state.remote.is_none() {
            return Err(IoError::new(
                IoErrorKind::InvalidInput,
                "address not resolved",
            ));
        }
        state.route_resolved = true;
        drop(state);

        self.notify(CmEventKind::RouteResolved, 0);
        Ok(())
    }

    /// Create an RC QP for this identifier.
    ///
    /// The QP is left in INIT, so receives can be posted before the
    /// connection is accepted.
    pub fn create_qp(&self, pd: &Pd, builder: QpBuilder) -> Result<Qp, QpCreationError> {
        let verbs = self
            .verbs()
            .ok_or_else(|| IoError::new(IoErrorKind::NotConnected, "identifier has no device"))?;
        if !pd.context().same_device(&verbs) {
            return Err(IoError::new(
                IoErrorKind::InvalidInput,
                "PD belongs to another device",
            )
            .into());
        }
        if self.inner.state.lock().qp.is_some() {
            return Err(IoError::new(IoErrorKind::AlreadyExists, "identifier already has a QP").into());
        }

        let qp = builder.qp_type(QpType::Rc).build(pd)?;
        qp.init()?;
        self.inner.state.lock().qp = Some(qp.clone());
        Ok(qp)
    }

    /// Detach the QP from this identifier. The QP is destroyed once its last
    /// handle is dropped.
    pub fn destroy_qp(&self) -> Option<Qp> {
        self.inner.state.lock().qp.take()
    }

    /// Send a connection request to the resolved destination.
    ///
    /// The listener receives `CONNECT_REQUEST` with a new child identifier.
    /// If nobody listens there, or the listener backlog is full, this
    /// identifier receives `REJECTED` instead.
    pub fn connect(&self) -> io::Result<()> {
        let (local, remote, routed, has_qp) = {
            let state = self.inner.state.lock();
            (state.local, state.remote, state.route_resolved, state.qp.is_some())
        };
        let (Some(local), Some(remote)) = (local, remote) else {
            return Err(IoError::new(
                IoErrorKind::InvalidInput,
                "address not resolved",
            ));
        };
        if !routed {
            return Err(IoError::new(
                IoErrorKind::InvalidInput,
                "route not resolved",
            ));
        }
        if !has_qp {
            return Err(IoError::new(IoErrorKind::InvalidInput, "no QP created"));
        }

        let fabric = &self.inner.fabric;
        let listener = fabric.port_owner(remote.port()).filter(|id| {
            let state = id.state.lock();
            state.backlog.is_some()
                && state
                    .local
                    .is_some_and(|addr| addr.ip().is_unspecified() || addr.ip() == remote.ip())
        });
        let Some(listener) = listener else {
            log::debug!("{:?}: nobody listens on {}", self, remote);
            self.notify(CmEventKind::Rejected, -libc::ECONNREFUSED);
            return Ok(());
        };

        {
            let mut state = listener.state.lock();
            if state.pending >= state.backlog.unwrap_or(0) {
                drop(state);
                log::debug!("{:?}: backlog of {} is full", self, remote);
                self.notify(CmEventKind::Rejected, -libc::ECONNREFUSED);
                return Ok(());
            }
            state.pending += 1;
        }

        let verbs = Context::open_by_addr(fabric, remote.ip())?;
        let child = Arc::new(CmIdInner {
            num: fabric.next_object_id(),
            fabric: fabric.clone(),
            channel: listener.channel.clone(),
            state: Mutex::new(CmIdState {
                verbs: Some(verbs),
                local: Some(SocketAddr::new(remote.ip(), remote.port())),
                remote: Some(local),
                listener: Some(Arc::downgrade(&listener)),
                peer: Some(Arc::downgrade(&self.inner)),
                ..CmIdState::default()
            }),
        });
        self.inner.state.lock().peer = Some(Arc::downgrade(&child));

        CmId { inner: child }.notify(CmEventKind::ConnectRequest, 0);
        Ok(())
    }

    /// Accept the connection request this child identifier stands for.
    ///
    /// Both QPs are brought up to RTS and both sides receive `ESTABLISHED`.
    pub fn accept(&self) -> io::Result<()> {
        let (qp, peer, listener) = {
            let mut state = self.inner.state.lock();
            (state.qp.clone(), state.peer.clone(), state.listener.take())
        };
        if let Some(listener) = listener.and_then(|l| l.upgrade()) {
            let mut state = listener.state.lock();
            state.pending = state.pending.saturating_sub(1);
        }

        let qp = qp.ok_or_else(|| IoError::new(IoErrorKind::InvalidInput, "no QP created"))?;
        let peer = peer
            .and_then(|p| p.upgrade())
            .ok_or_else(|| IoError::new(IoErrorKind::NotConnected, "peer is gone"))?;
        let peer_qp = peer
            .state
            .lock()
            .qp
            .clone()
            .ok_or_else(|| IoError::new(IoErrorKind::NotConnected, "peer has no QP"))?;

        qp.bind_peer(peer_qp.endpoint())?;
        peer_qp.bind_peer(qp.endpoint())?;
        self.inner.state.lock().connected = true;
        peer.state.lock().connected = true;

        self.notify(CmEventKind::Established, 0);
        CmId { inner: peer }.notify(CmEventKind::Established, 0);
        Ok(())
    }

    /// Tear down the connection.
    ///
    /// Both QPs enter ERR and both sides receive `DISCONNECTED`.
    /// Disconnecting an identifier that is not connected does nothing.
    pub fn disconnect(&self) -> io::Result<()> {
        let (connected, qp, peer) = {
            let mut state = self.inner.state.lock();
            (
                mem::replace(&mut state.connected, false),
                state.qp.clone(),
                state.peer.take(),
            )
        };
        if !connected {
            log::debug!("{:?} is not connected", self);
            return Ok(());
        }

        if let Some(qp) = qp {
            qp.modify_to_error();
        }
        self.notify(CmEventKind::Disconnected, 0);

        if let Some(peer) = peer.and_then(|p| p.upgrade()) {
            let (connected, qp) = {
                let mut state = peer.state.lock();
                state.peer = None;
                (mem::replace(&mut state.connected, false), state.qp.clone())
            };
            if connected {
                if let Some(qp) = qp {
                    qp.modify_to_error();
                }
                CmId { inner: peer }.notify(CmEventKind::Disconnected, 0);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rdma::cq::Cq;
    use crate::rdma::qp::{QpCaps, QpState};

    fn fabric() -> Fabric {
        let fabric = Fabric::new();
        fabric
            .add_nic("soft0", "10.0.0.1".parse().unwrap())
            .unwrap();
        fabric
            .add_nic("soft1", "10.0.0.2".parse().unwrap())
            .unwrap();
        fabric
    }

    fn attach_qp(id: &CmId) -> Qp {
        let pd = Pd::new(&id.verbs().unwrap()).unwrap();
        let cq = Cq::new(pd.context(), 16, None).unwrap();
        let builder = Qp::builder()
            .send_cq(&cq)
            .recv_cq(&cq)
            .caps(QpCaps::for_connection(4))
            .sq_sig_all(false);
        id.create_qp(&pd, builder).unwrap()
    }

    fn next_kind(channel: &EventChannel) -> CmEventKind {
        channel.try_get_event().unwrap().kind
    }

    #[test]
    fn test_bind_ports() {
        let fabric = fabric();
        let channel = EventChannel::new();

        let a = CmId::new(&fabric, &channel).unwrap();
        a.bind_addr("0.0.0.0:0".parse().unwrap()).unwrap();
        assert!(a.src_port() >= 49152);
        assert!(a.verbs().is_none());

        let b = CmId::new(&fabric, &channel).unwrap();
        b.bind_addr("10.0.0.2:18515".parse().unwrap()).unwrap();
        assert_eq!(b.verbs().unwrap().name(), "soft1");

        let c = CmId::new(&fabric, &channel).unwrap();
        let err = c.bind_addr("10.0.0.1:18515".parse().unwrap()).unwrap_err();
        assert_eq!(err.kind(), IoErrorKind::AddrInUse);

        // Dropping the owner frees the port.
        drop(b);
        c.bind_addr("10.0.0.1:18515".parse().unwrap()).unwrap();

        let d = CmId::new(&fabric, &channel).unwrap();
        let err = d.bind_addr("10.9.9.9:0".parse().unwrap()).unwrap_err();
        assert_eq!(err.kind(), IoErrorKind::AddrNotAvailable);
    }

    #[test]
    fn test_connect_accept_disconnect() {
        let fabric = fabric();
        let server_ch = EventChannel::new();
        let listener = CmId::new(&fabric, &server_ch).unwrap();
        listener.bind_addr("0.0.0.0:0".parse().unwrap()).unwrap();
        listener.listen(10).unwrap();
        let dst = SocketAddr::new("10.0.0.2".parse().unwrap(), listener.src_port());

        let client_ch = EventChannel::new();
        let client = CmId::new(&fabric, &client_ch).unwrap();
        client
            .resolve_addr(Some("10.0.0.1".parse().unwrap()), dst)
            .unwrap();
        assert_eq!(next_kind(&client_ch), CmEventKind::AddrResolved);
        let client_qp = attach_qp(&client);
        assert_eq!(client_qp.state(), QpState::Init);
        client.resolve_route().unwrap();
        assert_eq!(next_kind(&client_ch), CmEventKind::RouteResolved);
        client.connect().unwrap();

        let request = server_ch.try_get_event().unwrap();
        assert_eq!(request.kind, CmEventKind::ConnectRequest);
        let child = request.id;
        assert_ne!(child.num(), listener.num());
        assert_eq!(child.verbs().unwrap().name(), "soft1");
        assert_eq!(child.peer_addr(), client.local_addr());

        let server_qp = attach_qp(&child);
        child.accept().unwrap();
        assert_eq!(next_kind(&server_ch), CmEventKind::Established);
        assert_eq!(next_kind(&client_ch), CmEventKind::Established);
        assert_eq!(server_qp.peer(), Some(client_qp.endpoint()));
        assert_eq!(client_qp.peer(), Some(server_qp.endpoint()));
        assert!(client.is_connected());

        client.disconnect().unwrap();
        assert_eq!(next_kind(&client_ch), CmEventKind::Disconnected);
        let event = server_ch.try_get_event().unwrap();
        assert_eq!(event.kind, CmEventKind::Disconnected);
        assert_eq!(event.id.num(), child.num());
        assert_eq!(server_qp.state(), QpState::Error);
        assert_eq!(client_qp.state(), QpState::Error);

        // Second disconnect is a no-op on both sides.
        child.disconnect().unwrap();
        assert!(server_ch.try_get_event().is_none());
    }

    #[test]
    fn test_connect_without_listener() {
        let fabric = fabric();
        let channel = EventChannel::new();
        let client = CmId::new(&fabric, &channel).unwrap();
        client
            .resolve_addr(None, "10.0.0.2:4000".parse().unwrap())
            .unwrap();
        assert_eq!(next_kind(&channel), CmEventKind::AddrResolved);
        attach_qp(&client);
        client.resolve_route().unwrap();
        assert_eq!(next_kind(&channel), CmEventKind::RouteResolved);
        client.connect().unwrap();

        let event = channel.try_get_event().unwrap();
        assert_eq!(event.kind, CmEventKind::Rejected);
        assert_eq!(event.status, -libc::ECONNREFUSED);

        client
            .resolve_addr(None, "10.0.0.7:4000".parse().unwrap())
            .unwrap();
        assert_eq!(next_kind(&channel), CmEventKind::AddrError);
    }
}
