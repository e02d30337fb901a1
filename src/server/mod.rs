//! Connection lifecycle manager.
//!
//! A [`ConnectionServer`] listens on a connection manager identifier and
//! reacts to three events. On a connect request it builds the device
//! context (first request only, which also starts the completion poller),
//! creates the connection's QP and regions, posts one receive, and accepts.
//! On establishment it posts a signaled diagnostic send. On disconnect it
//! releases the connection. Every other event is fatal, and so is a failed
//! completion: it stops the poller, which closes the event channel and
//! makes [`ConnectionServer::run`] return the poller's error.

mod client;
mod conn;
mod device;
mod handler;
mod table;

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread::JoinHandle;

use serde::{Deserialize, Serialize};

pub use self::client::*;
pub use self::conn::*;
pub use self::device::*;
pub use self::handler::*;
pub use self::table::*;
use crate::cm::{CmError, CmEvent, CmId, EventChannel};
use crate::fabric::Fabric;
use crate::poller::{CompletionPoller, PollerError};

/// Connection server settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to listen on. Port 0 lets the connection manager pick one.
    pub bind: SocketAddr,
    pub backlog: u32,

    /// Size of each connection's send and receive region.
    pub buffer_size: usize,
    pub cq_depth: u32,
    pub max_send_wr: u32,
    pub max_recv_wr: u32,

    /// Post a fresh receive after every received message. When off, a
    /// connection takes exactly one message from its peer.
    pub repost_receive: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let ip = if cfg!(feature = "ipv6") {
            IpAddr::V6(Ipv6Addr::UNSPECIFIED)
        } else {
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        };
        Self {
            bind: SocketAddr::new(ip, 0),
            backlog: 10,
            buffer_size: 1024,
            cq_depth: 10,
            max_send_wr: 10,
            max_recv_wr: 10,
            repost_receive: false,
        }
    }
}

/// Passive side of the connection manager.
pub struct ConnectionServer {
    config: ServerConfig,
    channel: EventChannel,
    listener: CmId,
    device: DeviceSlot,
    table: Arc<ConnTable<Connection>>,
    notices: NoticeBoard,
    poller: Option<JoinHandle<Result<(), PollerError>>>,
    poller_failed: Arc<AtomicBool>,
}

impl ConnectionServer {
    /// Bind and listen as configured.
    pub fn bind(fabric: &Fabric, config: ServerConfig) -> Result<Self, CmError> {
        let channel = EventChannel::new();
        let listener = CmId::new(fabric, &channel)?;
        listener.bind_addr(config.bind)?;
        listener.listen(config.backlog)?;
        log::info!("listening on port {}.", listener.src_port());

        Ok(Self {
            config,
            channel,
            listener,
            device: DeviceSlot::new(),
            table: Arc::new(ConnTable::new()),
            notices: NoticeBoard::default(),
            poller: None,
            poller_failed: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Publish [`Notice`]s to `tx`.
    pub fn with_notices(mut self, tx: Sender<Notice>) -> Self {
        self.notices = NoticeBoard::new(Some(tx));
        self
    }

    /// The port the server listens on.
    pub fn port(&self) -> u16 {
        self.listener.src_port()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// The channel the server takes events from. Closing it ends
    /// [`ConnectionServer::run`].
    pub fn event_channel(&self) -> &EventChannel {
        &self.channel
    }

    /// Number of live connections.
    pub fn connections(&self) -> usize {
        self.table.len()
    }

    /// The device context, once the first connection request built it.
    pub fn device(&self) -> Option<&Arc<DeviceContext>> {
        self.device.get()
    }

    /// Take the join handle of the completion poller, if it was started.
    pub fn take_poller(&mut self) -> Option<JoinHandle<Result<(), PollerError>>> {
        self.poller.take()
    }

    /// Process events until the event channel is closed, an event fails, or
    /// the completion poller stops on an error.
    pub fn run(&mut self) -> Result<(), CmError> {
        loop {
            if let Some(err) = self.poller_exit() {
                return Err(err);
            }
            let event = match self.channel.get_event() {
                Ok(event) => event,
                Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                    return self.poller_exit().map_or(Ok(()), Err);
                }
                Err(e) => return Err(e.into()),
            };
            log::debug!("{} on {:?}", event.kind, event.id);

            if let Err(e) = self.on_event(event.into()) {
                log::error!("on_event: {}", e);
                self.notices.publish(Notice::Fatal {
                    reason: e.to_string(),
                });
                return Err(e);
            }
        }
    }

    /// The poller's error, once it has failed. Completion failures were
    /// already published by the handler.
    fn poller_exit(&mut self) -> Option<CmError> {
        if !self.poller_failed.load(Ordering::Acquire) {
            return None;
        }
        let err = match self.poller.take().map(JoinHandle::join) {
            Some(Ok(Err(e))) => e,
            Some(Err(_)) => io::Error::other("completion poller panicked").into(),
            _ => io::Error::other("completion poller stopped").into(),
        };
        log::error!("completion poller failed: {}", err);
        if !matches!(err, PollerError::Completion { .. }) {
            self.notices.publish(Notice::Fatal {
                reason: err.to_string(),
            });
        }
        Some(CmError::Poller(err))
    }

    /// Apply one event to the state machine.
    pub fn on_event(&mut self, event: CmEvent) -> Result<(), CmError> {
        match event {
            CmEvent::ConnectRequest(id) => self.on_connect_request(id),
            CmEvent::Established(id) => self.on_established(id),
            CmEvent::Disconnected(id) => self.on_disconnect(id),
            CmEvent::Unsupported { kind, .. } => Err(CmError::UnsupportedEvent(kind)),
        }
    }

    fn on_connect_request(&mut self, id: CmId) -> Result<(), CmError> {
        log::info!("received connection request.");

        let verbs = id.verbs().ok_or(CmError::NoDevice)?;
        let (dev, fresh) = self.device.get_or_build(&verbs, self.config.cq_depth)?;
        if fresh {
            let handler = ConnectionHandler::new(
                self.table.clone(),
                self.notices.clone(),
                self.config.repost_receive,
            );
            let failed = self.poller_failed.clone();
            let events = self.channel.clone();
            let poller = CompletionPoller::new(dev.channel().clone(), dev.cq().clone(), handler)
                .spawn_then(move |res| {
                    if res.is_err() {
                        failed.store(true, Ordering::Release);
                        events.close();
                    }
                })?;
            self.poller = Some(poller);
        }

        let config = &self.config;
        let (handle, conn) = self
            .table
            .insert_with(|handle| Connection::build(handle, &id, &dev, config))?;
        id.set_context(handle.wr_id());

        // The peer may send as soon as it is accepted.
        conn.post_receive()?;
        self.notices.publish(Notice::ReceivePosted { handle });

        id.accept()?;
        log::debug!("accepted {:?} from {:?}", handle, id.peer_addr());
        Ok(())
    }

    fn on_established(&mut self, id: CmId) -> Result<(), CmError> {
        let handle = ConnHandle::from_wr_id(id.context());
        let conn = self
            .table
            .get(handle)
            .ok_or(CmError::UnknownConnection(id.num()))?;

        self.notices.publish(Notice::Established { handle });
        log::info!("connected. posting send...");
        conn.post_send_message(&format!(
            "message from passive/server side with pid {}",
            std::process::id()
        ))?;
        Ok(())
    }

    fn on_disconnect(&mut self, id: CmId) -> Result<(), CmError> {
        log::info!("peer disconnected.");

        let handle = ConnHandle::from_wr_id(id.context());
        let conn = self
            .table
            .remove(handle)
            .ok_or(CmError::UnknownConnection(id.num()))?;
        drop(conn);
        self.notices.publish(Notice::Disconnected { handle });
        Ok(())
    }

    /// Stop taking events, stop the poller, and return the poller's result.
    pub fn shutdown(mut self) -> Result<(), PollerError> {
        self.channel.close();
        if let Some(dev) = self.device.get() {
            dev.channel().close();
        }
        match self.poller.take() {
            Some(poller) => poller
                .join()
                .unwrap_or_else(|_| Err(io::Error::other("completion poller panicked").into())),
            None => Ok(()),
        }
    }
}

impl Drop for ConnectionServer {
    fn drop(&mut self) {
        // Lets a detached poller thread exit.
        if let Some(dev) = self.device.get() {
            dev.channel().close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cm::CmEventKind;
    use crate::rdma::cq::Cq;
    use crate::rdma::mr::{Buffer, MemoryKind, Mr, Permission, Slicing};
    use crate::rdma::pd::Pd;
    use crate::rdma::qp::{Qp, QpCaps};
    use std::sync::mpsc;
    use std::time::Duration;

    fn fabric() -> Fabric {
        let fabric = Fabric::new();
        fabric.add_nic("soft0", "10.0.0.1".parse().unwrap()).unwrap();
        fabric.add_nic("soft1", "10.0.0.2".parse().unwrap()).unwrap();
        fabric
    }

    /// Active side driven by hand: resolved, QP created, receive posted.
    struct RawClient {
        id: CmId,
        channel: EventChannel,
        cq: Cq,
        recv_mr: Mr,
    }

    fn connect_raw(fabric: &Fabric, src: &str, dst: &str, port: u16) -> RawClient {
        let channel = EventChannel::new();
        let id = CmId::new(fabric, &channel).unwrap();
        let dst = SocketAddr::new(dst.parse().unwrap(), port);
        id.resolve_addr(Some(src.parse().unwrap()), dst).unwrap();

        let pd = Pd::new(&id.verbs().unwrap()).unwrap();
        let cq = Cq::new(pd.context(), 16, None).unwrap();
        let builder = Qp::builder()
            .send_cq(&cq)
            .recv_cq(&cq)
            .caps(QpCaps::for_connection(4))
            .sq_sig_all(false);
        let qp = id.create_qp(&pd, builder).unwrap();
        let recv_mr = Mr::reg(
            &pd,
            Buffer::alloc(1024, MemoryKind::Host).unwrap(),
            Permission::LOCAL_WRITE,
        )
        .unwrap();
        qp.recv(&[recv_mr.as_slice()], 1).unwrap();

        id.resolve_route().unwrap();
        id.connect().unwrap();
        RawClient {
            id,
            channel,
            cq,
            recv_mr,
        }
    }

    fn step(server: &mut ConnectionServer) -> Result<(), CmError> {
        let event = server.event_channel().try_get_event().unwrap();
        server.on_event(event.into())
    }

    #[test]
    fn test_lifecycle() {
        let fabric = fabric();
        let (tx, rx) = mpsc::channel();
        let mut server = ConnectionServer::bind(&fabric, ServerConfig::default())
            .unwrap()
            .with_notices(tx);
        assert!(server.device().is_none());

        let client = connect_raw(&fabric, "10.0.0.1", "10.0.0.1", server.port());
        step(&mut server).unwrap();
        assert_eq!(server.connections(), 1);
        assert!(server.device().is_some());
        let handle = match rx.try_recv().unwrap() {
            Notice::ReceivePosted { handle } => handle,
            other => panic!("unexpected {:?}", other),
        };

        let kinds = std::iter::from_fn(|| client.channel.try_get_event())
            .map(|e| e.kind)
            .collect::<Vec<_>>();
        assert_eq!(
            kinds,
            vec![
                CmEventKind::AddrResolved,
                CmEventKind::RouteResolved,
                CmEventKind::Established
            ]
        );

        step(&mut server).unwrap();
        assert_eq!(rx.try_recv().unwrap(), Notice::Established { handle });
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            Notice::SendCompleted { handle }
        );

        let wc = client.cq.poll_one().unwrap().unwrap();
        assert_eq!(wc.ok(), Ok(1024));
        let text = client.recv_mr.read(conn::message_text);
        assert_eq!(
            text,
            format!("message from passive/server side with pid {}", std::process::id())
        );

        let deregs = fabric.stats().deregs;
        client.id.disconnect().unwrap();
        step(&mut server).unwrap();
        assert_eq!(server.connections(), 0);
        assert_eq!(rx.try_recv().unwrap(), Notice::Disconnected { handle });
        assert_eq!(fabric.stats().deregs, deregs + 2);

        server.shutdown().unwrap();
    }

    #[test]
    fn test_second_device_is_fatal() {
        let fabric = fabric();
        let mut server = ConnectionServer::bind(&fabric, ServerConfig::default()).unwrap();

        let _first = connect_raw(&fabric, "10.0.0.1", "10.0.0.1", server.port());
        step(&mut server).unwrap();

        let _second = connect_raw(&fabric, "10.0.0.2", "10.0.0.2", server.port());
        let err = step(&mut server).unwrap_err();
        assert!(matches!(err, CmError::ForeignDevice { .. }));
        assert_eq!(server.connections(), 1);
        server.shutdown().unwrap();
    }

    #[test]
    fn test_unexpected_events() {
        let fabric = fabric();
        let mut server = ConnectionServer::bind(&fabric, ServerConfig::default()).unwrap();
        let stray = CmId::new(&fabric, server.event_channel()).unwrap();

        let err = server
            .on_event(CmEvent::Unsupported {
                kind: CmEventKind::AddrChange,
                id: stray.clone(),
            })
            .unwrap_err();
        assert!(matches!(err, CmError::UnsupportedEvent(CmEventKind::AddrChange)));

        let err = server.on_event(CmEvent::Established(stray)).unwrap_err();
        assert!(matches!(err, CmError::UnknownConnection(_)));
        server.shutdown().unwrap();
    }

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.bind.port(), 0);
        assert!(config.bind.ip().is_unspecified());
        assert_eq!(config.cq_depth, 10);
        assert!(!config.repost_receive);
    }
}
