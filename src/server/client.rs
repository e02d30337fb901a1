use std::io;
use std::net::{IpAddr, SocketAddr};

use super::conn::{fill_message, message_text};
use super::ServerConfig;
use crate::cm::{CmError, CmEventKind, CmId, EventChannel};
use crate::fabric::Fabric;
use crate::rdma::cq::{Cq, WcOpcode};
use crate::rdma::mr::{Buffer, MemoryKind, Mr, Permission, Slicing};
use crate::rdma::pd::Pd;
use crate::rdma::qp::{Qp, QpCaps};

const RECV_WR_ID: u64 = 1;
const SEND_WR_ID: u64 = 2;

/// Active side of the message exchange with a [`ConnectionServer`].
///
/// Connecting resolves the address and the route, creates the QP and both
/// regions, posts a receive, and after establishment sends one message
/// carrying the process ID.
///
/// [`ConnectionServer`]: super::ConnectionServer
pub struct CmClient {
    channel: EventChannel,
    id: CmId,
    qp: Qp,
    cq: Cq,
    send_mr: Mr,
    recv_mr: Mr,
}

impl CmClient {
    /// Connect to `dst`, using the device owning `src` (or the first one).
    pub fn connect(
        fabric: &Fabric,
        src: Option<IpAddr>,
        dst: SocketAddr,
        config: &ServerConfig,
    ) -> Result<Self, CmError> {
        let channel = EventChannel::new();
        let id = CmId::new(fabric, &channel)?;

        id.resolve_addr(src, dst)?;
        expect_event(&channel, CmEventKind::AddrResolved)?;

        let verbs = id.verbs().ok_or(CmError::NoDevice)?;
        let pd = Pd::new(&verbs)?;
        let cq = Cq::new(&verbs, config.cq_depth, None)?;
        let caps = QpCaps {
            max_send_wr: config.max_send_wr,
            max_recv_wr: config.max_recv_wr,
            max_send_sge: 1,
            max_recv_sge: 1,
        };
        let builder = Qp::builder()
            .send_cq(&cq)
            .recv_cq(&cq)
            .caps(caps)
            .sq_sig_all(false);
        let qp = id.create_qp(&pd, builder)?;

        let send_mr = Mr::reg(
            &pd,
            Buffer::alloc(config.buffer_size, MemoryKind::Host)?,
            Permission::EMPTY,
        )?;
        let recv_mr = Mr::reg(
            &pd,
            Buffer::alloc(config.buffer_size, MemoryKind::Host)?,
            Permission::LOCAL_WRITE,
        )?;
        qp.recv(&[recv_mr.as_slice()], RECV_WR_ID)?;

        id.resolve_route()?;
        expect_event(&channel, CmEventKind::RouteResolved)?;

        id.connect()?;
        expect_event(&channel, CmEventKind::Established)?;
        log::info!("connected. posting send...");

        send_mr.write(|buf| {
            fill_message(
                buf,
                &format!(
                    "message from active/client side with pid {}",
                    std::process::id()
                ),
            )
        });
        qp.send(&[send_mr.as_slice()], SEND_WR_ID, true)?;

        Ok(Self {
            channel,
            id,
            qp,
            cq,
            send_mr,
            recv_mr,
        })
    }

    pub fn id(&self) -> &CmId {
        &self.id
    }

    pub fn qp(&self) -> &Qp {
        &self.qp
    }

    /// Send the contents of `message` again on the established connection.
    pub fn send_message(&self, message: &str) -> io::Result<()> {
        self.send_mr.write(|buf| fill_message(buf, message));
        self.qp.send(&[self.send_mr.as_slice()], SEND_WR_ID, true)
    }

    /// Block until the peer's message arrives and return its text.
    ///
    /// Send completions seen on the way are checked and consumed.
    pub fn wait_message(&self) -> Result<String, CmError> {
        loop {
            let wc = self.cq.poll_one_blocking()?;
            wc.ok().map_err(|status| CmError::Completion {
                wr_id: wc.wr_id(),
                status,
            })?;

            match wc.opcode() {
                WcOpcode::Recv => {
                    let message = self.recv_mr.read(message_text);
                    log::info!("received message: {}", message);
                    return Ok(message);
                }
                WcOpcode::Send => log::info!("send completed successfully."),
                opcode => log::debug!("ignoring {:?} completion", opcode),
            }
        }
    }

    /// Tear down the connection and wait for the local `DISCONNECTED`.
    pub fn disconnect(self) -> Result<(), CmError> {
        self.id.disconnect()?;
        expect_event(&self.channel, CmEventKind::Disconnected)?;
        log::info!("disconnected.");
        Ok(())
    }
}

fn expect_event(channel: &EventChannel, kind: CmEventKind) -> Result<(), CmError> {
    let event = match channel.get_event() {
        Ok(event) => event,
        Err(e) if e.kind() == io::ErrorKind::BrokenPipe => return Err(CmError::ChannelClosed),
        Err(e) => return Err(e.into()),
    };
    if event.kind != kind {
        log::error!("expected {}, got {} (status {})", kind, event.kind, event.status);
        return Err(CmError::ConnectFailed {
            kind: event.kind,
            status: event.status,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_refused() {
        let fabric = Fabric::new();
        fabric.add_nic("soft0", "10.0.0.1".parse().unwrap()).unwrap();

        let err = CmClient::connect(
            &fabric,
            None,
            "10.0.0.1:18515".parse().unwrap(),
            &ServerConfig::default(),
        )
        .err()
        .unwrap();
        assert!(matches!(
            err,
            CmError::ConnectFailed { kind: CmEventKind::Rejected, status } if status == -libc::ECONNREFUSED
        ));
    }

    #[test]
    fn test_unreachable() {
        let fabric = Fabric::new();
        fabric.add_nic("soft0", "10.0.0.1".parse().unwrap()).unwrap();

        let err = CmClient::connect(
            &fabric,
            None,
            "10.0.0.77:18515".parse().unwrap(),
            &ServerConfig::default(),
        )
        .err()
        .unwrap();
        assert!(matches!(
            err,
            CmError::ConnectFailed { kind: CmEventKind::AddrError, .. }
        ));
    }
}
