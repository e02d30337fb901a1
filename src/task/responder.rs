use std::io::{Read, Write};
use std::net::{IpAddr, Ipv4Addr, TcpListener};

use serde::{Deserialize, Serialize};

use super::device::*;
use super::sgl::{partition, Segment};
use super::{SessionReport, ServeReport, TaskError};
use crate::ctrl::{write_ack, ControlPackage, ProtoError};
use crate::fabric::Fabric;
use crate::rdma::cq::WcStatus;
use crate::rdma::mr::MemoryKind;
use crate::utils::{Interrupt, RunTimer};

/// Responder settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResponderConfig {
    /// Address of the local device.
    pub addr: IpAddr,
    pub port: u16,

    /// Size of the local buffer, and of every transfer.
    pub size: usize,
    pub iters: u64,

    /// Split every transfer into this many segments; 0 keeps it contiguous.
    pub num_sges: usize,
    pub memory: MemoryKind,

    /// Serve another initiator after each session instead of returning.
    pub persistent: bool,

    /// Stop a persistent responder after this many accepted connections.
    pub max_sessions: Option<usize>,
}

impl Default for ResponderConfig {
    fn default() -> Self {
        Self {
            addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 18515,
            size: 4096,
            iters: 1000,
            num_sges: 0,
            memory: MemoryKind::Host,
            persistent: false,
            max_sessions: None,
        }
    }
}

/// Passive side of the transfer loop.
///
/// The buffer and the device are set up once and reused by every session.
pub struct Responder<D: OneSidedDevice = RdmaDevice> {
    device: D,
    buffer: D::Buffer,
    segments: Vec<Segment>,
    config: ResponderConfig,
    interrupt: Interrupt,
}

impl Responder<RdmaDevice> {
    /// Open the configured device and register a buffer on it.
    pub fn open(
        fabric: &Fabric,
        config: ResponderConfig,
        interrupt: Interrupt,
    ) -> Result<Self, TaskError> {
        let device = RdmaDevice::open(fabric, config.addr)?;
        Self::with_device(device, config, interrupt)
    }
}

impl<D: OneSidedDevice> Responder<D> {
    /// Register the configured buffer on `device`.
    pub fn with_device(
        device: D,
        config: ResponderConfig,
        interrupt: Interrupt,
    ) -> Result<Self, TaskError> {
        let buffer = device.alloc_buffer(config.size, config.memory)?;
        Self::new(device, buffer, config, interrupt)
    }

    /// Fails on a segment count that cannot be honored, before any transfer.
    pub fn new(
        device: D,
        buffer: D::Buffer,
        config: ResponderConfig,
        interrupt: Interrupt,
    ) -> Result<Self, TaskError> {
        let segments = partition(config.size, config.num_sges)?;
        Ok(Self {
            device,
            buffer,
            segments,
            config,
            interrupt,
        })
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn buffer(&self) -> &D::Buffer {
        &self.buffer
    }

    pub fn config(&self) -> &ResponderConfig {
        &self.config
    }

    /// Accept initiators on `listener` and serve them one at a time.
    ///
    /// Without persistent mode this serves one session and returns its
    /// error, if any. In persistent mode failed sessions are counted and the
    /// responder goes back to accepting until interrupted or until
    /// `max_sessions` connections were accepted.
    pub fn serve(&mut self, listener: &TcpListener) -> Result<ServeReport, TaskError> {
        let mut report = ServeReport::default();
        let mut accepted = 0;

        while !self.interrupt.is_set() {
            log::info!("listening to remote client...");
            let (mut stream, peer) = listener.accept().map_err(TaskError::Accept)?;
            accepted += 1;
            log::info!("connection accepted from {}.", peer);

            match self.run_session(&mut stream) {
                Ok(session) => report.sessions.push(session),
                Err(e) if self.config.persistent && !self.interrupt.is_set() => {
                    log::error!("session with {} failed: {}", peer, e);
                    report.failures += 1;
                }
                Err(e) => return Err(e),
            }
            drop(stream);

            if !self.config.persistent
                || self.config.max_sessions.is_some_and(|max| accepted >= max)
            {
                break;
            }
        }
        Ok(report)
    }

    /// Serve `iters` requests from one initiator.
    pub fn run_session<S: Read + Write>(&mut self, stream: &mut S) -> Result<SessionReport, TaskError> {
        let timer = RunTimer::start();
        let mut done = 0;

        for iteration in 0..self.config.iters {
            if self.interrupt.is_set() {
                log::info!("interrupted after {} iterations", done);
                break;
            }
            self.serve_one(stream, iteration)?;
            done += 1;
        }

        let stats = timer.finish(self.config.size, done);
        log::info!("{}", stats);
        Ok(SessionReport {
            iterations: done,
            stats,
        })
    }

    fn serve_one<S: Read + Write>(&mut self, stream: &mut S, iteration: u64) -> Result<(), TaskError> {
        let package = ControlPackage::read_from(stream)
            .map_err(|source| TaskError::Control { iteration, source })?;
        log::trace!(
            "iteration {}: received \"{}\", flags {} ({:?})",
            iteration,
            package.desc,
            package.flags,
            package.flags.op()
        );

        let task = RdmaTask {
            remote: package.desc,
            local: &self.buffer,
            segments: &self.segments,
            flags: package.flags,
            wr_id: iteration,
        };
        self.device.submit(&task)?;

        for c in self.await_completion()? {
            if c.status != WcStatus::Success {
                log::error!(
                    "FAILURE: status \"{}\" ({}) for wr_id {}",
                    c.status,
                    c.status.code(),
                    c.wr_id
                );
                if self.config.persistent && !self.interrupt.is_set() {
                    self.device.reset()?;
                }
                return Err(TaskError::Completion {
                    iteration,
                    wr_id: c.wr_id,
                    status: c.status,
                });
            }
            log::trace!("buffer head: {:02x?}", self.buffer.head(10));
        }

        write_ack(stream).map_err(|e| match e {
            ProtoError::Io(source) => TaskError::AckWrite { iteration, source },
            source => TaskError::Control { iteration, source },
        })
    }

    /// Poll in batches until at least one completion shows up.
    pub fn await_completion(&self) -> Result<Vec<Completion>, TaskError> {
        loop {
            let completions = self.device.poll_completions(POLL_BATCH)?;
            if !completions.is_empty() {
                return Ok(completions);
            }
            if self.interrupt.is_set() {
                return Err(TaskError::Interrupted);
            }
            std::hint::spin_loop();
        }
    }
}
