use std::io::{Read, Write};
use std::net::{IpAddr, Ipv4Addr, TcpStream};

use serde::{Deserialize, Serialize};

use super::device::{OneSidedDevice, RdmaDevice, TaskBuffer};
use super::{SessionReport, TaskError};
use crate::ctrl::{open_client_socket, read_ack, ControlPackage, ProtoError, TaskFlags};
use crate::fabric::Fabric;
use crate::rdma::mr::MemoryKind;
use crate::utils::RunTimer;

/// Initiator settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InitiatorConfig {
    /// Address of the local device.
    pub addr: IpAddr,

    /// Host name or address of the responder.
    pub server: String,
    pub port: u16,
    pub size: usize,
    pub iters: u64,
    pub task_flags: TaskFlags,
}

impl Default for InitiatorConfig {
    fn default() -> Self {
        Self {
            addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            server: "127.0.0.1".to_owned(),
            port: 18515,
            size: 4096,
            iters: 1000,
            task_flags: TaskFlags::default(),
        }
    }
}

/// Active side of the transfer loop: owns the buffer the responder reads
/// from or writes into.
pub struct Initiator<D: OneSidedDevice = RdmaDevice> {
    device: D,
    buffer: D::Buffer,
    package: ControlPackage,
    config: InitiatorConfig,
}

impl Initiator<RdmaDevice> {
    /// Open the configured device and register a host buffer on it.
    pub fn open(fabric: &Fabric, config: InitiatorConfig) -> Result<Self, TaskError> {
        let device = RdmaDevice::open(fabric, config.addr)?;
        Self::with_device(device, config)
    }
}

impl<D: OneSidedDevice> Initiator<D> {
    /// Register a host buffer of the configured size on `device`.
    pub fn with_device(device: D, config: InitiatorConfig) -> Result<Self, TaskError> {
        let buffer = device.alloc_buffer(config.size, MemoryKind::Host)?;
        Self::new(device, buffer, config)
    }

    pub fn new(device: D, buffer: D::Buffer, config: InitiatorConfig) -> Result<Self, TaskError> {
        let desc = device.descriptor(&buffer)?;
        let package = ControlPackage::new(desc, config.task_flags);
        Ok(Self {
            device,
            buffer,
            package,
            config,
        })
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn buffer(&self) -> &D::Buffer {
        &self.buffer
    }

    pub fn package(&self) -> &ControlPackage {
        &self.package
    }

    /// Connect the control stream to the configured responder.
    pub fn connect(&self) -> Result<TcpStream, TaskError> {
        log::info!(
            "connecting to remote server \"{}:{}\"",
            self.config.server,
            self.config.port
        );
        Ok(open_client_socket(&self.config.server, self.config.port)?)
    }

    /// Send `iters` requests, waiting for each acknowledgment.
    pub fn run<S: Read + Write>(&self, stream: &mut S) -> Result<SessionReport, TaskError> {
        let wire = self.package.encode()?;
        log::info!("starting data transfer ({} iters)", self.config.iters);

        let timer = RunTimer::start();
        for iteration in 0..self.config.iters {
            log::trace!(
                "send message {}: buffer desc \"{}\" with task opt \"{}\"",
                iteration,
                self.package.desc,
                self.package.flags
            );
            stream
                .write_all(&wire)
                .map_err(|e| TaskError::Control {
                    iteration,
                    source: ProtoError::Io(e),
                })?;
            read_ack(stream).map_err(|source| TaskError::Control { iteration, source })?;
            log::trace!("received ack {}, buffer head: {:02x?}", iteration, self.buffer.head(10));
        }

        let stats = timer.finish(self.config.size, self.config.iters);
        log::info!("{}", stats);
        Ok(SessionReport {
            iterations: self.config.iters,
            stats,
        })
    }
}
