//! One-sided transfers driven over the control plane.
//!
//! By default a responder and one or more initiator sessions share one soft
//! fabric and talk over loopback TCP. Built with the `verbs` feature,
//! `--role responder` or `--role initiator` runs a single side on a real
//! device, so the two sides can live on different hosts.
//!
//! Settings come from the `[responder]` and `[initiator]` sections of the
//! configuration file; command-line options override them.

use std::net::{IpAddr, Ipv4Addr};
use std::thread;

use clap::Parser;
use rdmatask::config::{Config, DebugMask};
use rdmatask::ctrl::{open_server_socket, TaskFlags};
use rdmatask::prelude::*;
use rdmatask::task::{InitiatorConfig, ResponderConfig};
use rdmatask::utils::Interrupt;
use tracing_subscriber::filter::LevelFilter;

/// Soft device addresses used when the configuration leaves them unspecified.
const SOFT_RESPONDER_ADDR: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
const SOFT_INITIATOR_ADDR: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));

#[derive(Parser, Debug)]
#[command(name = "onesided", about = "RDMA read/write tasks triggered over a socket")]
struct Args {
    /// Address of the responder's device.
    #[arg(short = 'a', long)]
    addr: Option<IpAddr>,

    /// Address of the initiator's device.
    #[arg(long)]
    client_addr: Option<IpAddr>,

    /// Host the initiator connects to.
    #[arg(long)]
    server: Option<String>,

    /// Control socket port; 0 picks a free one.
    #[arg(short, long)]
    port: Option<u16>,

    /// Transfer size in bytes.
    #[arg(short, long)]
    size: Option<usize>,

    /// Iterations per session.
    #[arg(short = 'n', long)]
    iters: Option<u64>,

    /// Number of scatter/gather segments; 0 sends one contiguous segment.
    #[arg(short = 'l', long = "sg-list-len")]
    num_sges: Option<usize>,

    /// Accelerator device ID for the responder's buffer.
    #[arg(short = 'u', long)]
    use_device: Option<u32>,

    /// Serve further sessions after the first one.
    #[arg(short = 'P', long)]
    persistent: bool,

    /// Number of initiator sessions to run.
    #[arg(long)]
    sessions: Option<usize>,

    /// Task flags: bit 0 selects RDMA read.
    #[arg(short = 't', long)]
    task_flags: Option<u32>,

    /// Debug mask: bit 0 general, bit 1 fast path.
    #[arg(short = 'D', long, default_value_t = 0)]
    debug: u32,

    /// Configuration file.
    #[arg(short, long)]
    config: Option<String>,

    /// Print the responder's report as JSON.
    #[arg(long)]
    json: bool,

    /// Run one side on a verbs device instead of both on the soft fabric.
    #[cfg(feature = "verbs")]
    #[arg(long, value_enum)]
    role: Option<Role>,

    /// Verbs device name, a regex; the first device if absent.
    #[cfg(feature = "verbs")]
    #[arg(short = 'd', long)]
    device: Option<String>,

    /// Verbs GID index.
    #[cfg(feature = "verbs")]
    #[arg(short = 'g', long, default_value_t = 0)]
    gid_index: u8,
}

#[cfg(feature = "verbs")]
#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum Role {
    Responder,
    Initiator,
}

impl Args {
    fn responder_config(&self, base: &ResponderConfig) -> ResponderConfig {
        let max_sessions = self.sessions.or(base.max_sessions);
        ResponderConfig {
            addr: self.addr.unwrap_or(base.addr),
            port: self.port.unwrap_or(base.port),
            size: self.size.unwrap_or(base.size),
            iters: self.iters.unwrap_or(base.iters),
            num_sges: self.num_sges.unwrap_or(base.num_sges),
            memory: self.use_device.map_or(base.memory, MemoryKind::Device),
            persistent: self.persistent || base.persistent || max_sessions.is_some_and(|n| n > 1),
            max_sessions,
        }
    }

    fn initiator_config(&self, base: &InitiatorConfig) -> InitiatorConfig {
        InitiatorConfig {
            addr: self.client_addr.unwrap_or(base.addr),
            server: self.server.clone().unwrap_or_else(|| base.server.clone()),
            port: self.port.unwrap_or(base.port),
            size: self.size.unwrap_or(base.size),
            iters: self.iters.unwrap_or(base.iters),
            task_flags: self.task_flags.map_or(base.task_flags, TaskFlags::from_bits),
        }
    }
}

fn init_logging(mask: DebugMask) {
    let level = match mask.level() {
        log::LevelFilter::Trace => LevelFilter::TRACE,
        log::LevelFilter::Debug => LevelFilter::DEBUG,
        _ => LevelFilter::INFO,
    };
    tracing_subscriber::fmt().with_max_level(level).init();
}

fn or_soft(addr: IpAddr, fallback: IpAddr) -> IpAddr {
    if addr.is_unspecified() {
        fallback
    } else {
        addr
    }
}

/// Both sides on one soft fabric.
fn run_soft(args: &Args, config: &Config) -> anyhow::Result<()> {
    let mut responder_config = args.responder_config(&config.responder);
    responder_config.addr = or_soft(responder_config.addr, SOFT_RESPONDER_ADDR);
    let mut initiator_config = args.initiator_config(&config.initiator);
    initiator_config.addr = or_soft(initiator_config.addr, SOFT_INITIATOR_ADDR);
    let sessions = responder_config.max_sessions.unwrap_or(1);
    responder_config.max_sessions = Some(sessions);

    let fabric = Fabric::new();
    fabric.add_nic("soft0", responder_config.addr)?;
    fabric.add_nic("soft1", initiator_config.addr)?;

    let listener = open_server_socket(responder_config.port)?;
    initiator_config.port = listener.local_addr()?.port();

    let interrupt = Interrupt::with_sigint()?;
    let mut responder = Responder::open(&fabric, responder_config, interrupt)?;
    let responder = thread::spawn(move || responder.serve(&listener));

    let initiator = Initiator::open(&fabric, initiator_config)?;
    for session in 0..sessions {
        let mut stream = initiator.connect()?;
        let report = initiator.run(&mut stream)?;
        println!("session {}: {}", session, report.stats);
    }

    let report = responder
        .join()
        .map_err(|_| anyhow::anyhow!("responder thread panicked"))??;
    if args.json {
        println!("{}", report.to_json()?);
    }
    println!("fabric: {:?}", fabric.stats());
    Ok(())
}

/// One side on a verbs device.
#[cfg(feature = "verbs")]
fn run_verbs(args: &Args, config: &Config, role: Role) -> anyhow::Result<()> {
    use rdmatask::verbs::VerbsDevice;

    let device = VerbsDevice::open(args.device.as_deref(), 1, args.gid_index)?;
    match role {
        Role::Responder => {
            let responder_config = args.responder_config(&config.responder);
            let listener = open_server_socket(responder_config.port)?;
            let interrupt = Interrupt::with_sigint()?;
            let mut responder = Responder::with_device(device, responder_config, interrupt)?;
            let report = responder.serve(&listener)?;
            if args.json {
                println!("{}", report.to_json()?);
            }
        }
        Role::Initiator => {
            let initiator = Initiator::with_device(device, args.initiator_config(&config.initiator))?;
            for session in 0..args.sessions.unwrap_or(1) {
                let mut stream = initiator.connect()?;
                let report = initiator.run(&mut stream)?;
                println!("session {}: {}", session, report.stats);
            }
        }
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = match &args.config {
        Some(path) => Config::load_toml(path)?,
        None => Config::default(),
    };
    init_logging(DebugMask(args.debug | config.log.debug_mask.0));

    #[cfg(feature = "verbs")]
    if let Some(role) = args.role {
        return run_verbs(&args, &config, role);
    }
    run_soft(&args, &config)
}
