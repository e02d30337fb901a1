//! Message exchange over the connection manager: a server and a client on
//! one soft fabric, each sending the other its process ID.

use std::net::{IpAddr, SocketAddr};
use std::sync::mpsc::{self, Receiver};
use std::thread;

use clap::Parser;
use rdmatask::config::{Config, DebugMask};
use rdmatask::prelude::*;
use tracing_subscriber::filter::LevelFilter;

#[derive(Parser, Debug)]
#[command(name = "basic_cm", about = "RDMA CM server and client on a soft fabric")]
struct Args {
    /// Address of the soft device.
    #[arg(short = 'a', long, default_value = "10.0.0.1")]
    addr: IpAddr,

    /// Configuration file; its [server] section applies.
    #[arg(short, long)]
    config: Option<String>,

    /// Debug mask: bit 0 general, bit 1 fast path.
    #[arg(short = 'D', long, default_value_t = 0)]
    debug: u32,
}

fn init_logging(mask: DebugMask) {
    let level = match mask.level() {
        log::LevelFilter::Trace => LevelFilter::TRACE,
        log::LevelFilter::Debug => LevelFilter::DEBUG,
        _ => LevelFilter::INFO,
    };
    tracing_subscriber::fmt().with_max_level(level).init();
}

fn wait_for(rx: &Receiver<Notice>, done: impl Fn(&Notice) -> bool) -> anyhow::Result<()> {
    for notice in rx.iter() {
        println!("server: {:?}", notice);
        if let Notice::Fatal { reason } = &notice {
            anyhow::bail!("server failed: {}", reason);
        }
        if done(&notice) {
            return Ok(());
        }
    }
    anyhow::bail!("server stopped publishing notices")
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = match &args.config {
        Some(path) => Config::load_toml(path)?,
        None => Config::default(),
    };
    init_logging(DebugMask(args.debug | config.log.debug_mask.0));

    let fabric = Fabric::new();
    fabric.add_nic("soft0", args.addr)?;

    let (tx, rx) = mpsc::channel();
    let mut server = ConnectionServer::bind(&fabric, config.server.clone())?.with_notices(tx);
    let port = server.port();
    let events = server.event_channel().clone();
    let server = thread::spawn(move || -> anyhow::Result<()> {
        server.run()?;
        server.shutdown()?;
        Ok(())
    });

    let client = CmClient::connect(&fabric, None, SocketAddr::new(args.addr, port), &config.server)?;
    let message = client.wait_message()?;
    println!("client received: {}", message);

    // Tear down only after the server saw the client's message.
    wait_for(&rx, |n| matches!(n, Notice::Received { .. }))?;
    client.disconnect()?;
    wait_for(&rx, |n| matches!(n, Notice::Disconnected { .. }))?;

    events.close();
    server
        .join()
        .map_err(|_| anyhow::anyhow!("server thread panicked"))??;
    Ok(())
}
