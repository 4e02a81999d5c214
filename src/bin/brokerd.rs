use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use anyhow::Context;
use clap::Parser;
use tinybus::broker::{Broker, DEFAULT_PORT, MAX_CONNECTIONS};

/// The tinybus topic broker.
///
/// Accepts subscribers and publishers on a single TCP port and fans each
/// published message out to the current subscribers of its topic. Delivery
/// is best-effort; a subscriber that stops draining its socket is evicted.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Port to listen on.
    #[arg(value_name = "PORT")]
    port: Option<u16>,

    /// Address to bind.
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    bind: IpAddr,

    /// Maximum number of concurrent connections.
    #[arg(long, default_value_t = MAX_CONNECTIONS)]
    max_connections: usize,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let addr = SocketAddr::new(args.bind, args.port.unwrap_or(DEFAULT_PORT));
    let mut broker =
        Broker::bind(addr).with_context(|| format!("failed to listen on {addr}"))?;
    broker.set_max_connections(args.max_connections);

    let stop = broker.stop_flag();
    signal_hook::flag::register(signal_hook::consts::SIGINT, stop.clone())
        .context("failed to install signal handler")?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, stop)
        .context("failed to install signal handler")?;

    broker.run().context("broker event loop failed")?;
    Ok(())
}
