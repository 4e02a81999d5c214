use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use tinybus::broker::MAX_CONNECTIONS;
use tinybus::gateway::{
    default_broker_addr, Gateway, GatewayConfig, OverflowPolicy, DEFAULT_LISTEN_PORT,
    DEFAULT_QUEUE_CAPACITY,
};

const STATS_INTERVAL: Duration = Duration::from_secs(10);

/// The tinybus publisher gateway.
///
/// Terminates publisher connections, validates their traffic, buffers
/// completed publishes in a bounded queue, and forwards them to the broker
/// over a single reconnecting link.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Port to listen on for publishers.
    #[arg(value_name = "PORT")]
    port: Option<u16>,

    /// Address to bind.
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    bind: IpAddr,

    /// Address of the upstream broker.
    #[arg(long, value_name = "ADDR")]
    broker: Option<SocketAddr>,

    /// Forwarding queue capacity, in messages.
    #[arg(long, default_value_t = DEFAULT_QUEUE_CAPACITY)]
    queue_capacity: usize,

    /// What to do with a new publish when the forwarding queue is full.
    #[arg(long, value_enum, default_value_t = PolicyArg::DropOldest)]
    overflow_policy: PolicyArg,

    /// Maximum number of concurrent publisher connections.
    #[arg(long, default_value_t = MAX_CONNECTIONS)]
    max_connections: usize,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum PolicyArg {
    /// Evict the eldest queued message; the publisher still sees OK.
    DropOldest,
    /// Refuse the new message with ERR QUEUE.
    RejectNew,
}

impl From<PolicyArg> for OverflowPolicy {
    fn from(arg: PolicyArg) -> OverflowPolicy {
        match arg {
            PolicyArg::DropOldest => OverflowPolicy::DropOldest,
            PolicyArg::RejectNew => OverflowPolicy::RejectNew,
        }
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let listen = SocketAddr::new(args.bind, args.port.unwrap_or(DEFAULT_LISTEN_PORT));
    let config = GatewayConfig {
        broker_addr: args.broker.unwrap_or_else(default_broker_addr),
        queue_capacity: args.queue_capacity,
        overflow_policy: args.overflow_policy.into(),
        max_connections: args.max_connections,
    };

    let mut gateway = Gateway::bind(listen, config)
        .with_context(|| format!("failed to listen on {listen}"))?;

    let stop = gateway.stop_flag();
    signal_hook::flag::register(signal_hook::consts::SIGINT, stop.clone())
        .context("failed to install signal handler")?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, stop.clone())
        .context("failed to install signal handler")?;

    // Operators watch queue depth, message loss, and link state from the
    // log; report whenever any of them change.
    let queue = gateway.queue().clone();
    let link = gateway.link().clone();
    thread::spawn(move || {
        let mut last = (0usize, 0u64, false);
        while !stop.load(Ordering::Relaxed) {
            thread::sleep(STATS_INTERVAL);
            let now = (queue.len(), queue.dropped(), link.is_connected());
            if now != last {
                log::info!(
                    "forwarding queue: {} queued, {} dropped, broker link {}",
                    now.0,
                    now.1,
                    if now.2 { "up" } else { "down" }
                );
                last = now;
            }
        }
    });

    gateway.run().context("gateway event loop failed")?;
    Ok(())
}
