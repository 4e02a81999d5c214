//! The broker link and the sender thread that owns it.
//!
//! The sender is the only writer to the broker socket. It blocks on the
//! forwarding queue, reconnects with jittered exponential back-off when the
//! link is down, and transmits each framed item in one critical section so
//! items never interleave on the wire. The broker sends nothing back to
//! forwarded publishes; anything that does arrive on the link socket is read
//! and discarded so the receive window can never fill and stall the link.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use rand::Rng;

use super::forward::ForwardQueue;

/// First reconnect delay after the link drops.
pub const RECONNECT_BASE_DELAY: Duration = Duration::from_secs(1);

const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(30);
const RECONNECT_JITTER_MS: u64 = 250;

// Back-off sleeps are sliced so a stop request is noticed quickly.
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// The gateway's single outbound connection to the broker.
pub struct BrokerLink {
    addr: SocketAddr,
    // Guards the socket so one framed item is transmitted without
    // interleaving, and so the connected/disconnected transition is atomic.
    stream: Mutex<Option<TcpStream>>,
}

impl std::fmt::Debug for BrokerLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerLink")
            .field("addr", &self.addr)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl BrokerLink {
    /// Creates a link in the disconnected state.
    pub fn new(addr: SocketAddr) -> BrokerLink {
        BrokerLink {
            addr,
            stream: Mutex::new(None),
        }
    }

    /// The broker's address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Whether the link currently holds a connected socket.
    pub fn is_connected(&self) -> bool {
        self.stream.lock().unwrap().is_some()
    }

    /// Establishes the connection if it is down.
    pub fn connect(&self) -> io::Result<()> {
        let mut guard = self.stream.lock().unwrap();
        if guard.is_none() {
            let stream = TcpStream::connect(self.addr)?;
            log::info!("broker link up: {}", self.addr);
            *guard = Some(stream);
        }

        Ok(())
    }

    /// Transmits one framed item atomically. On any failure the socket is
    /// closed and the link marked disconnected; the caller drops the item.
    pub fn transmit(&self, item: &[u8]) -> io::Result<()> {
        let mut guard = self.stream.lock().unwrap();
        let result = match guard.as_mut() {
            None => Err(io::ErrorKind::NotConnected.into()),
            Some(stream) => match discard_responses(stream) {
                Ok(()) => stream.write_all(item),
                Err(err) => Err(err),
            },
        };
        if result.is_err() {
            *guard = None;
        }

        result
    }

    /// Drops the socket, if any.
    pub fn disconnect(&self) {
        *self.stream.lock().unwrap() = None;
    }
}

// The broker never replies to forwarded publishes, but if it ever wrote
// anything we must not let it accumulate.
fn discard_responses(stream: &mut TcpStream) -> io::Result<()> {
    stream.set_nonblocking(true)?;
    let mut sink = [0u8; 1024];
    let result = loop {
        match stream.read(&mut sink) {
            Ok(0) => break Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(_) => continue,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => break Ok(()),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => break Err(err),
        }
    };
    stream.set_nonblocking(false)?;

    result
}

pub(super) struct Backoff {
    delay: Duration,
}

impl Backoff {
    pub(super) fn new() -> Backoff {
        Backoff {
            delay: RECONNECT_BASE_DELAY,
        }
    }

    pub(super) fn reset(&mut self) {
        self.delay = RECONNECT_BASE_DELAY;
    }

    /// The next delay to sleep: the current step plus jitter, doubling up to
    /// the cap.
    pub(super) fn next(&mut self) -> Duration {
        let jitter = Duration::from_millis(rand::rng().random_range(0..=RECONNECT_JITTER_MS));
        let delay = self.delay + jitter;
        self.delay = (self.delay * 2).min(RECONNECT_MAX_DELAY);
        delay
    }
}

/// Spawns the sender thread. It exits when the queue is closed or the stop
/// flag is set.
pub(super) fn spawn(
    queue: Arc<ForwardQueue>,
    link: Arc<BrokerLink>,
    stop: Arc<AtomicBool>,
) -> io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name("broker-sender".into())
        .spawn(move || sender_loop(&queue, &link, &stop))
}

fn sender_loop(queue: &ForwardQueue, link: &BrokerLink, stop: &AtomicBool) {
    let mut backoff = Backoff::new();

    'items: while let Some(item) = queue.pop() {
        // Hold the item across reconnect attempts; only a write failure
        // loses it.
        while !link.is_connected() {
            if stop.load(Ordering::Relaxed) {
                break 'items;
            }
            match link.connect() {
                Ok(()) => backoff.reset(),
                Err(err) => {
                    let delay = backoff.next();
                    log::warn!(
                        "cannot reach broker at {}: {err}; retrying in {:.1}s",
                        link.addr(),
                        delay.as_secs_f64()
                    );
                    sleep_with_stop(delay, stop);
                }
            }
        }
        if stop.load(Ordering::Relaxed) {
            break;
        }

        match link.transmit(&item) {
            Ok(()) => log::trace!("forwarded {} bytes to broker", item.len()),
            Err(err) => {
                // The link is down and the item is gone; the next item
                // drives the reconnect.
                log::warn!("broker write failed: {err}; message dropped");
            }
        }
    }

    link.disconnect();
    log::debug!("broker sender exiting");
}

fn sleep_with_stop(total: Duration, stop: &AtomicBool) {
    let deadline = Instant::now() + total;
    while !stop.load(Ordering::Relaxed) {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        thread::sleep(STOP_POLL_INTERVAL.min(deadline - now));
    }
}
