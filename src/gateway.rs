//! The gateway service: terminates publisher connections, validates their
//! traffic with the same decoder the broker uses, and hands completed
//! publishes to the forwarding queue. A second thread (the sender) owns the
//! broker socket; the event loop never blocks on the broker.

pub mod forward;
pub mod sender;

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mio::net::TcpListener;
use mio::{Events, Poll, Token};

use crate::broker;
use crate::connection::{Connection, ReadOutcome};
use crate::protocol::{self, Command, Frame, ProtocolError, Reply};

pub use forward::{ForwardQueue, OverflowPolicy, PushOutcome, DEFAULT_QUEUE_CAPACITY};
pub use sender::BrokerLink;

/// The port gateways listen on for publishers unless told otherwise.
pub const DEFAULT_LISTEN_PORT: u16 = 6000;

const LISTENER: Token = Token(0);
const FIRST_CLIENT_TOKEN: usize = 1024;
const POLL_TIMEOUT: Duration = Duration::from_millis(1000);

/// The upstream broker address gateways forward to unless told otherwise.
pub fn default_broker_addr() -> SocketAddr {
    ([127, 0, 0, 1], broker::DEFAULT_PORT).into()
}

/// Tunables for a [`Gateway`].
#[derive(Debug, Clone, Copy)]
pub struct GatewayConfig {
    /// Address of the upstream broker.
    pub broker_addr: SocketAddr,
    /// Forwarding queue capacity, in items.
    pub queue_capacity: usize,
    /// What to do with a publish when the queue is full.
    pub overflow_policy: OverflowPolicy,
    /// Cap on concurrent publisher connections.
    pub max_connections: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig {
            broker_addr: default_broker_addr(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            overflow_policy: OverflowPolicy::default(),
            max_connections: broker::MAX_CONNECTIONS,
        }
    }
}

/// The gateway service.
pub struct Gateway {
    listener: TcpListener,
    poll: Poll,
    conns: HashMap<Token, Connection>,
    next_token: usize,
    max_connections: usize,
    queue: Arc<ForwardQueue>,
    link: Arc<BrokerLink>,
    stop: Arc<AtomicBool>,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("connections", &self.conns.len())
            .field("queued", &self.queue.len())
            .field("link", &self.link)
            .finish()
    }
}

impl Gateway {
    /// Binds the publisher-facing listener and sets up the forwarding queue
    /// and broker link. The link stays down until the sender needs it.
    pub fn bind(listen: SocketAddr, config: GatewayConfig) -> io::Result<Gateway> {
        let mut listener = TcpListener::bind(listen)?;
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER, mio::Interest::READABLE)?;

        Ok(Gateway {
            listener,
            poll,
            conns: HashMap::new(),
            next_token: FIRST_CLIENT_TOKEN,
            max_connections: config.max_connections,
            queue: Arc::new(ForwardQueue::new(
                config.queue_capacity,
                config.overflow_policy,
            )),
            link: Arc::new(BrokerLink::new(config.broker_addr)),
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    /// The address publishers connect to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// The forwarding queue, for observability.
    pub fn queue(&self) -> &Arc<ForwardQueue> {
        &self.queue
    }

    /// The broker link, for observability.
    pub fn link(&self) -> &Arc<BrokerLink> {
        &self.link
    }

    /// A flag that makes [`run`](Gateway::run) return when set.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    /// Spawns the sender thread and runs the event loop until the stop flag
    /// is set, then closes every connection and drains the sender.
    pub fn run(&mut self) -> io::Result<()> {
        log::info!(
            "gateway listening on {}, forwarding to {}",
            self.local_addr()
                .map_or_else(|_| "<unknown>".into(), |a| a.to_string()),
            self.link.addr()
        );

        let sender = sender::spawn(self.queue.clone(), self.link.clone(), self.stop.clone())?;

        let mut events = Events::with_capacity(1024);
        while !self.stop.load(Ordering::Relaxed) {
            if let Err(err) = self.poll.poll(&mut events, Some(POLL_TIMEOUT)) {
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                self.stop.store(true, Ordering::Relaxed);
                self.queue.close();
                let _ = sender.join();
                return Err(err);
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER => self.accept_publishers(),
                    token => {
                        if event.is_error() {
                            self.close_conn(token, "socket error");
                            continue;
                        }
                        if event.is_readable() || event.is_read_closed() {
                            self.drive_readable(token);
                        }
                        if event.is_writable() {
                            self.drive_writable(token);
                        }
                    }
                }
            }
        }

        log::info!(
            "gateway stopping, closing {} connections ({} messages dropped in total)",
            self.conns.len(),
            self.queue.dropped()
        );
        let tokens: Vec<Token> = self.conns.keys().copied().collect();
        for token in tokens {
            self.close_conn(token, "shutdown");
        }
        self.queue.close();
        let _ = sender.join();

        Ok(())
    }

    fn accept_publishers(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((socket, peer)) => {
                    if self.conns.len() >= self.max_connections {
                        log::warn!("refusing {peer}: connection limit reached");
                        drop(socket);
                        continue;
                    }

                    let token = Token(self.next_token);
                    self.next_token += 1;

                    let mut conn = Connection::new(socket, token, peer);
                    if let Err(err) = conn.register(self.poll.registry()) {
                        log::error!("failed to register {peer}: {err}");
                        continue;
                    }

                    log::debug!("accepted publisher {peer} as {token:?}");
                    self.conns.insert(token, conn);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    log::error!("accept failed: {err}");
                    break;
                }
            }
        }
    }

    fn drive_readable(&mut self, token: Token) {
        let mut frames = Vec::new();
        let mut failure: Option<ProtocolError> = None;
        let mut eof = false;

        {
            let Some(conn) = self.conns.get_mut(&token) else {
                return;
            };
            match conn.fill() {
                Ok(ReadOutcome::Open) => {}
                Ok(ReadOutcome::Eof) => eof = true,
                Err(err) => failure = Some(err),
            }

            if failure.is_none() {
                loop {
                    match conn.next_frame() {
                        Ok(Some(frame)) => {
                            let bye = matches!(frame, Frame::Control(Command::Bye));
                            frames.push(frame);
                            if bye {
                                break;
                            }
                        }
                        Ok(None) => break,
                        Err(err) => {
                            failure = Some(err);
                            break;
                        }
                    }
                }
            }
        }

        for frame in frames {
            if !self.conns.contains_key(&token) {
                return;
            }
            match frame {
                Frame::Control(command) => self.handle_command(token, command),
                Frame::Message { topic, payload } => self.forward(token, &topic, &payload),
            }
        }

        if let Some(err) = failure {
            self.fail_conn(token, err);
            return;
        }
        if eof {
            self.close_conn(token, "peer closed");
        }
    }

    fn drive_writable(&mut self, token: Token) {
        let registry = self.poll.registry();
        let result = match self.conns.get_mut(&token) {
            None => return,
            Some(conn) => conn.flush(registry),
        };

        match result {
            Ok(true) => {
                let parting = self.conns.get(&token).map(Connection::ready_to_close);
                if parting == Some(true) {
                    self.close_conn(token, "bye");
                }
            }
            Ok(false) => {}
            Err(err) => {
                log::warn!("flush to {token:?} failed: {err}");
                self.close_conn(token, "write failed");
            }
        }
    }

    fn handle_command(&mut self, token: Token, command: Command) {
        match command {
            Command::Hello { role, node_id } => {
                if let Some(conn) = self.conns.get_mut(&token) {
                    if conn.is_authenticated() {
                        log::debug!("{} re-identified: role={role} node={node_id}", conn.peer());
                    } else {
                        log::info!("{} HELLO role={role} node={node_id}", conn.peer());
                    }
                    conn.set_identity(role, node_id);
                }
                self.reply_or_close(token, Reply::Ok);
            }
            Command::Ping => self.reply_or_close(token, Reply::Pong),
            Command::Bye => {
                self.reply_or_close(token, Reply::Ok);
                let drained = self.conns.get_mut(&token).map(|conn| {
                    conn.begin_close();
                    conn.ready_to_close()
                });
                if drained == Some(true) {
                    self.close_conn(token, "bye");
                }
            }
            // The gateway terminates publishers; there is nothing here to
            // subscribe to.
            Command::Subscribe { .. } | Command::Unsubscribe { .. } => {
                log::warn!("{token:?} sent a subscription command to the gateway");
                self.reply_or_close(token, Reply::Proto);
                self.close_conn(token, "protocol error");
            }
            Command::Publish { .. } => unreachable!(),
        }
    }

    fn forward(&mut self, token: Token, topic: &str, payload: &[u8]) {
        let item = protocol::frame_publish(topic, payload);
        match self.queue.push(item) {
            PushOutcome::Queued => {
                log::debug!(
                    "queued publish to {topic:?} ({} bytes) from {token:?}",
                    payload.len()
                );
                self.reply_or_close(token, Reply::Ok);
            }
            PushOutcome::DroppedOldest => {
                log::warn!(
                    "forwarding queue full; dropped eldest message ({} dropped in total)",
                    self.queue.dropped()
                );
                self.reply_or_close(token, Reply::Ok);
            }
            PushOutcome::Rejected => {
                log::warn!("forwarding queue full; rejecting publish from {token:?}");
                self.reply_or_close(token, Reply::Queue);
            }
        }
    }

    fn reply_or_close(&mut self, token: Token, reply: Reply) {
        let registry = self.poll.registry();
        let Some(conn) = self.conns.get_mut(&token) else {
            return;
        };
        if let Err(err) = conn.reply(registry, reply) {
            log::warn!("write to {token:?} failed: {err}");
            self.close_conn(token, "write failed");
        }
    }

    fn fail_conn(&mut self, token: Token, err: ProtocolError) {
        log::warn!("protocol failure on {token:?}: {err}");
        if let Some(reply) = err.reply() {
            let registry = self.poll.registry();
            if let Some(conn) = self.conns.get_mut(&token) {
                let _ = conn.reply(registry, reply);
            }
        }
        self.close_conn(token, "protocol error");
    }

    fn close_conn(&mut self, token: Token, reason: &str) {
        let Some(mut conn) = self.conns.remove(&token) else {
            return;
        };
        if conn.has_pending_output() {
            log::debug!("discarding undelivered output for {}", conn.peer());
        }
        log::info!(
            "closing {} role={} node={:?} ({reason})",
            conn.peer(),
            conn.role(),
            conn.node_id()
        );
        let _ = conn.deregister(self.poll.registry());
    }
}
