//! The broker service: a single-threaded readiness loop that owns every
//! accepted connection, the topic table, and all output queues. No other
//! thread touches broker state, so there are no locks anywhere on the fanout
//! path.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mio::net::TcpListener;
use mio::{Events, Poll, Token};

use crate::connection::{Connection, ReadOutcome};
use crate::protocol::{self, Command, Frame, ProtocolError, Reply};
use crate::topics::TopicTable;

/// The port brokers listen on unless told otherwise.
pub const DEFAULT_PORT: u16 = 5000;

/// Default cap on concurrent connections; connections accepted beyond it are
/// refused and closed immediately.
pub const MAX_CONNECTIONS: usize = 10000;

const LISTENER: Token = Token(0);

// Client tokens start at 1024.
const FIRST_CLIENT_TOKEN: usize = 1024;

// Bounded so a stop request is noticed promptly even with no traffic.
const POLL_TIMEOUT: Duration = Duration::from_millis(1000);

/// The broker service.
pub struct Broker {
    listener: TcpListener,
    poll: Poll,
    conns: HashMap<Token, Connection>,
    topics: TopicTable,
    next_token: usize,
    max_connections: usize,
    stop: Arc<AtomicBool>,
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("connections", &self.conns.len())
            .field("topics", &self.topics.topic_count())
            .finish()
    }
}

impl Broker {
    /// Binds the listening socket and sets up the poll registration.
    pub fn bind(addr: SocketAddr) -> io::Result<Broker> {
        let mut listener = TcpListener::bind(addr)?;
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER, mio::Interest::READABLE)?;

        Ok(Broker {
            listener,
            poll,
            conns: HashMap::new(),
            topics: TopicTable::new(),
            next_token: FIRST_CLIENT_TOKEN,
            max_connections: MAX_CONNECTIONS,
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    /// The address the broker is listening on.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Overrides the concurrent-connection cap.
    pub fn set_max_connections(&mut self, limit: usize) {
        self.max_connections = limit;
    }

    /// A flag that makes [`run`](Broker::run) return when set. The loop
    /// notices it within one poll timeout.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    /// Runs the event loop until the stop flag is set, then closes every
    /// connection.
    pub fn run(&mut self) -> io::Result<()> {
        log::info!(
            "broker listening on {}",
            self.local_addr()
                .map_or_else(|_| "<unknown>".into(), |a| a.to_string())
        );

        let mut events = Events::with_capacity(1024);
        while !self.stop.load(Ordering::Relaxed) {
            if let Err(err) = self.poll.poll(&mut events, Some(POLL_TIMEOUT)) {
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER => self.accept_clients(),
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

        log::info!("broker stopping, closing {} connections", self.conns.len());
        let tokens: Vec<Token> = self.conns.keys().copied().collect();
        for token in tokens {
            self.close_conn(token, "shutdown");
        }

        Ok(())
    }

    fn accept_clients(&mut self) {
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

                    log::debug!("accepted {peer} as {token:?}");
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

            // Decode whatever arrived, even on EOF: an in-flight command
            // that fully landed is still honored.
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
                Frame::Message { topic, payload } => self.fanout(token, &topic, &payload),
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
            Command::Subscribe { topic } => {
                self.topics.subscribe(&topic, token);
                log::info!("{token:?} SUB {topic:?}");
                self.reply_or_close(token, Reply::Ok);
            }
            Command::Unsubscribe { topic } => {
                self.topics.unsubscribe(&topic, token);
                log::info!("{token:?} UNSUB {topic:?}");
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
            // PUB headers are consumed by the decoder and surface as
            // completed messages.
            Command::Publish { .. } => unreachable!(),
        }
    }

    fn fanout(&mut self, from: Token, topic: &str, payload: &[u8]) {
        let Some(subs) = self.topics.subscribers(topic) else {
            log::info!("publish to {topic:?}: no subscribers");
            return;
        };
        let targets: Vec<Token> = subs.iter().copied().collect();
        let frame = protocol::frame_delivery(payload);

        let mut delivered = 0;
        let mut failed = Vec::new();
        let registry = self.poll.registry();
        for id in targets {
            let Some(conn) = self.conns.get_mut(&id) else {
                failed.push(id);
                continue;
            };
            match conn.send(registry, &frame) {
                Ok(()) => delivered += 1,
                Err(err) => {
                    log::warn!("evicting subscriber {id:?}: {err}");
                    failed.push(id);
                }
            }
        }
        for id in failed {
            self.close_conn(id, "delivery failed");
        }

        log::info!(
            "published {topic:?} ({} bytes) from {from:?} to {delivered} subscribers",
            payload.len()
        );
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
        self.topics.remove_conn(token);
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
