//! Per-connection state: the input buffer and decoder on the read side, and
//! the output queue with interest toggling on the write side. Both services
//! drive their accepted sockets through this type.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::SocketAddr;

use mio::net::TcpStream;
use mio::{Interest, Registry, Token};

use crate::protocol::{Decoder, Frame, ProtocolError, Reply, Role};

/// Capacity of a connection's input buffer.
pub const INPUT_BUFFER_SIZE: usize = 16 * 1024;

const READ_CHUNK: usize = 4096;

const READ_WRITE: Interest = Interest::READABLE.add(Interest::WRITABLE);

/// What the read pump observed on the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// The socket would block; more bytes may arrive later.
    Open,
    /// The peer closed its end. Buffered bytes still deserve one final
    /// parser pass before the connection is dropped.
    Eof,
}

/// Bytes queued for a peer that its socket has not accepted yet.
///
/// The queue is a chain of chunks plus a send cursor into the front chunk,
/// so appending a frame never copies the existing backlog.
#[derive(Debug, Default)]
pub struct OutQueue {
    chunks: VecDeque<Vec<u8>>,
    cursor: usize,
}

impl OutQueue {
    /// Creates an empty queue.
    pub fn new() -> OutQueue {
        OutQueue::default()
    }

    /// True when nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Unsent bytes currently queued.
    pub fn pending(&self) -> usize {
        let mut total: usize = self.chunks.iter().map(Vec::len).sum();
        total -= self.cursor;
        total
    }

    /// Appends a chunk to the backlog.
    pub fn push(&mut self, chunk: Vec<u8>) {
        if !chunk.is_empty() {
            self.chunks.push_back(chunk);
        }
    }

    /// Writes as much of the backlog as the writer accepts. Returns true if
    /// the queue drained completely, false if the writer would block (or was
    /// interrupted, which is retried on the next readiness tick).
    pub fn write_to<W: Write>(&mut self, w: &mut W) -> io::Result<bool> {
        loop {
            let (written, complete) = match self.chunks.front() {
                None => return Ok(true),
                Some(front) => match w.write(&front[self.cursor..]) {
                    Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                    Ok(n) => (n, self.cursor + n == front.len()),
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => return Ok(false),
                    Err(err) => return Err(err),
                },
            };

            self.cursor += written;
            if complete {
                self.chunks.pop_front();
                self.cursor = 0;
            }
        }
    }
}

/// One accepted TCP endpoint.
pub struct Connection {
    socket: TcpStream,
    token: Token,
    peer: SocketAddr,

    role: Role,
    node_id: String,
    authenticated: bool,

    inbuf: Vec<u8>,
    decoder: Decoder,

    out: OutQueue,
    registered: Interest,
    closing: bool,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("token", &self.token)
            .field("peer", &self.peer)
            .field("role", &self.role)
            .finish()
    }
}

impl Connection {
    /// Wraps a freshly accepted socket. The caller still has to
    /// [`register`](Connection::register) it.
    pub fn new(socket: TcpStream, token: Token, peer: SocketAddr) -> Connection {
        Connection {
            socket,
            token,
            peer,
            role: Role::Unknown,
            node_id: String::new(),
            authenticated: false,
            inbuf: Vec::new(),
            decoder: Decoder::new(),
            out: OutQueue::new(),
            registered: Interest::READABLE,
            closing: false,
        }
    }

    /// The peer's address, for logging.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// The role the peer declared in its `HELLO`.
    pub fn role(&self) -> Role {
        self.role
    }

    /// The node id the peer declared in its `HELLO`.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Whether a `HELLO` has been accepted.
    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// Records the peer's `HELLO` and marks it authenticated.
    pub fn set_identity(&mut self, role: Role, node_id: String) {
        self.role = role;
        self.node_id = node_id;
        self.authenticated = true;
    }

    /// Registers the socket with read interest.
    pub fn register(&mut self, registry: &Registry) -> io::Result<()> {
        self.registered = Interest::READABLE;
        registry.register(&mut self.socket, self.token, Interest::READABLE)
    }

    /// Removes the socket from the poll set.
    pub fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        registry.deregister(&mut self.socket)
    }

    /// Reads everything currently available on the socket into the input
    /// buffer.
    pub fn fill(&mut self) -> Result<ReadOutcome, ProtocolError> {
        let mut scratch = [0u8; READ_CHUNK];
        loop {
            match self.socket.read(&mut scratch) {
                Ok(0) => return Ok(ReadOutcome::Eof),
                Ok(n) => {
                    if self.inbuf.len() + n > INPUT_BUFFER_SIZE {
                        return Err(ProtocolError::InputOverflow);
                    }
                    self.inbuf.extend_from_slice(&scratch[..n]);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(ReadOutcome::Open)
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Decodes the next frame out of the input buffer, if one is complete.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        self.decoder.feed(&mut self.inbuf)
    }

    /// Queues bytes for the peer. If nothing is pending, attempts a direct
    /// write first and stages only the remainder.
    pub fn send(&mut self, registry: &Registry, bytes: &[u8]) -> io::Result<()> {
        if self.out.is_empty() {
            let mut off = 0;
            while off < bytes.len() {
                match self.socket.write(&bytes[off..]) {
                    Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                    Ok(n) => off += n,
                    Err(err)
                        if err.kind() == io::ErrorKind::WouldBlock
                            || err.kind() == io::ErrorKind::Interrupted =>
                    {
                        break
                    }
                    Err(err) => return Err(err),
                }
            }
            if off < bytes.len() {
                self.out.push(bytes[off..].to_vec());
            }
        } else {
            self.out.push(bytes.to_vec());
        }

        self.update_interest(registry)
    }

    /// Sends a single-line reply.
    pub fn reply(&mut self, registry: &Registry, reply: Reply) -> io::Result<()> {
        self.send(registry, reply.wire())
    }

    /// Flushes the output queue as far as the socket allows. Returns true
    /// when the queue drained.
    pub fn flush(&mut self, registry: &Registry) -> io::Result<bool> {
        let drained = self.out.write_to(&mut self.socket)?;
        self.update_interest(registry)?;
        Ok(drained)
    }

    /// True while queued output has not been flushed.
    pub fn has_pending_output(&self) -> bool {
        !self.out.is_empty()
    }

    /// Marks the connection for a graceful close once its output drains.
    pub fn begin_close(&mut self) {
        self.closing = true;
    }

    /// True once a graceful close was requested and the output has drained.
    pub fn ready_to_close(&self) -> bool {
        self.closing && self.out.is_empty()
    }

    fn update_interest(&mut self, registry: &Registry) -> io::Result<()> {
        let want = if self.out.is_empty() {
            Interest::READABLE
        } else {
            READ_WRITE
        };
        if want != self.registered {
            registry.reregister(&mut self.socket, self.token, want)?;
            self.registered = want;
        }

        Ok(())
    }
}
