//! The per-connection ingress state machine.
//!
//! The decoder is fed whatever bytes the read pump appended to the
//! connection's input buffer; it never touches the socket. Control lines and
//! length-prefixed payloads are interleaved on the same stream, so the
//! decoder tracks which of the three phases a connection is in: scanning for
//! a line terminator, accumulating the 4-byte length prefix of an announced
//! publish, or accumulating the payload itself.
//!
//! Feeding the same byte sequence in any partition into chunks yields the
//! same frames.

use byteorder::{ByteOrder, NetworkEndian};

use super::{Command, ProtocolError, LEN_PREFIX_SIZE, MAX_LINE};

/// One decoded unit of ingress traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A control line other than a `PUB` header.
    Control(Command),
    /// A completed publish: header, matching length prefix, and full payload.
    Message {
        /// The topic from the `PUB` header.
        topic: String,
        /// The payload bytes, exactly as received.
        payload: Vec<u8>,
    },
}

#[derive(Debug)]
enum State {
    AwaitLine,
    AwaitLength {
        topic: String,
        declared: u32,
        prefix: [u8; LEN_PREFIX_SIZE],
        have: usize,
    },
    AwaitPayload {
        topic: String,
        declared: u32,
        staged: Vec<u8>,
    },
}

/// The streaming decoder for one connection.
#[derive(Debug)]
pub struct Decoder {
    state: State,
}

impl Decoder {
    /// Creates a decoder in the await-line state.
    pub fn new() -> Decoder {
        Decoder {
            state: State::AwaitLine,
        }
    }

    /// True while no publish is in flight.
    pub fn is_idle(&self) -> bool {
        matches!(self.state, State::AwaitLine)
    }

    /// Consumes as many bytes from the front of `input` as the next frame
    /// needs. Returns `Ok(None)` when more bytes are required. A `PUB`
    /// header line produces no frame of its own; the frame appears once its
    /// payload completes.
    ///
    /// On error the connection is no longer parseable and must be closed.
    pub fn feed(&mut self, input: &mut Vec<u8>) -> Result<Option<Frame>, ProtocolError> {
        loop {
            match &mut self.state {
                State::AwaitLine => {
                    let Some(pos) = input.iter().position(|&b| b == b'\n') else {
                        if input.len() >= MAX_LINE {
                            return Err(ProtocolError::LineTooLong);
                        }
                        return Ok(None);
                    };
                    if pos >= MAX_LINE {
                        return Err(ProtocolError::LineTooLong);
                    }

                    let line = std::str::from_utf8(&input[..pos])
                        .map_err(|_| ProtocolError::InvalidEncoding)?;
                    let command = Command::parse(line)?;
                    input.drain(..=pos);

                    match command {
                        Command::Publish {
                            topic,
                            declared_len,
                        } => {
                            self.state = State::AwaitLength {
                                topic,
                                declared: declared_len,
                                prefix: [0; LEN_PREFIX_SIZE],
                                have: 0,
                            };
                        }
                        command => return Ok(Some(Frame::Control(command))),
                    }
                }
                State::AwaitLength {
                    topic,
                    declared,
                    prefix,
                    have,
                } => {
                    let take = (LEN_PREFIX_SIZE - *have).min(input.len());
                    prefix[*have..*have + take].copy_from_slice(&input[..take]);
                    *have += take;
                    input.drain(..take);
                    if *have < LEN_PREFIX_SIZE {
                        return Ok(None);
                    }

                    let got = NetworkEndian::read_u32(prefix);
                    if got != *declared {
                        return Err(ProtocolError::LengthMismatch {
                            declared: *declared,
                            prefix: got,
                        });
                    }

                    let next = State::AwaitPayload {
                        topic: std::mem::take(topic),
                        declared: *declared,
                        staged: Vec::with_capacity(got as usize),
                    };
                    self.state = next;
                }
                State::AwaitPayload {
                    topic,
                    declared,
                    staged,
                } => {
                    let need = *declared as usize - staged.len();
                    let take = need.min(input.len());
                    staged.extend_from_slice(&input[..take]);
                    input.drain(..take);
                    if staged.len() < *declared as usize {
                        return Ok(None);
                    }

                    let frame = Frame::Message {
                        topic: std::mem::take(topic),
                        payload: std::mem::take(staged),
                    };
                    self.state = State::AwaitLine;
                    return Ok(Some(frame));
                }
            }
        }
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Decoder::new()
    }
}
