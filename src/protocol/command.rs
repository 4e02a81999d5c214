//! The control-line grammar: commands and their single-line replies.

use super::{ProtocolError, MAX_NODE_ID, MAX_PAYLOAD, MAX_TOPIC};

/// The role a peer declares in its `HELLO`.
///
/// Roles are informational: any `HELLO` is accepted, and a role string the
/// service does not recognize is tolerated and stored as [`Role::Unknown`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// No `HELLO` seen yet, or an unrecognized role string.
    #[default]
    Unknown,
    /// A peer that publishes messages.
    Publisher,
    /// An upstream gateway forwarding on behalf of publishers.
    Gateway,
    /// A peer that subscribes to topics.
    Subscriber,
}

impl Role {
    fn from_token(token: &str) -> Role {
        match token {
            "PUBLISHER" => Role::Publisher,
            "GATEWAY" => Role::Gateway,
            "SUBSCRIBER" => Role::Subscriber,
            _ => Role::Unknown,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Role::Unknown => "unknown",
            Role::Publisher => "publisher",
            Role::Gateway => "gateway",
            Role::Subscriber => "subscriber",
        };
        f.write_str(s)
    }
}

/// A parsed control line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `HELLO <role> <node-id>`: introduce the peer and mark it
    /// authenticated.
    Hello {
        /// The declared role.
        role: Role,
        /// The peer's node identifier.
        node_id: String,
    },
    /// `SUB <topic>`: add the connection to the topic's subscriber set.
    Subscribe {
        /// The topic to subscribe to.
        topic: String,
    },
    /// `UNSUB <topic>`: remove the connection from the topic's set.
    Unsubscribe {
        /// The topic to unsubscribe from.
        topic: String,
    },
    /// `PUB <topic> <declared-length>`: announce an inbound payload.
    Publish {
        /// The topic to publish to.
        topic: String,
        /// The declared payload length, in (0, [`MAX_PAYLOAD`]].
        declared_len: u32,
    },
    /// `PING`: liveness probe.
    Ping,
    /// `BYE`: request a graceful close after the reply is flushed.
    Bye,
}

impl Command {
    /// Parses one control line (without its `\n` terminator). Arguments are
    /// whitespace-separated tokens; anything after the recognized arguments
    /// is ignored.
    pub fn parse(line: &str) -> Result<Command, ProtocolError> {
        let mut tokens = line.split_whitespace();
        let keyword = tokens
            .next()
            .ok_or_else(|| ProtocolError::UnknownCommand(String::new()))?;

        match keyword {
            "HELLO" => {
                let role = tokens
                    .next()
                    .ok_or(ProtocolError::MissingArgument("role"))?;
                let node_id = tokens
                    .next()
                    .ok_or(ProtocolError::MissingArgument("node id"))?;
                if node_id.len() > MAX_NODE_ID {
                    return Err(ProtocolError::NodeIdTooLong);
                }

                Ok(Command::Hello {
                    role: Role::from_token(role),
                    node_id: node_id.to_owned(),
                })
            }
            "SUB" => Ok(Command::Subscribe {
                topic: parse_topic(tokens.next())?,
            }),
            "UNSUB" => Ok(Command::Unsubscribe {
                topic: parse_topic(tokens.next())?,
            }),
            "PUB" => {
                let topic = parse_topic(tokens.next())?;
                let len_token = tokens
                    .next()
                    .ok_or(ProtocolError::MissingArgument("payload length"))?;
                let declared_len: i64 = len_token
                    .parse()
                    .map_err(|_| ProtocolError::MalformedLength(len_token.to_owned()))?;
                if declared_len <= 0 || declared_len > MAX_PAYLOAD as i64 {
                    return Err(ProtocolError::PayloadOutOfRange(declared_len));
                }

                Ok(Command::Publish {
                    topic,
                    declared_len: declared_len as u32,
                })
            }
            "PING" => Ok(Command::Ping),
            "BYE" => Ok(Command::Bye),
            _ => Err(ProtocolError::UnknownCommand(keyword.to_owned())),
        }
    }
}

fn parse_topic(token: Option<&str>) -> Result<String, ProtocolError> {
    let topic = token.ok_or(ProtocolError::MissingArgument("topic"))?;
    if topic.len() > MAX_TOPIC {
        return Err(ProtocolError::TopicTooLong);
    }

    Ok(topic.to_owned())
}

/// A single-line reply to a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    /// The command was accepted.
    Ok,
    /// Reply to `PING`.
    Pong,
    /// Malformed or unknown command.
    Proto,
    /// Declared payload length out of range.
    Overflow,
    /// Length prefix disagreed with the declared length.
    Len,
    /// An internal resource failure.
    Internal,
    /// The forwarding queue refused the publish.
    Queue,
}

impl Reply {
    /// The reply's wire encoding, including the `\n` terminator.
    pub fn wire(&self) -> &'static [u8] {
        match self {
            Reply::Ok => b"OK\n",
            Reply::Pong => b"PONG\n",
            Reply::Proto => b"ERR PROTO\n",
            Reply::Overflow => b"ERR OVERFLOW\n",
            Reply::Len => b"ERR LEN\n",
            Reply::Internal => b"ERR INTERNAL\n",
            Reply::Queue => b"ERR QUEUE\n",
        }
    }
}
