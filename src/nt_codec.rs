//! Text wire format: one message per line, space separated fields.
//!
//! ```text
//! REQUEST <requesterID>
//! COMMIT <senderID> <pred_1> ... <pred_k> <position>
//! SEARCH_PREV <senderID> <position>
//! ACK_SEARCH_QUEUE <senderID> <position> <next>
//! ```
//!
//! Unused predecessor slots and a missing `next` are written as `-1`.
//! Decoding is strict: any payload that does not match the grammar exactly
//! (field count, numeric range, padding order) is rejected.

use std::fmt;

use crate::nt_interface::{Message, MessageEnvelope, NodeId, Position};

const NONE_FIELD: &str = "-1";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Blank line
    Empty,
    /// First field is not a known message type
    UnknownType(String),
    /// Wrong number of fields for the message type
    FieldCount {
        kind: &'static str,
        expected: usize,
        found: usize,
    },
    /// Node ids are positive integers
    InvalidNodeId(String),
    /// Positions and counters are non-negative integers
    InvalidNumber(String),
    /// A real predecessor appears after `-1` padding
    PaddingOrder,
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::Empty => f.write_str("empty message"),
            CodecError::UnknownType(t) => write!(f, "unknown message type '{}'", t),
            CodecError::FieldCount {
                kind,
                expected,
                found,
            } => write!(f, "{} expects {} fields, found {}", kind, expected, found),
            CodecError::InvalidNodeId(v) => write!(f, "invalid node id '{}'", v),
            CodecError::InvalidNumber(v) => write!(f, "invalid number '{}'", v),
            CodecError::PaddingOrder => f.write_str("predecessor listed after -1 padding"),
        }
    }
}

impl std::error::Error for CodecError {}

/// Codec for a cluster running with fault tolerance `k` (COMMIT arity)
#[derive(Debug, Clone, Copy)]
pub struct WireCodec {
    k: usize,
}

impl WireCodec {
    pub fn new(k: usize) -> Self {
        Self { k }
    }

    pub fn encode(&self, envelope: &MessageEnvelope) -> String {
        let kind = envelope.message.kind();
        let sender = envelope.sender;
        match &envelope.message {
            Message::Request { requester } | Message::RequestFailure { requester } => {
                format!("{} {}", kind, requester)
            }
            Message::Commit {
                predecessors,
                position,
            } => {
                let mut line = format!("{} {}", kind, sender);
                for i in 0..self.k {
                    match predecessors.get(i) {
                        Some(p) => line.push_str(&format!(" {}", p)),
                        None => {
                            line.push(' ');
                            line.push_str(NONE_FIELD);
                        }
                    }
                }
                line.push_str(&format!(" {}", position));
                line
            }
            Message::SearchPrev { position } | Message::AckSearchPrev { position } => {
                format!("{} {} {}", kind, sender, position)
            }
            Message::SearchQueue { cnt } => format!("{} {} {}", kind, sender, cnt),
            Message::AckSearchQueue { position, next } => {
                let next = next.map_or_else(|| NONE_FIELD.to_string(), |n| n.to_string());
                format!("{} {} {} {}", kind, sender, position, next)
            }
            Message::Ok
            | Message::Token
            | Message::Ping
            | Message::Pong
            | Message::AreYouAlive
            | Message::IAmAlive
            | Message::DirectConnect
            | Message::ConnectAck
            | Message::Election
            | Message::Regenerated => format!("{} {}", kind, sender),
        }
    }

    /// Parse one line received by `receiver`
    pub fn decode(&self, line: &str, receiver: NodeId) -> Result<MessageEnvelope, CodecError> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let (&tag, rest) = fields.split_first().ok_or(CodecError::Empty)?;

        let (sender, message) = match tag {
            "REQUEST" => {
                let [id] = expect_fields::<1>("REQUEST", rest)?;
                let requester = parse_node_id(id)?;
                (requester, Message::Request { requester })
            }
            "REQUEST_FAILURE" => {
                let [id] = expect_fields::<1>("REQUEST_FAILURE", rest)?;
                let requester = parse_node_id(id)?;
                (requester, Message::RequestFailure { requester })
            }
            "COMMIT" => self.decode_commit(rest)?,
            "SEARCH_PREV" | "ACK_SEARCH_PREV" => {
                let kind = if tag == "SEARCH_PREV" {
                    "SEARCH_PREV"
                } else {
                    "ACK_SEARCH_PREV"
                };
                let [id, pos] = expect_fields::<2>(kind, rest)?;
                let position = parse_number::<Position>(pos)?;
                let message = if tag == "SEARCH_PREV" {
                    Message::SearchPrev { position }
                } else {
                    Message::AckSearchPrev { position }
                };
                (parse_node_id(id)?, message)
            }
            "SEARCH_QUEUE" => {
                let [id, cnt] = expect_fields::<2>("SEARCH_QUEUE", rest)?;
                let cnt = parse_number::<u64>(cnt)?;
                (parse_node_id(id)?, Message::SearchQueue { cnt })
            }
            "ACK_SEARCH_QUEUE" => {
                let [id, pos, next] = expect_fields::<3>("ACK_SEARCH_QUEUE", rest)?;
                let position = parse_number::<Position>(pos)?;
                let next = if next == NONE_FIELD {
                    None
                } else {
                    Some(parse_node_id(next)?)
                };
                (parse_node_id(id)?, Message::AckSearchQueue { position, next })
            }
            other => {
                let message = match other {
                    "OK" => Message::Ok,
                    "TOKEN" => Message::Token,
                    "PING" => Message::Ping,
                    "PONG" => Message::Pong,
                    "ARE_YOU_ALIVE" => Message::AreYouAlive,
                    "I_AM_ALIVE" => Message::IAmAlive,
                    "DIRECT_CONNECT" => Message::DirectConnect,
                    "CONNECT_ACK" => Message::ConnectAck,
                    "ELECTION" => Message::Election,
                    "REGENERATED" => Message::Regenerated,
                    _ => return Err(CodecError::UnknownType(other.to_string())),
                };
                let [id] = expect_fields::<1>(message.kind(), rest)?;
                (parse_node_id(id)?, message)
            }
        };

        Ok(MessageEnvelope {
            sender,
            receiver,
            message,
        })
    }

    fn decode_commit(&self, rest: &[&str]) -> Result<(NodeId, Message), CodecError> {
        let expected = self.k + 2;
        if rest.len() != expected {
            return Err(CodecError::FieldCount {
                kind: "COMMIT",
                expected,
                found: rest.len(),
            });
        }

        let sender = parse_node_id(rest[0])?;
        let mut predecessors = Vec::with_capacity(self.k);
        let mut padded = false;
        for field in &rest[1..=self.k] {
            if *field == NONE_FIELD {
                padded = true;
            } else if padded {
                return Err(CodecError::PaddingOrder);
            } else {
                predecessors.push(parse_node_id(field)?);
            }
        }
        let position = parse_number::<Position>(rest[self.k + 1])?;

        Ok((
            sender,
            Message::Commit {
                predecessors,
                position,
            },
        ))
    }
}

fn expect_fields<'a, const N: usize>(
    kind: &'static str,
    rest: &[&'a str],
) -> Result<[&'a str; N], CodecError> {
    <[&str; N]>::try_from(rest).map_err(|_| CodecError::FieldCount {
        kind,
        expected: N,
        found: rest.len(),
    })
}

fn parse_node_id(field: &str) -> Result<NodeId, CodecError> {
    match field.parse::<NodeId>() {
        Ok(id) if id > 0 => Ok(id),
        _ => Err(CodecError::InvalidNodeId(field.to_string())),
    }
}

fn parse_number<T: std::str::FromStr>(field: &str) -> Result<T, CodecError> {
    field
        .parse::<T>()
        .map_err(|_| CodecError::InvalidNumber(field.to_string()))
}
