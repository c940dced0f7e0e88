use std::fmt;

// all node identities are small positive integers shared with the config table
pub type NodeId = u32;

/// Distance (in hops) from the token holder at the moment a node was queued
pub type Position = u32;

/// Logical time in ticks. The driver advances one tick every `tick_duration_ms`.
pub type NtTime = u64;

/// Node seeded with the token at cluster start
pub const INITIAL_TOKEN_HOLDER: NodeId = 1;

// ============================================================================
// Wire Messages
// ============================================================================

/// Protocol messages. The sender is carried by the envelope, except for
/// `Request` and `RequestFailure` which name the node asking to be queued
/// (they are forwarded on its behalf).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    Request {
        requester: NodeId,
    },
    Commit {
        // chain of nodes ahead of the sender, most recent first
        predecessors: Vec<NodeId>,
        position: Position,
    },
    /// Token holder answering an ELECTION: the token is alive
    Ok,
    Token,
    Ping,
    Pong,
    AreYouAlive,
    IAmAlive,
    SearchPrev {
        position: Position,
    },
    AckSearchPrev {
        position: Position,
    },
    SearchQueue {
        cnt: u64,
    },
    AckSearchQueue {
        position: Position,
        next: Option<NodeId>,
    },
    RequestFailure {
        requester: NodeId,
    },
    DirectConnect,
    ConnectAck,
    Election,
    Regenerated,
}

impl Message {
    /// Wire tag of the message type
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Request { .. } => "REQUEST",
            Message::Commit { .. } => "COMMIT",
            Message::Ok => "OK",
            Message::Token => "TOKEN",
            Message::Ping => "PING",
            Message::Pong => "PONG",
            Message::AreYouAlive => "ARE_YOU_ALIVE",
            Message::IAmAlive => "I_AM_ALIVE",
            Message::SearchPrev { .. } => "SEARCH_PREV",
            Message::AckSearchPrev { .. } => "ACK_SEARCH_PREV",
            Message::SearchQueue { .. } => "SEARCH_QUEUE",
            Message::AckSearchQueue { .. } => "ACK_SEARCH_QUEUE",
            Message::RequestFailure { .. } => "REQUEST_FAILURE",
            Message::DirectConnect => "DIRECT_CONNECT",
            Message::ConnectAck => "CONNECT_ACK",
            Message::Election => "ELECTION",
            Message::Regenerated => "REGENERATED",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageEnvelope {
    pub sender: NodeId,
    pub receiver: NodeId,
    pub message: Message,
}

// ============================================================================
// Recovery Mechanisms
// ============================================================================

/// Escalation ladder used when a queued node loses contact with the queue
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Mechanism {
    /// M1: sequential ARE_YOU_ALIVE probe of the known predecessor chain
    PredecessorProbe,
    /// M2: broadcast SEARCH_PREV for the closest live node ahead
    PredecessorSearch,
    /// M3: broadcast SEARCH_QUEUE for any live queue member
    QueueSearch,
    /// M3 fallback: nobody answered, elect a node to regenerate the token
    Election,
}

impl fmt::Display for Mechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Mechanism::PredecessorProbe => "M1/probe",
            Mechanism::PredecessorSearch => "M2/search-prev",
            Mechanism::QueueSearch => "M3/search-queue",
            Mechanism::Election => "M3/election",
        };
        f.write_str(name)
    }
}

// ============================================================================
// Application Capability
// ============================================================================

/// Distributed mutual exclusion as seen by an application thread
pub trait MutualExclusion {
    /// Block until this node holds the token and is inside the critical section
    fn request_token(&self);

    /// Leave the critical section, handing the token to the successor if any
    fn release_token(&self);
}

// ============================================================================
// Event Logging System
// ============================================================================

/// Events emitted by a node at every send, receive and protocol notice point
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    MessageSent {
        peer: NodeId,
        kind: &'static str,
    },
    MessageReceived {
        peer: NodeId,
        kind: &'static str,
    },
    /// REQUEST sent on behalf of this node (fresh request or rejoin)
    RequestIssued {
        to: NodeId,
    },
    /// REQUEST passed along the `last` chain
    RequestForwarded {
        requester: NodeId,
        to: NodeId,
    },
    /// A requester was recorded as `next`
    SuccessorQueued {
        successor: NodeId,
    },
    /// The recorded successor was replaced by a node recovering from a failure
    SuccessorReplaced {
        previous: Option<NodeId>,
        successor: NodeId,
    },
    Committed {
        predecessor: NodeId,
        position: Position,
    },
    TokenAcquired {
        from: NodeId,
    },
    TokenPassed {
        to: NodeId,
    },
    CriticalSectionEntered {
        cnt: u64,
    },
    CriticalSectionLeft {
        cnt: u64,
    },
    PredecessorSuspected {
        predecessor: NodeId,
    },
    RecoveryStarted {
        mechanism: Mechanism,
    },
    /// A live provider accepted to re-commit this node
    Respliced {
        provider: NodeId,
    },
    TokenRegenerated,
    /// An idle token was dropped after another node regenerated
    TokenDiscarded {
        winner: NodeId,
    },
    DuplicateIgnored {
        peer: NodeId,
        kind: &'static str,
    },
    /// A COMMIT that could only come from a queue looping back on itself
    BrokenQueue {
        peer: NodeId,
        position: Position,
    },
    /// Queued and answered by the predecessor, yet no token for `waited` ticks
    RequestStalled {
        waited: NtTime,
    },
}

impl Event {
    /// Short event type used as the `type` field of structured log lines
    pub fn kind(&self) -> &'static str {
        match self {
            Event::MessageSent { .. } => "send",
            Event::MessageReceived { .. } => "receive",
            Event::RequestIssued { .. } => "request",
            Event::RequestForwarded { .. } => "forward",
            Event::SuccessorQueued { .. } => "enqueue",
            Event::SuccessorReplaced { .. } => "replace",
            Event::Committed { .. } => "commit",
            Event::TokenAcquired { .. } => "token",
            Event::TokenPassed { .. } => "pass",
            Event::CriticalSectionEntered { .. } => "enter",
            Event::CriticalSectionLeft { .. } => "leave",
            Event::PredecessorSuspected { .. } => "suspect",
            Event::RecoveryStarted { .. } => "recovery",
            Event::Respliced { .. } => "splice",
            Event::TokenRegenerated => "regenerate",
            Event::TokenDiscarded { .. } => "discard",
            Event::DuplicateIgnored { .. } => "duplicate",
            Event::BrokenQueue { .. } => "cycle",
            Event::RequestStalled { .. } => "stall",
        }
    }

    /// Remote node involved in the event, if any
    pub fn peer(&self) -> Option<NodeId> {
        match self {
            Event::MessageSent { peer, .. }
            | Event::MessageReceived { peer, .. }
            | Event::DuplicateIgnored { peer, .. }
            | Event::BrokenQueue { peer, .. } => Some(*peer),
            Event::RequestIssued { to } | Event::TokenPassed { to } => Some(*to),
            Event::RequestForwarded { requester, .. } => Some(*requester),
            Event::SuccessorQueued { successor } | Event::SuccessorReplaced { successor, .. } => {
                Some(*successor)
            }
            Event::Committed { predecessor, .. } => Some(*predecessor),
            Event::TokenAcquired { from } => Some(*from),
            Event::PredecessorSuspected { predecessor } => Some(*predecessor),
            Event::Respliced { provider } => Some(*provider),
            Event::TokenDiscarded { winner } => Some(*winner),
            Event::CriticalSectionEntered { .. }
            | Event::CriticalSectionLeft { .. }
            | Event::RecoveryStarted { .. }
            | Event::RequestStalled { .. }
            | Event::TokenRegenerated => None,
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::MessageSent { peer, kind } => write!(f, "send {} to {}", kind, peer),
            Event::MessageReceived { peer, kind } => write!(f, "receive {} from {}", kind, peer),
            Event::RequestIssued { to } => write!(f, "send request to {}", to),
            Event::RequestForwarded { requester, to } => {
                write!(f, "forward request of {} to {}", requester, to)
            }
            Event::SuccessorQueued { successor } => write!(f, "next is {}", successor),
            Event::SuccessorReplaced {
                previous: Some(previous),
                successor,
            } => write!(f, "next {} replaced by {}", previous, successor),
            Event::SuccessorReplaced {
                previous: None,
                successor,
            } => write!(f, "next is {} after failure", successor),
            Event::Committed {
                predecessor,
                position,
            } => write!(f, "committed behind {} at position {}", predecessor, position),
            Event::TokenAcquired { from } => write!(f, "receive token from {}", from),
            Event::TokenPassed { to } => write!(f, "send token to {}", to),
            Event::CriticalSectionEntered { cnt } => write!(f, "enter cs (entries so far {})", cnt),
            Event::CriticalSectionLeft { cnt } => write!(f, "leave cs (entries {})", cnt),
            Event::PredecessorSuspected { predecessor } => {
                write!(f, "no pong from predecessor {}", predecessor)
            }
            Event::RecoveryStarted { mechanism } => write!(f, "start {}", mechanism),
            Event::Respliced { provider } => write!(f, "re-spliced via {}", provider),
            Event::TokenRegenerated => f.write_str("regenerated token at position 0"),
            Event::TokenDiscarded { winner } => {
                write!(f, "discarded idle token, {} regenerated", winner)
            }
            Event::DuplicateIgnored { peer, kind } => {
                write!(f, "ignored duplicate {} from {}", kind, peer)
            }
            Event::BrokenQueue { peer, position } => {
                write!(f, "dropped looping commit from {} at position {}", peer, position)
            }
            Event::RequestStalled { waited } => {
                write!(f, "no token after {} ticks in the queue", waited)
            }
        }
    }
}

/// Trait for consuming events from a node
pub trait EventSink: Send {
    fn log(&mut self, time: NtTime, node: NodeId, event: Event);
}

/// No-op event sink for production use (zero overhead)
pub struct NoOpSink;

impl EventSink for NoOpSink {
    #[inline(always)]
    fn log(&mut self, _time: NtTime, _node: NodeId, _event: Event) {}
}
