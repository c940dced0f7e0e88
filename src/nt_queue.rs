use crate::nt_interface::{Event, Message, NodeId, Position};
use crate::nt_state::NodeState;

// ============================================================================
// Actions
// ============================================================================

/// Effects the queue engine and failure detector ask `NtNode` to perform
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeAction {
    Send { to: NodeId, message: Message },
    /// Send to every other node of the cluster
    Broadcast { message: Message },
    Notice(Event),
}

/// Result of `QueueEngine::request`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    /// Token held locally, the critical section is entered immediately
    Granted,
    /// REQUEST sent, waiting for COMMIT/TOKEN
    Issued,
    /// A request is already in flight
    Pending,
}

// ============================================================================
// Queue Engine
// ============================================================================

/// REQUEST/COMMIT/TOKEN handling over a single node's fragment of the queue.
///
/// The `last` pointers always lead one step closer to the most recent
/// requester known to this node, so forwarding a REQUEST along them reaches the
/// real tail, which serializes arrivals through its `next`.
#[derive(Debug, Clone)]
pub struct QueueEngine {
    state: NodeState,
}

impl QueueEngine {
    pub fn new(id: NodeId, k: usize) -> Self {
        Self {
            state: NodeState::new(id, k),
        }
    }

    pub fn state(&self) -> &NodeState {
        &self.state
    }

    pub fn id(&self) -> NodeId {
        self.state.id
    }

    pub fn request(&mut self, out: &mut Vec<NodeAction>) -> RequestOutcome {
        let s = &mut self.state;
        if s.in_cs {
            return RequestOutcome::Granted;
        }
        if s.has_token {
            s.has_request = true;
            self.enter_critical_section(out);
            return RequestOutcome::Granted;
        }
        if s.has_request {
            return RequestOutcome::Pending;
        }

        s.has_request = true;
        s.has_commit = false;
        if s.last != s.id {
            let to = s.last;
            out.push(NodeAction::Send {
                to,
                message: Message::Request { requester: s.id },
            });
            out.push(NodeAction::Notice(Event::RequestIssued { to }));
        }
        s.last = s.id;
        RequestOutcome::Issued
    }

    pub fn on_request(&mut self, requester: NodeId, out: &mut Vec<NodeAction>) {
        let s = &mut self.state;
        if requester == s.id {
            // our own request travelled back to us
            s.last = s.id;
            return;
        }

        if s.last != s.id {
            let to = s.last;
            out.push(NodeAction::Send {
                to,
                message: Message::Request { requester },
            });
            out.push(NodeAction::Notice(Event::RequestForwarded { requester, to }));
        } else if s.has_token && !s.in_cs {
            self.pass_token(requester, out);
        } else {
            s.next = Some(requester);
            s.commit_sent = false;
            out.push(NodeAction::Notice(Event::SuccessorQueued {
                successor: requester,
            }));
            self.commit_successor(out);
        }

        self.state.last = requester;
    }

    /// Returns true when the commit changed local state
    pub fn on_commit(
        &mut self,
        sender: NodeId,
        predecessors: &[NodeId],
        position: Position,
        out: &mut Vec<NodeAction>,
    ) -> bool {
        let s = &mut self.state;
        if s.has_token || !s.has_request {
            out.push(NodeAction::Notice(Event::DuplicateIgnored {
                peer: sender,
                kind: "COMMIT",
            }));
            return false;
        }
        if s.has_commit
            && s.predecessor == Some(sender)
            && s.position == Some(position)
            && s.predecessors == predecessors
        {
            out.push(NodeAction::Notice(Event::DuplicateIgnored {
                peer: sender,
                kind: "COMMIT",
            }));
            return false;
        }

        s.predecessor = Some(sender);
        s.predecessors = predecessors
            .iter()
            .copied()
            .filter(|&p| p != s.id)
            .take(s.k)
            .collect();
        s.position = Some(position);
        s.has_commit = true;
        out.push(NodeAction::Notice(Event::Committed {
            predecessor: sender,
            position,
        }));

        // a successor committed earlier holds a stale chain
        if s.next.is_some() {
            s.commit_sent = false;
            self.commit_successor(out);
        }
        true
    }

    /// Returns true when the token was taken (false for a duplicate)
    pub fn on_token(&mut self, sender: NodeId, out: &mut Vec<NodeAction>) -> bool {
        let s = &mut self.state;
        if s.has_token {
            out.push(NodeAction::Notice(Event::DuplicateIgnored {
                peer: sender,
                kind: "TOKEN",
            }));
            return false;
        }

        s.has_token = true;
        s.position = Some(0);
        s.clear_chain();
        out.push(NodeAction::Notice(Event::TokenAcquired { from: sender }));

        if s.has_request {
            self.enter_critical_section(out);
            // everyone behind us moved one step closer
            self.state.commit_sent = false;
            self.commit_successor(out);
        } else if let Some(next) = s.next.take() {
            self.pass_token(next, out);
        }
        true
    }

    /// Leave the critical section. Returns false when not inside it.
    pub fn release(&mut self, out: &mut Vec<NodeAction>) -> bool {
        let s = &mut self.state;
        if !s.in_cs {
            return false;
        }

        s.cnt += 1;
        s.in_cs = false;
        s.has_request = false;
        s.has_commit = false;
        s.position = None;
        s.clear_chain();
        out.push(NodeAction::Notice(Event::CriticalSectionLeft { cnt: s.cnt }));

        if let Some(next) = s.next.take() {
            self.pass_token(next, out);
        }
        true
    }

    /// A queued node lost its predecessor and asks this node to re-commit it
    pub fn on_request_failure(&mut self, requester: NodeId, out: &mut Vec<NodeAction>) {
        let s = &mut self.state;
        if requester == s.id || !s.is_queue_member() || s.is_ahead(requester) {
            return;
        }

        let previous = s.next.replace(requester);
        if s.last == s.id || previous.map_or(false, |p| p == s.last) {
            s.last = requester;
        }
        if previous != Some(requester) {
            out.push(NodeAction::Notice(Event::SuccessorReplaced {
                previous,
                successor: requester,
            }));
        }

        if s.has_token && !s.in_cs {
            s.next = None;
            self.pass_token(requester, out);
        } else {
            self.state.commit_sent = false;
            self.commit_successor(out);
        }
    }

    /// A recovering node chose us as its entry point into the queue. A tail
    /// takes it directly as successor; any other member routes it like a REQUEST.
    pub fn on_direct_connect(&mut self, requester: NodeId, out: &mut Vec<NodeAction>) {
        let s = &mut self.state;
        if requester == s.id || !s.is_queue_member() {
            return;
        }
        if s.next.is_some() {
            self.on_request(requester, out);
            return;
        }

        s.last = requester;
        if s.has_token && !s.in_cs {
            self.pass_token(requester, out);
        } else {
            s.next = Some(requester);
            s.commit_sent = false;
            out.push(NodeAction::Notice(Event::SuccessorQueued {
                successor: requester,
            }));
            self.commit_successor(out);
        }
    }

    /// Create a fresh token at position 0 after winning an election
    pub fn regenerate(&mut self, out: &mut Vec<NodeAction>) {
        let s = &mut self.state;
        s.has_token = true;
        s.position = Some(0);
        s.clear_chain();
        if s.next.is_none() {
            s.last = s.id;
        }
        out.push(NodeAction::Notice(Event::TokenRegenerated));

        if s.has_request {
            self.enter_critical_section(out);
            self.state.commit_sent = false;
            self.commit_successor(out);
        } else if let Some(next) = s.next.take() {
            self.pass_token(next, out);
        }
    }

    /// Drop an idle token after another node regenerated one
    pub fn discard_token(&mut self, winner: NodeId, out: &mut Vec<NodeAction>) -> bool {
        let s = &mut self.state;
        if !s.has_token || s.in_cs || s.next.is_some() {
            return false;
        }
        s.has_token = false;
        s.position = None;
        s.last = winner;
        out.push(NodeAction::Notice(Event::TokenDiscarded { winner }));
        true
    }

    /// Forget the current chain position before re-entering the queue
    /// (DIRECT_CONNECT or rejoin after regeneration)
    pub fn detach(&mut self) {
        let s = &mut self.state;
        s.position = None;
        s.has_commit = false;
        s.commit_sent = false;
        s.clear_chain();
        // a successor keeps routing towards our sub-queue
        if s.next.is_none() {
            s.last = s.id;
        }
    }

    /// Re-send REQUEST through `via` after a regeneration
    pub fn rejoin(&mut self, via: NodeId, out: &mut Vec<NodeAction>) {
        if !self.state.is_waiting() || self.state.has_token || via == self.state.id {
            return;
        }
        self.detach();
        out.push(NodeAction::Send {
            to: via,
            message: Message::Request {
                requester: self.state.id,
            },
        });
        out.push(NodeAction::Notice(Event::RequestIssued { to: via }));
    }

    /// Point routing at a node that regenerated the token
    pub fn follow(&mut self, winner: NodeId) {
        let s = &mut self.state;
        if !s.has_request && !s.has_token && winner != s.id {
            s.last = winner;
        }
    }

    fn enter_critical_section(&mut self, out: &mut Vec<NodeAction>) {
        let s = &mut self.state;
        s.in_cs = true;
        s.position = Some(0);
        out.push(NodeAction::Notice(Event::CriticalSectionEntered { cnt: s.cnt }));
    }

    fn pass_token(&mut self, to: NodeId, out: &mut Vec<NodeAction>) {
        let s = &mut self.state;
        s.has_token = false;
        s.position = None;
        s.clear_chain();
        out.push(NodeAction::Send {
            to,
            message: Message::Token,
        });
        out.push(NodeAction::Notice(Event::TokenPassed { to }));
    }

    /// COMMIT our successor once both it and our own position are known
    fn commit_successor(&mut self, out: &mut Vec<NodeAction>) {
        let s = &mut self.state;
        if s.commit_sent {
            return;
        }
        let (Some(next), Some(position)) = (s.next, s.queue_position()) else {
            return;
        };
        out.push(NodeAction::Send {
            to: next,
            message: Message::Commit {
                predecessors: s.successor_chain(),
                position: position.saturating_add(1),
            },
        });
        s.commit_sent = true;
    }
}
