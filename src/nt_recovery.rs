//! Failure detection and recovery for queued nodes.
//!
//! A queued node pings its predecessor every `ping_interval` ticks and expects
//! a PONG within `2 * msg_timeout`. On silence it escalates:
//!
//! 1. **M1** probes the known predecessors one by one with ARE_YOU_ALIVE and
//!    asks the first live one to re-commit it (REQUEST_FAILURE).
//! 2. **M2** broadcasts SEARCH_PREV and re-commits behind the closest live node
//!    ahead of it.
//! 3. **M3** broadcasts SEARCH_QUEUE and splices into whatever live queue
//!    answers. When nobody answers the token is presumed lost: requesters
//!    broadcast ELECTION and the lowest id among them regenerates the token.
//!
//! Each step waits `msg_timeout` ticks before falling through to the next one.
//! Dead and slow nodes are indistinguishable here; a request is never dropped,
//! only delayed until it re-enters a chain or a token is regenerated.
//!
//! Only the node that owes us the token answers our PING. A chain that closes
//! on itself has no token in it, and everyone in it still hears a PONG, so two
//! more triggers lead straight to an election: a COMMIT that proves the queue
//! loops, and a request that stays queued for `request_timeout` ticks per node
//! of the cluster. A live holder answers the election with OK and the requester
//! re-enters through it.

use std::cmp::Reverse;

use hashbrown::HashMap;

use crate::nt_config::ProtocolConfig;
use crate::nt_interface::{Event, Mechanism, Message, NodeId, NtTime, Position};
use crate::nt_queue::{NodeAction, QueueEngine, RequestOutcome};
use crate::nt_state::NodeState;

/// Where a node stands in the detection/escalation state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryPhase {
    /// Not waiting for the token
    Idle,
    /// REQUEST sent, no COMMIT/TOKEN yet
    AwaitingCommit { deadline: NtTime },
    /// Committed, next PING due at `next_ping`
    Healthy { next_ping: NtTime },
    AwaitingPong { deadline: NtTime },
    /// M1: ARE_YOU_ALIVE sent to `probe_targets[index]`
    Probing { index: usize, deadline: NtTime },
    /// REQUEST_FAILURE sent to `provider`
    AwaitingRecommit { provider: NodeId, deadline: NtTime },
    /// M2: collecting ACK_SEARCH_PREV
    SearchingPredecessor { deadline: NtTime },
    /// M3: collecting ACK_SEARCH_QUEUE
    SearchingQueue { deadline: NtTime },
    /// DIRECT_CONNECT sent to `provider`
    AwaitingConnect { provider: NodeId, deadline: NtTime },
    /// ELECTION broadcast, collecting competing candidates
    Electing { deadline: NtTime },
    /// Lost the election, waiting for REGENERATED
    AwaitingRegeneration { deadline: NtTime },
}

impl RecoveryPhase {
    /// Normal operation: not running any recovery mechanism
    pub fn is_stable(&self) -> bool {
        matches!(
            self,
            RecoveryPhase::Idle | RecoveryPhase::Healthy { .. } | RecoveryPhase::AwaitingPong { .. }
        )
    }
}

pub struct FailureDetector {
    config: ProtocolConfig,
    phase: RecoveryPhase,

    probe_targets: Vec<NodeId>,
    prev_acks: HashMap<NodeId, Position>,
    queue_acks: HashMap<NodeId, (Position, Option<NodeId>)>,

    /// ELECTION senders and when they were heard
    candidates: HashMap<NodeId, NtTime>,

    /// Position before the chain was detached, used to skip nodes behind us
    last_position: Option<Position>,

    /// Longest a queued request may go without the token
    stall_window: NtTime,
    stall_deadline: Option<NtTime>,
}

impl FailureDetector {
    pub fn new(config: ProtocolConfig, cluster_size: usize) -> Self {
        let stall_window = config.request_timeout * cluster_size.max(1) as NtTime;
        Self {
            config,
            phase: RecoveryPhase::Idle,
            probe_targets: Vec::new(),
            prev_acks: HashMap::new(),
            queue_acks: HashMap::new(),
            candidates: HashMap::new(),
            last_position: None,
            stall_window,
            stall_deadline: None,
        }
    }

    pub fn phase(&self) -> RecoveryPhase {
        self.phase
    }

    pub fn on_request(&mut self, now: NtTime, outcome: RequestOutcome) {
        match outcome {
            RequestOutcome::Issued => {
                self.phase = RecoveryPhase::AwaitingCommit {
                    deadline: now + self.config.request_timeout,
                };
                self.stall_deadline = Some(now + self.stall_window);
            }
            RequestOutcome::Granted => {
                self.reset();
                self.stall_deadline = None;
            }
            RequestOutcome::Pending => {}
        }
    }

    /// A COMMIT from the current predecessor was received (new or repeated)
    pub fn on_committed(&mut self, now: NtTime, state: &NodeState) {
        if !state.is_waiting() || state.has_token {
            return;
        }
        self.last_position = state.position;
        self.phase = RecoveryPhase::Healthy { next_ping: now };
    }

    pub fn on_token_acquired(&mut self) {
        self.reset();
        self.stall_deadline = None;
    }

    pub fn on_released(&mut self) {
        self.reset();
        self.last_position = None;
        self.stall_deadline = None;
    }

    /// A COMMIT was dropped because accepting it would close the queue on
    /// itself. Nothing in such a loop holds the token, so elect right away.
    pub fn on_broken_queue(
        &mut self,
        now: NtTime,
        sender: NodeId,
        position: Position,
        state: &NodeState,
        out: &mut Vec<NodeAction>,
    ) {
        out.push(NodeAction::Notice(Event::BrokenQueue {
            peer: sender,
            position,
        }));
        let electing = matches!(
            self.phase,
            RecoveryPhase::Electing { .. } | RecoveryPhase::AwaitingRegeneration { .. }
        );
        if state.is_waiting() && !state.has_token && !electing {
            self.last_position = state.position.or(self.last_position);
            self.start_election(now, out);
        }
    }

    fn reset(&mut self) {
        self.phase = RecoveryPhase::Idle;
        self.probe_targets.clear();
        self.prev_acks.clear();
        self.queue_acks.clear();
    }

    // ========================================================================
    // Messages
    // ========================================================================

    pub fn handle(
        &mut self,
        now: NtTime,
        sender: NodeId,
        message: &Message,
        engine: &mut QueueEngine,
        out: &mut Vec<NodeAction>,
    ) {
        let state = engine.state();
        let member = state.is_queue_member();

        match message {
            Message::Ping => {
                // a node we already served, or never queued, gets silence
                if member && state.next == Some(sender) {
                    send(out, sender, Message::Pong);
                }
            }
            Message::Pong => {
                if matches!(self.phase, RecoveryPhase::AwaitingPong { .. })
                    && state.predecessor == Some(sender)
                {
                    self.phase = RecoveryPhase::Healthy {
                        next_ping: now + self.config.ping_interval,
                    };
                }
            }
            Message::AreYouAlive => {
                if member && !state.is_ahead(sender) {
                    send(out, sender, Message::IAmAlive);
                }
            }
            Message::IAmAlive => {
                if let RecoveryPhase::Probing { index, .. } = self.phase {
                    if self.probe_targets.get(index) == Some(&sender) {
                        self.ask_recommit(now, sender, state.id, out);
                    }
                }
            }
            Message::SearchPrev { position } => {
                if member && self.phase.is_stable() {
                    if let Some(own) = state.queue_position() {
                        if own < *position {
                            send(out, sender, Message::AckSearchPrev { position: own });
                        }
                    }
                }
            }
            Message::AckSearchPrev { position } => {
                if matches!(self.phase, RecoveryPhase::SearchingPredecessor { .. }) {
                    self.prev_acks.insert(sender, *position);
                }
            }
            Message::SearchQueue { .. } => {
                if member && self.phase.is_stable() {
                    if let Some(position) = state.queue_position() {
                        let next = state.next;
                        send(out, sender, Message::AckSearchQueue { position, next });
                    }
                }
            }
            Message::AckSearchQueue { position, next } => {
                if matches!(self.phase, RecoveryPhase::SearchingQueue { .. }) {
                    let behind = state
                        .position
                        .or(self.last_position)
                        .map_or(false, |own| *position >= own);
                    if state.next != Some(sender) && (!behind || *next == Some(state.id)) {
                        self.queue_acks.insert(sender, (*position, *next));
                    }
                }
            }
            Message::DirectConnect => {
                if member {
                    send(out, sender, Message::ConnectAck);
                    engine.on_direct_connect(sender, out);
                }
            }
            Message::ConnectAck => {
                if let RecoveryPhase::AwaitingConnect { provider, .. } = self.phase {
                    if provider == sender {
                        out.push(NodeAction::Notice(Event::Respliced { provider }));
                        self.phase = RecoveryPhase::AwaitingCommit {
                            deadline: now + self.config.request_timeout,
                        };
                    }
                }
            }
            Message::Election => {
                if state.has_token {
                    send(out, sender, Message::Ok);
                } else {
                    self.candidates.insert(sender, now);
                }
            }
            Message::Ok => {
                if matches!(
                    self.phase,
                    RecoveryPhase::Electing { .. } | RecoveryPhase::AwaitingRegeneration { .. }
                ) {
                    // the sender holds the token: queue up behind it again
                    engine.rejoin(sender, out);
                    self.phase = RecoveryPhase::AwaitingCommit {
                        deadline: now + self.config.request_timeout,
                    };
                }
            }
            Message::Regenerated => self.on_regenerated(now, sender, engine, out),
            Message::Request { .. }
            | Message::Commit { .. }
            | Message::Token
            | Message::RequestFailure { .. } => {}
        }
    }

    fn on_regenerated(
        &mut self,
        now: NtTime,
        winner: NodeId,
        engine: &mut QueueEngine,
        out: &mut Vec<NodeAction>,
    ) {
        self.candidates.clear();
        if winner == engine.id() {
            return;
        }

        let state = engine.state();
        if state.has_token {
            engine.discard_token(winner, out);
        } else if state.is_waiting() {
            if !self.phase.is_stable() {
                engine.rejoin(winner, out);
                self.phase = RecoveryPhase::AwaitingCommit {
                    deadline: now + self.config.request_timeout,
                };
            }
        } else {
            engine.follow(winner);
        }
    }

    // ========================================================================
    // Timers
    // ========================================================================

    pub fn tick(&mut self, now: NtTime, engine: &mut QueueEngine, out: &mut Vec<NodeAction>) {
        let state = engine.state();
        if !state.is_waiting() || state.has_token {
            if self.phase != RecoveryPhase::Idle {
                self.reset();
            }
            self.stall_deadline = None;
            self.prune_candidates(now);
            return;
        }

        if let Some(deadline) = self.stall_deadline {
            let queued = matches!(
                self.phase,
                RecoveryPhase::Healthy { .. } | RecoveryPhase::AwaitingPong { .. }
            );
            if queued && now >= deadline {
                out.push(NodeAction::Notice(Event::RequestStalled {
                    waited: self.stall_window,
                }));
                self.stall_deadline = Some(now + self.stall_window);
                self.last_position = state.position.or(self.last_position);
                self.start_election(now, out);
                return;
            }
        }

        match self.phase {
            RecoveryPhase::Idle => {
                // waiting without a timer, e.g. after a discarded commit
                self.phase = RecoveryPhase::AwaitingCommit {
                    deadline: now + self.config.request_timeout,
                };
                self.stall_deadline.get_or_insert(now + self.stall_window);
            }
            RecoveryPhase::AwaitingCommit { deadline } => {
                if now >= deadline {
                    self.start_queue_search(now, state, out);
                }
            }
            RecoveryPhase::Healthy { next_ping } => {
                if now >= next_ping {
                    match state.predecessor {
                        Some(predecessor) => {
                            send(out, predecessor, Message::Ping);
                            self.phase = RecoveryPhase::AwaitingPong {
                                deadline: now + self.config.pong_timeout(),
                            };
                        }
                        None => {
                            self.phase = RecoveryPhase::Healthy {
                                next_ping: now + self.config.ping_interval,
                            };
                        }
                    }
                }
            }
            RecoveryPhase::AwaitingPong { deadline } => {
                if now >= deadline {
                    if let Some(predecessor) = state.predecessor {
                        out.push(NodeAction::Notice(Event::PredecessorSuspected { predecessor }));
                    }
                    self.start_probe(now, state, out);
                }
            }
            RecoveryPhase::Probing { index, deadline } => {
                if now >= deadline {
                    self.advance_probe(now, index + 1, state, out);
                }
            }
            RecoveryPhase::AwaitingRecommit { deadline, .. }
            | RecoveryPhase::AwaitingConnect { deadline, .. }
            | RecoveryPhase::AwaitingRegeneration { deadline } => {
                if now >= deadline {
                    self.start_queue_search(now, state, out);
                }
            }
            RecoveryPhase::SearchingPredecessor { deadline } => {
                if now >= deadline {
                    self.finish_predecessor_search(now, state, out);
                }
            }
            RecoveryPhase::SearchingQueue { deadline } => {
                if now >= deadline {
                    self.finish_queue_search(now, engine, out);
                }
            }
            RecoveryPhase::Electing { deadline } => {
                if now >= deadline {
                    self.finish_election(now, engine, out);
                }
            }
        }
    }

    // ===== M1 =====

    fn start_probe(&mut self, now: NtTime, state: &NodeState, out: &mut Vec<NodeAction>) {
        out.push(NodeAction::Notice(Event::RecoveryStarted {
            mechanism: Mechanism::PredecessorProbe,
        }));
        self.probe_targets = state.probe_targets();
        self.advance_probe(now, 0, state, out);
    }

    fn advance_probe(
        &mut self,
        now: NtTime,
        index: usize,
        state: &NodeState,
        out: &mut Vec<NodeAction>,
    ) {
        match self.probe_targets.get(index) {
            Some(&target) => {
                send(out, target, Message::AreYouAlive);
                self.phase = RecoveryPhase::Probing {
                    index,
                    deadline: now + self.config.msg_timeout,
                };
            }
            None if state.position.is_some() => self.start_predecessor_search(now, state, out),
            None => self.start_queue_search(now, state, out),
        }
    }

    fn ask_recommit(&mut self, now: NtTime, provider: NodeId, id: NodeId, out: &mut Vec<NodeAction>) {
        send(out, provider, Message::RequestFailure { requester: id });
        out.push(NodeAction::Notice(Event::Respliced { provider }));
        self.phase = RecoveryPhase::AwaitingRecommit {
            provider,
            deadline: now + self.config.msg_timeout,
        };
    }

    // ===== M2 =====

    fn start_predecessor_search(&mut self, now: NtTime, state: &NodeState, out: &mut Vec<NodeAction>) {
        let Some(position) = state.position else {
            self.start_queue_search(now, state, out);
            return;
        };
        out.push(NodeAction::Notice(Event::RecoveryStarted {
            mechanism: Mechanism::PredecessorSearch,
        }));
        self.prev_acks.clear();
        out.push(NodeAction::Broadcast {
            message: Message::SearchPrev { position },
        });
        self.phase = RecoveryPhase::SearchingPredecessor {
            deadline: now + self.config.msg_timeout,
        };
    }

    fn finish_predecessor_search(&mut self, now: NtTime, state: &NodeState, out: &mut Vec<NodeAction>) {
        // closest node ahead: largest position, lowest id on ties
        let closest = self
            .prev_acks
            .iter()
            .max_by_key(|&(&node, &position)| (position, Reverse(node)))
            .map(|(&node, _)| node);
        self.prev_acks.clear();

        match closest {
            Some(provider) => self.ask_recommit(now, provider, state.id, out),
            None => self.start_queue_search(now, state, out),
        }
    }

    // ===== M3 =====

    fn start_queue_search(&mut self, now: NtTime, state: &NodeState, out: &mut Vec<NodeAction>) {
        out.push(NodeAction::Notice(Event::RecoveryStarted {
            mechanism: Mechanism::QueueSearch,
        }));
        self.last_position = state.position.or(self.last_position);
        self.queue_acks.clear();
        out.push(NodeAction::Broadcast {
            message: Message::SearchQueue { cnt: state.cnt },
        });
        self.phase = RecoveryPhase::SearchingQueue {
            deadline: now + self.config.msg_timeout,
        };
    }

    fn finish_queue_search(&mut self, now: NtTime, engine: &mut QueueEngine, out: &mut Vec<NodeAction>) {
        let id = engine.id();
        let acks: Vec<(NodeId, Position, Option<NodeId>)> = self
            .queue_acks
            .drain()
            .map(|(node, (position, next))| (node, position, next))
            .collect();

        // still recorded as someone's successor: only the COMMIT was lost
        if let Some(owner) = acks
            .iter()
            .filter(|(_, _, next)| *next == Some(id))
            .map(|(node, _, _)| *node)
            .min()
        {
            self.ask_recommit(now, owner, id, out);
            return;
        }

        let responders: Vec<NodeId> = acks.iter().map(|(node, _, _)| *node).collect();

        // a live tail splices us directly behind itself
        if let Some(tail) = best_provider(acks.iter().filter(|(_, _, next)| next.is_none())) {
            self.connect(now, tail, engine, out);
            return;
        }

        // a member whose successor is silent: take that successor's place
        if let Some(provider) = best_provider(
            acks.iter()
                .filter(|(_, _, next)| next.map_or(false, |n| !responders.contains(&n))),
        ) {
            engine.detach();
            self.ask_recommit(now, provider, id, out);
            return;
        }

        if let Some(provider) = best_provider(acks.iter()) {
            self.connect(now, provider, engine, out);
            return;
        }

        self.start_election(now, out);
    }

    fn connect(
        &mut self,
        now: NtTime,
        provider: NodeId,
        engine: &mut QueueEngine,
        out: &mut Vec<NodeAction>,
    ) {
        engine.detach();
        send(out, provider, Message::DirectConnect);
        self.phase = RecoveryPhase::AwaitingConnect {
            provider,
            deadline: now + self.config.msg_timeout,
        };
    }

    fn start_election(&mut self, now: NtTime, out: &mut Vec<NodeAction>) {
        out.push(NodeAction::Notice(Event::RecoveryStarted {
            mechanism: Mechanism::Election,
        }));
        out.push(NodeAction::Broadcast {
            message: Message::Election,
        });
        self.phase = RecoveryPhase::Electing {
            deadline: now + self.config.election_window,
        };
    }

    fn finish_election(&mut self, now: NtTime, engine: &mut QueueEngine, out: &mut Vec<NodeAction>) {
        self.prune_candidates(now);
        let id = engine.id();
        let winner = self
            .candidates
            .keys()
            .copied()
            .chain(std::iter::once(id))
            .min()
            .unwrap_or(id);

        if winner == id {
            engine.regenerate(out);
            out.push(NodeAction::Broadcast {
                message: Message::Regenerated,
            });
            self.candidates.clear();
            self.reset();
        } else {
            self.phase = RecoveryPhase::AwaitingRegeneration {
                deadline: now + self.config.pong_timeout() + self.config.election_window,
            };
        }
    }

    fn prune_candidates(&mut self, now: NtTime) {
        let horizon = 2 * self.config.election_window;
        self.candidates
            .retain(|_, heard| now.saturating_sub(*heard) <= horizon);
    }
}

/// Highest position wins, lowest id on ties
fn best_provider<'a>(
    acks: impl Iterator<Item = &'a (NodeId, Position, Option<NodeId>)>,
) -> Option<NodeId> {
    acks.max_by_key(|&&(node, position, _)| (position, Reverse(node)))
        .map(|&(node, _, _)| node)
}

fn send(out: &mut Vec<NodeAction>, to: NodeId, message: Message) {
    out.push(NodeAction::Send { to, message });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ProtocolConfig {
        ProtocolConfig {
            fault_tolerance: 2,
            msg_timeout: 3,
            ping_interval: 2,
            request_timeout: 12,
            election_window: 3,
            tick_duration_ms: 10,
        }
    }

    fn sends(out: &[NodeAction]) -> Vec<(NodeId, Message)> {
        out.iter()
            .filter_map(|a| match a {
                NodeAction::Send { to, message } => Some((*to, message.clone())),
                _ => None,
            })
            .collect()
    }

    fn broadcasts(out: &[NodeAction]) -> Vec<Message> {
        out.iter()
            .filter_map(|a| match a {
                NodeAction::Broadcast { message } => Some(message.clone()),
                _ => None,
            })
            .collect()
    }

    /// Node 4 queued at position 3 behind 3, with chain [2, 1]
    fn queued_engine() -> QueueEngine {
        let mut engine = QueueEngine::new(4, 2);
        let mut out = Vec::new();
        engine.request(&mut out);
        engine.on_commit(3, &[2, 1], 3, &mut out);
        engine
    }

    #[test]
    fn test_only_successor_gets_pong() {
        let mut detector = FailureDetector::new(config(), 5);
        let mut out = Vec::new();

        let mut outsider = QueueEngine::new(3, 2);
        detector.handle(0, 4, &Message::Ping, &mut outsider, &mut out);
        assert!(out.is_empty());

        let mut holder = QueueEngine::new(1, 2);
        holder.request(&mut out);
        holder.on_request(4, &mut out);
        out.clear();
        detector.handle(0, 4, &Message::Ping, &mut holder, &mut out);
        assert_eq!(sends(&out), vec![(4, Message::Pong)]);

        // 2 was already handed the token, the holder owes it nothing
        out.clear();
        detector.handle(0, 2, &Message::Ping, &mut holder, &mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn test_node_ahead_gets_no_alive_answer() {
        let mut detector = FailureDetector::new(config(), 5);
        let mut engine = queued_engine();
        let mut out = Vec::new();

        detector.handle(0, 2, &Message::AreYouAlive, &mut engine, &mut out);
        assert!(out.is_empty());
        detector.handle(0, 5, &Message::AreYouAlive, &mut engine, &mut out);
        assert_eq!(sends(&out), vec![(5, Message::IAmAlive)]);
    }

    #[test]
    fn test_stalled_request_starts_election() {
        // 3 nodes: a queued request may wait 36 ticks
        let mut detector = FailureDetector::new(config(), 3);
        let mut engine = QueueEngine::new(3, 2);
        let mut out = Vec::new();

        let outcome = engine.request(&mut out);
        detector.on_request(0, outcome);
        engine.on_commit(2, &[1], 2, &mut out);
        detector.on_committed(1, engine.state());

        for now in 2..36 {
            out.clear();
            detector.tick(now, &mut engine, &mut out);
            if sends(&out).contains(&(2, Message::Ping)) {
                detector.handle(now, 2, &Message::Pong, &mut engine, &mut out);
            }
            assert!(broadcasts(&out).is_empty());
        }

        out.clear();
        detector.tick(36, &mut engine, &mut out);
        assert_eq!(broadcasts(&out), vec![Message::Election]);
        assert!(out.contains(&NodeAction::Notice(Event::RequestStalled { waited: 36 })));
        assert!(matches!(detector.phase(), RecoveryPhase::Electing { .. }));
    }

    #[test]
    fn test_broken_queue_starts_election() {
        let mut detector = FailureDetector::new(config(), 5);
        let mut engine = queued_engine();
        let mut out = Vec::new();
        detector.on_committed(0, engine.state());

        detector.on_broken_queue(1, 2, 12, engine.state(), &mut out);
        assert_eq!(broadcasts(&out), vec![Message::Election]);
        assert!(matches!(detector.phase(), RecoveryPhase::Electing { .. }));

        // a second looping commit does not restart the round
        out.clear();
        detector.on_broken_queue(2, 2, 13, engine.state(), &mut out);
        assert!(broadcasts(&out).is_empty());
    }

    #[test]
    fn test_ok_rejoins_through_holder() {
        let mut detector = FailureDetector::new(config(), 5);
        let mut engine = QueueEngine::new(4, 2);
        let mut out = Vec::new();

        let outcome = engine.request(&mut out);
        detector.on_request(0, outcome);
        detector.tick(12, &mut engine, &mut out);
        detector.tick(15, &mut engine, &mut out);
        assert!(matches!(detector.phase(), RecoveryPhase::Electing { .. }));
        out.clear();

        detector.handle(16, 2, &Message::Ok, &mut engine, &mut out);
        assert_eq!(sends(&out), vec![(2, Message::Request { requester: 4 })]);
        assert_eq!(
            detector.phase(),
            RecoveryPhase::AwaitingCommit { deadline: 28 }
        );
    }

    #[test]
    fn test_healthy_ping_cycle() {
        let mut detector = FailureDetector::new(config(), 5);
        let mut engine = queued_engine();
        let mut out = Vec::new();

        detector.on_committed(0, engine.state());
        detector.tick(1, &mut engine, &mut out);
        assert_eq!(sends(&out), vec![(3, Message::Ping)]);
        assert_eq!(detector.phase(), RecoveryPhase::AwaitingPong { deadline: 7 });

        detector.handle(2, 3, &Message::Pong, &mut engine, &mut out);
        assert_eq!(detector.phase(), RecoveryPhase::Healthy { next_ping: 4 });
    }

    #[test]
    fn test_escalates_through_probe_then_search() {
        let mut detector = FailureDetector::new(config(), 5);
        let mut engine = queued_engine();
        let mut out = Vec::new();

        detector.on_committed(0, engine.state());
        detector.tick(1, &mut engine, &mut out);
        out.clear();

        // pong deadline passes: probe 3, then 2, then 1
        detector.tick(7, &mut engine, &mut out);
        assert_eq!(sends(&out), vec![(3, Message::AreYouAlive)]);
        out.clear();
        detector.tick(10, &mut engine, &mut out);
        assert_eq!(sends(&out), vec![(2, Message::AreYouAlive)]);
        out.clear();
        detector.tick(13, &mut engine, &mut out);
        assert_eq!(sends(&out), vec![(1, Message::AreYouAlive)]);
        out.clear();

        // nobody answered: M2
        detector.tick(16, &mut engine, &mut out);
        assert_eq!(broadcasts(&out), vec![Message::SearchPrev { position: 3 }]);
        out.clear();

        detector.handle(17, 1, &Message::AckSearchPrev { position: 0 }, &mut engine, &mut out);
        detector.handle(17, 2, &Message::AckSearchPrev { position: 1 }, &mut engine, &mut out);
        detector.tick(19, &mut engine, &mut out);
        assert_eq!(sends(&out), vec![(2, Message::RequestFailure { requester: 4 })]);
        assert!(matches!(
            detector.phase(),
            RecoveryPhase::AwaitingRecommit { provider: 2, .. }
        ));
    }

    #[test]
    fn test_alive_predecessor_in_probe_is_asked_to_recommit() {
        let mut detector = FailureDetector::new(config(), 5);
        let mut engine = queued_engine();
        let mut out = Vec::new();

        detector.on_committed(0, engine.state());
        detector.tick(1, &mut engine, &mut out);
        detector.tick(7, &mut engine, &mut out);
        detector.tick(10, &mut engine, &mut out);
        out.clear();

        // 2 is the current probe target
        detector.handle(11, 2, &Message::IAmAlive, &mut engine, &mut out);
        assert_eq!(sends(&out), vec![(2, Message::RequestFailure { requester: 4 })]);

        // its COMMIT restores the heartbeat
        engine.on_commit(2, &[1], 2, &mut out);
        detector.on_committed(12, engine.state());
        assert_eq!(detector.phase(), RecoveryPhase::Healthy { next_ping: 12 });
    }

    #[test]
    fn test_search_prev_answered_only_from_ahead() {
        let mut detector = FailureDetector::new(config(), 5);
        let mut engine = queued_engine();
        let mut out = Vec::new();

        detector.handle(0, 5, &Message::SearchPrev { position: 2 }, &mut engine, &mut out);
        assert!(out.is_empty());
        detector.handle(0, 5, &Message::SearchPrev { position: 6 }, &mut engine, &mut out);
        assert_eq!(sends(&out), vec![(5, Message::AckSearchPrev { position: 3 })]);
    }

    #[test]
    fn test_lonely_requester_regenerates() {
        let mut detector = FailureDetector::new(config(), 5);
        let mut engine = QueueEngine::new(3, 2);
        let mut out = Vec::new();

        let outcome = engine.request(&mut out);
        detector.on_request(0, outcome);
        out.clear();

        detector.tick(12, &mut engine, &mut out);
        assert_eq!(broadcasts(&out), vec![Message::SearchQueue { cnt: 0 }]);
        out.clear();

        detector.tick(15, &mut engine, &mut out);
        assert_eq!(broadcasts(&out), vec![Message::Election]);
        out.clear();

        detector.tick(18, &mut engine, &mut out);
        assert_eq!(broadcasts(&out), vec![Message::Regenerated]);
        assert!(engine.state().has_token);
        assert!(engine.state().in_cs);
        assert_eq!(detector.phase(), RecoveryPhase::Idle);
    }

    #[test]
    fn test_lower_candidate_wins_election() {
        let mut detector = FailureDetector::new(config(), 5);
        let mut engine = QueueEngine::new(4, 2);
        let mut out = Vec::new();

        let outcome = engine.request(&mut out);
        detector.on_request(0, outcome);
        detector.tick(12, &mut engine, &mut out);
        detector.tick(15, &mut engine, &mut out);
        detector.handle(15, 3, &Message::Election, &mut engine, &mut out);
        out.clear();

        detector.tick(18, &mut engine, &mut out);
        assert!(broadcasts(&out).is_empty());
        assert!(!engine.state().has_token);
        assert!(matches!(
            detector.phase(),
            RecoveryPhase::AwaitingRegeneration { .. }
        ));

        // winner's announcement makes us re-request through it
        detector.handle(19, 3, &Message::Regenerated, &mut engine, &mut out);
        assert_eq!(sends(&out), vec![(3, Message::Request { requester: 4 })]);
        assert!(matches!(detector.phase(), RecoveryPhase::AwaitingCommit { .. }));
    }

    #[test]
    fn test_holder_answers_election_with_ok() {
        let mut detector = FailureDetector::new(config(), 5);
        let mut holder = QueueEngine::new(1, 2);
        let mut out = Vec::new();
        detector.handle(0, 3, &Message::Election, &mut holder, &mut out);
        assert_eq!(sends(&out), vec![(3, Message::Ok)]);
    }

    #[test]
    fn test_queue_search_prefers_live_tail() {
        let mut detector = FailureDetector::new(config(), 5);
        let mut engine = QueueEngine::new(5, 2);
        let mut out = Vec::new();

        let outcome = engine.request(&mut out);
        detector.on_request(0, outcome);
        detector.tick(12, &mut engine, &mut out);
        out.clear();

        let ack = |position, next| Message::AckSearchQueue { position, next };
        detector.handle(13, 1, &ack(0, Some(2)), &mut engine, &mut out);
        detector.handle(13, 2, &ack(1, Some(3)), &mut engine, &mut out);
        detector.handle(13, 3, &ack(2, None), &mut engine, &mut out);
        detector.tick(15, &mut engine, &mut out);

        assert_eq!(sends(&out), vec![(3, Message::DirectConnect)]);
        detector.handle(16, 3, &Message::ConnectAck, &mut engine, &mut out);
        assert!(matches!(detector.phase(), RecoveryPhase::AwaitingCommit { .. }));
    }

    #[test]
    fn test_queue_search_replaces_silent_successor() {
        let mut detector = FailureDetector::new(config(), 5);
        let mut engine = QueueEngine::new(5, 2);
        let mut out = Vec::new();

        let outcome = engine.request(&mut out);
        detector.on_request(0, outcome);
        detector.tick(12, &mut engine, &mut out);
        out.clear();

        // 2's successor 3 is gone and nobody is a tail
        detector.handle(
            13,
            2,
            &Message::AckSearchQueue {
                position: 1,
                next: Some(3),
            },
            &mut engine,
            &mut out,
        );
        detector.tick(15, &mut engine, &mut out);
        assert_eq!(sends(&out), vec![(2, Message::RequestFailure { requester: 5 })]);
    }
}
