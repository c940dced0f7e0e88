use crate::nt_config::{ClusterConfig, ProtocolConfig};
use crate::nt_interface::{
    Event, EventSink, Message, MessageEnvelope, NoOpSink, NodeId, NtTime, Position,
};
use crate::nt_queue::{NodeAction, QueueEngine, RequestOutcome};
use crate::nt_recovery::{FailureDetector, RecoveryPhase};
use crate::nt_state::NodeState;

/// One participant of the token queue, free of any I/O.
///
/// Messages come in through `handle_message`, time advances through `tick`,
/// and every effect is returned as envelopes to be delivered by the caller.
pub struct NtNode {
    engine: QueueEngine,
    detector: FailureDetector,
    peers: Vec<NodeId>,
    /// Positions at or past this can only come from a queue looping on itself
    position_limit: Position,
    time: NtTime,
    event_sink: Box<dyn EventSink>,
    actions: Vec<NodeAction>,
}

impl NtNode {
    /// Create a new node with default NoOpSink (zero overhead)
    pub fn new(id: NodeId, peers: Vec<NodeId>, config: ProtocolConfig) -> Self {
        Self::new_with_sink(id, peers, config, Box::new(NoOpSink))
    }

    /// Create a new node with a custom event sink for debugging/analysis
    pub fn new_with_sink(
        id: NodeId,
        peers: Vec<NodeId>,
        config: ProtocolConfig,
        event_sink: Box<dyn EventSink>,
    ) -> Self {
        let cluster_size = peers.len() + usize::from(!peers.contains(&id));
        // stale positions run ahead of the real distance for a few hops
        let position_limit = Position::try_from(2 * cluster_size).unwrap_or(Position::MAX);
        Self {
            engine: QueueEngine::new(id, config.fault_tolerance),
            detector: FailureDetector::new(config, cluster_size),
            peers,
            position_limit,
            time: 0,
            event_sink,
            actions: Vec::new(),
        }
    }

    pub fn from_cluster(id: NodeId, cluster: &ClusterConfig, event_sink: Box<dyn EventSink>) -> Self {
        Self::new_with_sink(id, cluster.node_ids(), cluster.protocol.clone(), event_sink)
    }

    pub fn id(&self) -> NodeId {
        self.engine.id()
    }

    pub fn state(&self) -> &NodeState {
        self.engine.state()
    }

    pub fn phase(&self) -> RecoveryPhase {
        self.detector.phase()
    }

    pub fn has_token(&self) -> bool {
        self.state().has_token
    }

    pub fn in_critical_section(&self) -> bool {
        self.state().in_cs
    }

    /// Requested the critical section and not yet inside it
    pub fn is_waiting(&self) -> bool {
        self.state().is_waiting()
    }

    pub fn request_token(&mut self, responses: &mut Vec<MessageEnvelope>) -> RequestOutcome {
        let outcome = self.engine.request(&mut self.actions);
        self.detector.on_request(self.time, outcome);
        self.dispatch(responses);
        outcome
    }

    /// Returns false when the node was not inside the critical section
    pub fn release_token(&mut self, responses: &mut Vec<MessageEnvelope>) -> bool {
        let released = self.engine.release(&mut self.actions);
        if released {
            self.detector.on_released();
        }
        self.dispatch(responses);
        released
    }

    pub fn handle_message(&mut self, msg: &MessageEnvelope, responses: &mut Vec<MessageEnvelope>) {
        let id = self.id();
        if msg.receiver != id {
            return;
        }
        self.event_sink.log(
            self.time,
            id,
            Event::MessageReceived {
                peer: msg.sender,
                kind: msg.message.kind(),
            },
        );

        match &msg.message {
            Message::Request { requester } => {
                self.engine.on_request(*requester, &mut self.actions);
            }
            Message::Commit {
                predecessors,
                position,
            } if self.closes_loop(msg.sender, predecessors, *position) => {
                self.detector.on_broken_queue(
                    self.time,
                    msg.sender,
                    *position,
                    self.engine.state(),
                    &mut self.actions,
                );
            }
            Message::Commit {
                predecessors,
                position,
            } => {
                self.engine
                    .on_commit(msg.sender, predecessors, *position, &mut self.actions);
                let state = self.engine.state();
                if state.has_commit && state.predecessor == Some(msg.sender) {
                    self.detector.on_committed(self.time, state);
                }
            }
            Message::Token => {
                self.engine.on_token(msg.sender, &mut self.actions);
                if self.engine.state().has_token {
                    self.detector.on_token_acquired();
                }
            }
            Message::RequestFailure { requester } => {
                self.engine.on_request_failure(*requester, &mut self.actions);
            }
            other => {
                self.detector
                    .handle(self.time, msg.sender, other, &mut self.engine, &mut self.actions);
            }
        }

        self.dispatch(responses);
    }

    pub fn tick(&mut self, responses: &mut Vec<MessageEnvelope>) {
        self.time += 1;
        self.detector
            .tick(self.time, &mut self.engine, &mut self.actions);
        self.dispatch(responses);
    }

    /// A COMMIT whose sender is behind us, or whose position outgrew the
    /// cluster, would close the queue into a loop with no token in it
    fn closes_loop(&self, sender: NodeId, predecessors: &[NodeId], position: Position) -> bool {
        let state = self.engine.state();
        position >= self.position_limit
            || predecessors.contains(&state.id)
            || state.next == Some(sender)
    }

    fn dispatch(&mut self, responses: &mut Vec<MessageEnvelope>) {
        let id = self.id();
        let mut actions = std::mem::take(&mut self.actions);
        for action in actions.drain(..) {
            match action {
                NodeAction::Send { to, message } => {
                    Self::emit(&mut *self.event_sink, self.time, id, to, message, responses);
                }
                NodeAction::Broadcast { message } => {
                    for &peer in &self.peers {
                        if peer != id {
                            Self::emit(
                                &mut *self.event_sink,
                                self.time,
                                id,
                                peer,
                                message.clone(),
                                responses,
                            );
                        }
                    }
                }
                NodeAction::Notice(event) => self.event_sink.log(self.time, id, event),
            }
        }
        self.actions = actions;
    }

    fn emit(
        sink: &mut dyn EventSink,
        time: NtTime,
        id: NodeId,
        to: NodeId,
        message: Message,
        responses: &mut Vec<MessageEnvelope>,
    ) {
        sink.log(
            time,
            id,
            Event::MessageSent {
                peer: to,
                kind: message.kind(),
            },
        );
        responses.push(MessageEnvelope {
            sender: id,
            receiver: to,
            message,
        });
    }
}
