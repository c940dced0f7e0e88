use crate::nt_interface::{NodeId, Position, INITIAL_TOKEN_HOLDER};

/// Per-node fragment of the distributed queue.
///
/// Only the queue engine and the failure detector mutate it, always under the
/// owning node's lock. Remote nodes see it only through the messages it causes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeState {
    pub id: NodeId,

    pub has_token: bool,
    pub in_cs: bool,

    /// Node the last REQUEST was forwarded to, or `id` when this node believes it is the tail
    pub last: NodeId,

    /// Successor that receives the token on release
    pub next: Option<NodeId>,

    /// Distance from the token when queued, `None` when not queued
    pub position: Option<Position>,

    /// Up to k nodes ahead of `predecessor`, most recent first
    pub predecessors: Vec<NodeId>,

    /// Node pinged for liveness
    pub predecessor: Option<NodeId>,

    pub has_request: bool,
    pub has_commit: bool,

    /// COMMIT for the current `next` already sent
    pub commit_sent: bool,

    /// Critical section entries
    pub cnt: u64,

    /// Fault tolerance: length of the predecessor chain carried in COMMIT
    pub k: usize,
}

impl NodeState {
    pub fn new(id: NodeId, k: usize) -> Self {
        let seeded = id == INITIAL_TOKEN_HOLDER;
        Self {
            id,
            has_token: seeded,
            in_cs: false,
            last: INITIAL_TOKEN_HOLDER,
            next: None,
            position: if seeded { Some(0) } else { None },
            predecessors: Vec::new(),
            predecessor: None,
            has_request: false,
            has_commit: false,
            commit_sent: false,
            cnt: 0,
            k,
        }
    }

    /// Holds the token or has been committed into the queue
    pub fn is_queue_member(&self) -> bool {
        self.has_token || self.position.is_some()
    }

    /// Position as advertised to other nodes; the holder is always at 0
    pub fn queue_position(&self) -> Option<Position> {
        if self.has_token {
            Some(0)
        } else {
            self.position
        }
    }

    /// Waiting for the token (queued or not yet committed)
    pub fn is_waiting(&self) -> bool {
        self.has_request && !self.in_cs
    }

    /// Predecessor list handed to our successor: our own predecessor first,
    /// then our chain, capped at k
    pub fn successor_chain(&self) -> Vec<NodeId> {
        self.predecessor
            .iter()
            .chain(self.predecessors.iter())
            .copied()
            .filter(|&p| p != self.id)
            .take(self.k)
            .collect()
    }

    /// Nodes to probe with ARE_YOU_ALIVE, most recent first, without duplicates
    pub fn probe_targets(&self) -> Vec<NodeId> {
        let mut targets: Vec<NodeId> = Vec::with_capacity(self.k + 1);
        for &p in self.predecessor.iter().chain(self.predecessors.iter()) {
            if p != self.id && !targets.contains(&p) {
                targets.push(p);
            }
        }
        targets
    }

    /// `node` is recorded ahead of us, so it cannot also queue behind us
    pub fn is_ahead(&self, node: NodeId) -> bool {
        self.predecessor == Some(node) || self.predecessors.contains(&node)
    }

    pub fn clear_chain(&mut self) {
        self.predecessor = None;
        self.predecessors.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let holder = NodeState::new(1, 2);
        assert!(holder.has_token);
        assert_eq!(holder.position, Some(0));
        assert_eq!(holder.last, 1);
        assert!(holder.is_queue_member());

        let other = NodeState::new(3, 2);
        assert!(!other.has_token);
        assert_eq!(other.position, None);
        assert_eq!(other.last, 1);
        assert!(!other.is_queue_member());
        assert_eq!(other.queue_position(), None);
    }

    #[test]
    fn test_successor_chain_is_capped() {
        let mut state = NodeState::new(4, 2);
        state.predecessor = Some(3);
        state.predecessors = vec![2, 1];
        assert_eq!(state.successor_chain(), vec![3, 2]);
        assert_eq!(state.probe_targets(), vec![3, 2, 1]);
        assert!(state.is_ahead(3));
        assert!(state.is_ahead(1));
        assert!(!state.is_ahead(5));

        state.clear_chain();
        assert!(!state.is_ahead(3));
        assert!(state.successor_chain().is_empty());
        assert!(state.probe_targets().is_empty());
    }

    #[test]
    fn test_probe_targets_skip_duplicates_and_self() {
        let mut state = NodeState::new(4, 3);
        state.predecessor = Some(2);
        state.predecessors = vec![2, 4, 1];
        assert_eq!(state.probe_targets(), vec![2, 1]);
    }
}
