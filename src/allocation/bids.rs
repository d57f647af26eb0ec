use std::collections::BTreeMap;

use crate::bus::NodeId;

/// Proposals collected during one bidding round of a task.
///
/// Nodes are kept in id order so that the winner is deterministic: the lowest
/// proposed completion time wins, and equal times go to the lowest node id.
#[derive(Debug, Clone, Default)]
pub struct BidBook {
    round: u64,
    bids: BTreeMap<NodeId, Option<f64>>,
}

impl BidBook {
    /// Start a round expecting one proposal from each of `nodes`.
    pub fn open(round: u64, nodes: impl IntoIterator<Item = NodeId>) -> Self {
        Self {
            round,
            bids: nodes.into_iter().map(|id| (id, None)).collect(),
        }
    }

    pub fn round(&self) -> u64 {
        self.round
    }

    /// Record a proposal. Proposals for another round, or from a node that was
    /// not asked, are ignored and return false.
    pub fn record(&mut self, node: NodeId, round: u64, completion_time: f64) -> bool {
        if round != self.round {
            return false;
        }
        match self.bids.get_mut(&node) {
            Some(slot) => {
                *slot = Some(completion_time);
                true
            }
            None => false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.bids.is_empty()
    }

    pub fn outstanding(&self) -> usize {
        self.bids.values().filter(|b| b.is_none()).count()
    }

    pub fn is_complete(&self) -> bool {
        !self.bids.is_empty() && self.outstanding() == 0
    }

    pub fn nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.bids.keys().copied()
    }

    /// Best `(node, completion_time)` once every proposal is in.
    pub fn winner(&self) -> Option<(NodeId, f64)> {
        if !self.is_complete() {
            return None;
        }

        let mut best: Option<(NodeId, f64)> = None;
        for (&node, bid) in &self.bids {
            let Some(time) = *bid else { continue };
            match best {
                Some((_, best_time)) if time >= best_time => {}
                _ => best = Some((node, time)),
            }
        }
        best
    }
}
