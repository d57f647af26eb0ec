use crate::balancing::state::LoadSnapshot;
use crate::bus::NodeId;

/// Fleet-wide numbers one node derives from its full snapshot set.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FleetStats {
    pub average: f64,
    pub within_delta: usize,
    pub node_count: usize,
}

impl FleetStats {
    pub fn from_loads(loads: &[(NodeId, LoadSnapshot)], delta: f64) -> Self {
        let node_count = loads.len();
        let average = if node_count == 0 {
            0.0
        } else {
            loads.iter().map(|(_, s)| s.total_time).sum::<f64>() / node_count as f64
        };
        let within_delta = loads
            .iter()
            .filter(|(_, s)| (s.total_time - average).abs() <= delta)
            .count();

        Self {
            average,
            within_delta,
            node_count,
        }
    }

    /// Every node is within delta of the average.
    pub fn is_balanced(&self) -> bool {
        self.within_delta >= self.node_count
    }
}

/// What a node should do in the current round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingRole {
    /// Lighter side of a pair: sends the pairing request
    Initiator { partner: NodeId },
    /// Heavier side of a pair: waits for the request
    Responder { partner: NodeId },
    /// Exact median of an odd-sized fleet
    Median,
    /// Not in the ranking, or no valid partner
    Unpaired,
}

/// Node ids ordered by ascending load, ties broken by ascending id.
pub fn rank_by_load(loads: &[(NodeId, LoadSnapshot)]) -> Vec<NodeId> {
    let mut ranked: Vec<(NodeId, f64)> = loads.iter().map(|(id, s)| (*id, s.total_time)).collect();
    ranked.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
    ranked.into_iter().map(|(id, _)| id).collect()
}

/// Rank `i` pairs with rank `n - 1 - i`; only the lighter half initiates.
pub fn pairing_role(ranked: &[NodeId], me: NodeId) -> PairingRole {
    let n = ranked.len();
    let Some(my_index) = ranked.iter().position(|&id| id == me) else {
        return PairingRole::Unpaired;
    };

    if n % 2 == 1 && my_index == n / 2 {
        return PairingRole::Median;
    }

    let pair_index = n - 1 - my_index;
    if pair_index == my_index {
        return PairingRole::Unpaired;
    }
    let partner = ranked[pair_index];

    if my_index < n / 2 {
        PairingRole::Initiator { partner }
    } else {
        PairingRole::Responder { partner }
    }
}

/// All pairs of a ranking as `(initiator, responder)`.
pub fn pairs(ranked: &[NodeId]) -> Vec<(NodeId, NodeId)> {
    ranked
        .iter()
        .filter_map(|&id| match pairing_role(ranked, id) {
            PairingRole::Initiator { partner } => Some((id, partner)),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loads(times: &[(NodeId, f64)]) -> Vec<(NodeId, LoadSnapshot)> {
        times
            .iter()
            .map(|&(id, t)| (id, LoadSnapshot::new(t, 100)))
            .collect()
    }

    #[test]
    fn stats_compute_average_and_within_delta() {
        let stats = FleetStats::from_loads(&loads(&[(1, 1.0), (2, 3.0), (3, 8.0)]), 2.0);
        assert_eq!(stats.average, 4.0);
        assert_eq!(stats.within_delta, 1);
        assert_eq!(stats.node_count, 3);
        assert!(!stats.is_balanced());

        let stats = FleetStats::from_loads(&loads(&[(1, 3.0), (2, 5.0)]), 1.0);
        assert!(stats.is_balanced());
    }

    #[test]
    fn ranking_breaks_ties_by_id() {
        let ranked = rank_by_load(&loads(&[(4, 2.0), (2, 2.0), (9, 0.5), (1, 7.0)]));
        assert_eq!(ranked, vec![9, 2, 4, 1]);
    }

    #[test]
    fn four_nodes_pair_outside_in() {
        let ranked = rank_by_load(&loads(&[(10, 4.0), (11, 1.0), (12, 3.0), (13, 2.0)]));
        assert_eq!(ranked, vec![11, 13, 12, 10]);

        assert_eq!(
            pairing_role(&ranked, 11),
            PairingRole::Initiator { partner: 10 }
        );
        assert_eq!(
            pairing_role(&ranked, 13),
            PairingRole::Initiator { partner: 12 }
        );
        assert_eq!(
            pairing_role(&ranked, 12),
            PairingRole::Responder { partner: 13 }
        );
        assert_eq!(
            pairing_role(&ranked, 10),
            PairingRole::Responder { partner: 11 }
        );
        assert_eq!(pairs(&ranked), vec![(11, 10), (13, 12)]);
    }

    #[test]
    fn median_of_five_sits_out() {
        let ranked = vec![1, 2, 3, 4, 5];
        assert_eq!(pairing_role(&ranked, 3), PairingRole::Median);

        let paired = pairs(&ranked);
        assert_eq!(paired, vec![(1, 5), (2, 4)]);
        assert!(paired.iter().all(|&(a, b)| a != 3 && b != 3));
    }

    #[test]
    fn single_node_and_strangers_are_not_paired() {
        assert_eq!(pairing_role(&[7], 7), PairingRole::Median);
        assert_eq!(pairing_role(&[1, 2], 3), PairingRole::Unpaired);
        assert!(pairs(&[]).is_empty());
    }
}
