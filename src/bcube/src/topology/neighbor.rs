use std::net::Ipv4Addr;

use super::{Node, Topology, TopologyError};

/// One-hop view of the topology from a single rank.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NeighborSet {
    pub rank: usize,
    // local address on every level, used as the source of outbound connections
    pub local_ips: Vec<Ipv4Addr>,
    // level -> neighbors reachable over that level
    pub levels: Vec<Vec<Node>>,
}

impl NeighborSet {
    pub fn resolve(topo: &Topology, rank: usize) -> Result<Self, TopologyError> {
        topo.check_rank(rank)?;
        let local_ips = (0..topo.level_count).map(|l| topo.ip(l, rank)).collect();
        let mut levels = Vec::with_capacity(topo.level_count);
        for level in 0..topo.level_count {
            let own = topo.digit(rank, level);
            let group = (0..topo.group_size)
                .filter(|value| *value != own)
                .map(|value| topo.node(topo.with_digit(rank, level, value)))
                .collect::<Vec<_>>();
            debug_assert_eq!(group.len(), topo.group_size - 1);
            levels.push(group);
        }
        log::debug!(
            "Rank {} neighbors: {:?}",
            rank,
            levels
                .iter()
                .map(|g| g.iter().map(|n| n.rank).collect::<Vec<_>>())
                .collect::<Vec<_>>()
        );
        Ok(NeighborSet {
            rank,
            local_ips,
            levels,
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &Node)> + '_ {
        self.levels
            .iter()
            .enumerate()
            .flat_map(|(level, group)| group.iter().map(move |node| (level, node)))
    }

    pub fn level_of(&self, node_id: usize) -> Option<usize> {
        self.iter()
            .find(|(_, node)| node.rank == node_id)
            .map(|(level, _)| level)
    }

    #[inline]
    pub fn contains(&self, node_id: usize) -> bool {
        self.level_of(node_id).is_some()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.levels.iter().map(Vec::len).sum()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::topology::AddressPlan;

    #[test]
    fn rank4_of_bcube_3_2() {
        let topo = Topology::new(3, 2, &AddressPlan::default()).unwrap();
        let neighbors = NeighborSet::resolve(&topo, 4).unwrap();
        let ranks = |level: usize| {
            neighbors.levels[level]
                .iter()
                .map(|n| n.rank)
                .collect::<Vec<_>>()
        };
        assert_eq!(ranks(0), vec![3, 5]);
        assert_eq!(ranks(1), vec![1, 7]);
        assert_eq!(neighbors.len(), 4);
        assert_eq!(neighbors.local_ips, vec![topo.ip(0, 4), topo.ip(1, 4)]);
        assert_eq!(neighbors.level_of(7), Some(1));
        assert_eq!(neighbors.level_of(8), None);
    }

    #[test]
    fn neighbor_sets_are_well_formed() {
        for (n, l) in [(2, 1), (2, 3), (3, 2), (4, 2), (5, 1), (3, 3)] {
            let topo = Topology::new(n, l, &AddressPlan::default()).unwrap();
            for rank in 0..topo.node_count {
                let neighbors = NeighborSet::resolve(&topo, rank).unwrap();
                let mut seen = HashSet::new();
                for (level, group) in neighbors.levels.iter().enumerate() {
                    assert_eq!(group.len(), n - 1);
                    for node in group {
                        assert_ne!(node.rank, rank);
                        assert!(seen.insert(node.rank));
                        for other in 0..l {
                            let same = topo.digit(node.rank, other) == topo.digit(rank, other);
                            assert_eq!(same, other != level);
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn rank_out_of_range() {
        let topo = Topology::new(2, 2, &AddressPlan::default()).unwrap();
        assert_eq!(
            NeighborSet::resolve(&topo, 4),
            Err(TopologyError::RankOutOfRange {
                rank: 4,
                node_count: 4
            })
        );
    }
}
