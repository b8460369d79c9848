pub mod neighbor;

use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use neighbor::NeighborSet;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TopologyError {
    #[error("Invalid BCube parameters: group_size={group_size}, level_count={level_count}")]
    InvalidParameters {
        group_size: usize,
        level_count: usize,
    },
    #[error("BCube({group_size},{level_count}) node count overflows")]
    NodeCountOverflow {
        group_size: usize,
        level_count: usize,
    },
    #[error("Address plan cannot represent level {level}, node {index}")]
    AddressOverflow { level: usize, index: usize },
    #[error("Rank {rank} out of range for {node_count} nodes")]
    RankOutOfRange { rank: usize, node_count: usize },
}

/// Per-level address block: `{prefix[0]}.{prefix[1]}.{level_base + level}.{host_base + index}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AddressPlan {
    pub prefix: [u8; 2],
    pub level_base: u8,
    pub host_base: u8,
}

impl Default for AddressPlan {
    fn default() -> Self {
        AddressPlan {
            prefix: [12, 12],
            level_base: 10,
            host_base: 11,
        }
    }
}

impl AddressPlan {
    pub fn address(&self, level: usize, index: usize) -> Result<Ipv4Addr, TopologyError> {
        let overflow = || TopologyError::AddressOverflow { level, index };
        let third = u8::try_from(self.level_base as usize + level).map_err(|_| overflow())?;
        let fourth = u8::try_from(self.host_base as usize + index).map_err(|_| overflow())?;
        Ok(Ipv4Addr::new(self.prefix[0], self.prefix[1], third, fourth))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub rank: usize,
    // one address per level
    pub ips: Vec<Ipv4Addr>,
}

impl Node {
    #[inline]
    pub fn ip(&self, level: usize) -> Ipv4Addr {
        self.ips[level]
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub group_size: usize,
    pub level_count: usize,
    pub node_count: usize,
    // level -> node index -> node address on that level
    grid: Vec<Vec<Ipv4Addr>>,
}

impl Topology {
    pub fn new(
        group_size: usize,
        level_count: usize,
        plan: &AddressPlan,
    ) -> Result<Self, TopologyError> {
        if group_size < 2 || level_count == 0 {
            return Err(TopologyError::InvalidParameters {
                group_size,
                level_count,
            });
        }
        let node_count = u32::try_from(level_count)
            .ok()
            .and_then(|exp| group_size.checked_pow(exp))
            .ok_or(TopologyError::NodeCountOverflow {
                group_size,
                level_count,
            })?;
        log::info!(
            "Constructing BCube({},{}) topology with {} nodes",
            group_size,
            level_count,
            node_count
        );
        let mut grid = Vec::with_capacity(level_count);
        for level in 0..level_count {
            let ips = (0..node_count)
                .map(|index| plan.address(level, index))
                .collect::<Result<Vec<_>, _>>()?;
            grid.push(ips);
        }
        Ok(Topology {
            group_size,
            level_count,
            node_count,
            grid,
        })
    }

    #[inline]
    pub fn contains(&self, rank: usize) -> bool {
        rank < self.node_count
    }

    pub fn check_rank(&self, rank: usize) -> Result<(), TopologyError> {
        if self.contains(rank) {
            Ok(())
        } else {
            Err(TopologyError::RankOutOfRange {
                rank,
                node_count: self.node_count,
            })
        }
    }

    /// Base-`group_size` digit of `rank` at `level`.
    #[inline]
    pub fn digit(&self, rank: usize, level: usize) -> usize {
        (rank / self.group_size.pow(level as u32)) % self.group_size
    }

    /// Rank obtained by replacing the digit of `rank` at `level` with `value`.
    #[inline]
    pub fn with_digit(&self, rank: usize, level: usize, value: usize) -> usize {
        let weight = self.group_size.pow(level as u32);
        rank - self.digit(rank, level) * weight + value * weight
    }

    #[inline]
    pub fn ip(&self, level: usize, rank: usize) -> Ipv4Addr {
        self.grid[level][rank]
    }

    pub fn node(&self, rank: usize) -> Node {
        Node {
            rank,
            ips: (0..self.level_count).map(|l| self.grid[l][rank]).collect(),
        }
    }

    pub fn rank_of(&self, level: usize, ip: Ipv4Addr) -> Option<usize> {
        self.grid.get(level)?.iter().position(|addr| *addr == ip)
    }

    /// Number of one-hop edges incident to every node.
    #[inline]
    pub fn edges_per_node(&self) -> usize {
        (self.group_size - 1) * self.level_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_count_is_power() {
        for n in 2..6 {
            for l in 1..4 {
                let topo = Topology::new(n, l, &AddressPlan::default()).unwrap();
                assert_eq!(topo.node_count, n.pow(l as u32));
            }
        }
    }

    #[test]
    fn default_addresses() {
        let topo = Topology::new(3, 2, &AddressPlan::default()).unwrap();
        assert_eq!(topo.ip(0, 0), Ipv4Addr::new(12, 12, 10, 11));
        assert_eq!(topo.ip(1, 8), Ipv4Addr::new(12, 12, 11, 19));
        assert_eq!(topo.rank_of(1, Ipv4Addr::new(12, 12, 11, 15)), Some(4));
        assert_eq!(topo.node(4).ips.len(), 2);
    }

    #[test]
    fn rejects_invalid_parameters() {
        let plan = AddressPlan::default();
        assert!(matches!(
            Topology::new(0, 2, &plan),
            Err(TopologyError::InvalidParameters { .. })
        ));
        assert!(matches!(
            Topology::new(3, 0, &plan),
            Err(TopologyError::InvalidParameters { .. })
        ));
        assert!(matches!(
            Topology::new(4, 4, &plan),
            Err(TopologyError::AddressOverflow { .. })
        ));
    }

    #[test]
    fn digits() {
        let topo = Topology::new(3, 2, &AddressPlan::default()).unwrap();
        assert_eq!(topo.digit(5, 0), 2);
        assert_eq!(topo.digit(5, 1), 1);
        assert_eq!(topo.with_digit(5, 1, 0), 2);
        assert_eq!(topo.with_digit(5, 0, 0), 3);
    }
}
