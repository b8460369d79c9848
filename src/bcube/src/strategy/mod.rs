pub mod matrix;

use std::ops::Range;

use itertools::iproduct;
use thiserror::Error;

pub use matrix::{RoutingParams, SendMatrix, NO_SEND};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StrategyError {
    #[error("Rank {0} has no strategy row")]
    NoSuchRank(usize),
    #[error("No live connection to node {0}")]
    Unbound(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Scatter,
    Gather,
}

/// A single transmission: send blocks `[first_block, first_block + block_count)` to `node_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RoutingEntry {
    pub node_id: usize,
    pub first_block: usize,
    pub block_count: usize,
}

impl RoutingEntry {
    #[inline]
    pub fn blocks(&self) -> Range<usize> {
        self.first_block..self.first_block + self.block_count
    }
}

// step -> lane -> ordered entries
pub type NodeStrategy = Vec<Vec<Vec<RoutingEntry>>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrategyTable {
    params: RoutingParams,
    // node -> step -> lane -> entries
    nodes: Vec<NodeStrategy>,
}

impl StrategyTable {
    pub fn build(params: RoutingParams) -> Self {
        let levels = params.level_count;
        let mut nodes = vec![vec![vec![Vec::new(); levels]; 2 * levels]; params.node_count];
        for (step, lane) in iproduct!(0..levels, 0..levels) {
            let scatter = matrix::scatter_matrix(lane, step, &params);
            Self::materialize(&mut nodes, &scatter, step, lane);
            let gather = matrix::gather_matrix(lane, step, &params);
            Self::materialize(&mut nodes, &gather, levels + step, lane);
        }
        log::debug!(
            "Built strategy table for {} nodes, {} steps, {} lanes",
            params.node_count,
            2 * levels,
            levels
        );
        StrategyTable { params, nodes }
    }

    fn materialize(nodes: &mut [NodeStrategy], matrix: &SendMatrix, step: usize, lane: usize) {
        for (src, dst, first_block) in matrix.sends() {
            nodes[src][step][lane].push(RoutingEntry {
                node_id: dst,
                first_block,
                block_count: matrix.block_count,
            });
        }
    }

    #[inline]
    pub fn params(&self) -> &RoutingParams {
        &self.params
    }

    #[inline]
    pub fn num_steps(&self) -> usize {
        2 * self.params.level_count
    }

    #[inline]
    pub fn num_lanes(&self) -> usize {
        self.params.level_count
    }

    #[inline]
    pub fn total_blocks(&self) -> usize {
        self.params.total_blocks()
    }

    /// Fragments every node receives in one step, over all lanes.
    #[inline]
    pub fn expected_fragments(&self) -> usize {
        (self.params.group_size - 1) * self.params.level_count
    }

    pub fn phase(&self, step: usize) -> Phase {
        if step < self.params.level_count {
            Phase::Scatter
        } else {
            Phase::Gather
        }
    }

    pub fn entries(&self, node: usize, step: usize, lane: usize) -> &[RoutingEntry] {
        &self.nodes[node][step][lane]
    }

    pub fn node(&self, node: usize) -> Option<&NodeStrategy> {
        self.nodes.get(node)
    }

    pub fn local(&self, rank: usize) -> Result<LocalStrategy, StrategyError> {
        let steps = self
            .nodes
            .get(rank)
            .cloned()
            .ok_or(StrategyError::NoSuchRank(rank))?;
        Ok(LocalStrategy { rank, steps })
    }
}

/// Strategy row of the local rank, before connections are attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalStrategy {
    pub rank: usize,
    pub steps: NodeStrategy,
}

impl LocalStrategy {
    pub fn bind<C, F>(self, mut lookup: F) -> Result<BoundStrategy<C>, StrategyError>
    where
        F: FnMut(usize) -> Option<C>,
    {
        let mut steps = Vec::with_capacity(self.steps.len());
        for lanes in self.steps {
            let mut bound_lanes = Vec::with_capacity(lanes.len());
            for entries in lanes {
                let bound = entries
                    .into_iter()
                    .map(|route| {
                        let link = lookup(route.node_id).ok_or(StrategyError::Unbound(route.node_id))?;
                        Ok(BoundEntry { route, link })
                    })
                    .collect::<Result<Vec<_>, StrategyError>>()?;
                bound_lanes.push(bound);
            }
            steps.push(bound_lanes);
        }
        Ok(BoundStrategy {
            rank: self.rank,
            steps,
        })
    }
}

#[derive(Debug, Clone)]
pub struct BoundEntry<C> {
    pub route: RoutingEntry,
    pub link: C,
}

/// `my_strategy`: step -> lane -> entries bound to live connections.
#[derive(Debug, Clone)]
pub struct BoundStrategy<C> {
    pub rank: usize,
    pub steps: Vec<Vec<Vec<BoundEntry<C>>>>,
}

impl<C> BoundStrategy<C> {
    #[inline]
    pub fn num_steps(&self) -> usize {
        self.steps.len()
    }

    pub fn lanes(&self, step: usize) -> Option<&[Vec<BoundEntry<C>>]> {
        self.steps.get(step).map(Vec::as_slice)
    }
}
