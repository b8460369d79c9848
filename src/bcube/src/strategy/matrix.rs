//! Routing-matrix calculator.
//!
//! Entry `[i][j]` of a send matrix is `NO_SEND` when node `i` sends nothing to
//! node `j` in that (lane, step), otherwise the first block id of a contiguous
//! run of `block_count` blocks.
//!
//! The tensor is cut into `level_count * node_count` blocks and lane `p` owns
//! the slab `[p * N, (p + 1) * N)`. Lane `p` walks the levels in the rotated
//! order `(p + t) % L`, so at any step the lanes keep different levels busy.
//! Inside a slab the base-`n` digits of a block index are ordered by that walk
//! (first visited level most significant), which keeps every responsibility
//! range contiguous.

use crate::topology::Topology;

pub const NO_SEND: i64 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RoutingParams {
    pub group_size: usize,
    pub level_count: usize,
    pub node_count: usize,
}

impl RoutingParams {
    pub fn from_topology(topo: &Topology) -> Self {
        RoutingParams {
            group_size: topo.group_size,
            level_count: topo.level_count,
            node_count: topo.node_count,
        }
    }

    #[inline]
    pub fn total_blocks(&self) -> usize {
        self.level_count * self.node_count
    }

    #[inline]
    fn pow(&self, exp: usize) -> usize {
        self.group_size.pow(exp as u32)
    }

    #[inline]
    fn digit(&self, rank: usize, level: usize) -> usize {
        (rank / self.pow(level)) % self.group_size
    }

    #[inline]
    fn with_digit(&self, rank: usize, level: usize, value: usize) -> usize {
        let weight = self.pow(level);
        rank - self.digit(rank, level) * weight + value * weight
    }

    /// Level visited by `lane` at position `t` of its walk.
    #[inline]
    pub fn dimension(&self, lane: usize, t: usize) -> usize {
        (lane + t) % self.level_count
    }

    /// Digits of `rank` along the first `len` levels of the walk of `lane`,
    /// read as a base-`n` number.
    fn prefix(&self, lane: usize, rank: usize, len: usize) -> usize {
        (0..len).fold(0, |acc, t| {
            acc * self.group_size + self.digit(rank, self.dimension(lane, t))
        })
    }

    /// Blocks `rank` is responsible for in `lane` once `done` scatter steps
    /// have completed, as `(first_block, block_count)`.
    pub fn responsibility(&self, lane: usize, rank: usize, done: usize) -> (usize, usize) {
        let count = self.pow(self.level_count - done);
        let first = lane * self.node_count + self.prefix(lane, rank, done) * count;
        (first, count)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendMatrix {
    pub cells: Vec<Vec<i64>>,
    pub block_count: usize,
}

impl SendMatrix {
    fn empty(node_count: usize, block_count: usize) -> Self {
        SendMatrix {
            cells: vec![vec![NO_SEND; node_count]; node_count],
            block_count,
        }
    }

    pub fn sends(&self) -> impl Iterator<Item = (usize, usize, usize)> + '_ {
        self.cells.iter().enumerate().flat_map(|(src, row)| {
            row.iter()
                .enumerate()
                .filter(|(_, cell)| **cell != NO_SEND)
                .map(move |(dst, cell)| (src, dst, *cell as usize))
        })
    }
}

pub fn scatter_matrix(lane: usize, step: usize, params: &RoutingParams) -> SendMatrix {
    assert!(lane < params.level_count && step < params.level_count);
    let dim = params.dimension(lane, step);
    let block_count = params.pow(params.level_count - step - 1);
    let mut matrix = SendMatrix::empty(params.node_count, block_count);
    for src in 0..params.node_count {
        let (first, _) = params.responsibility(lane, src, step);
        let own = params.digit(src, dim);
        for value in (0..params.group_size).filter(|v| *v != own) {
            let dst = params.with_digit(src, dim, value);
            matrix.cells[src][dst] = (first + value * block_count) as i64;
        }
    }
    matrix
}

pub fn gather_matrix(lane: usize, step: usize, params: &RoutingParams) -> SendMatrix {
    assert!(lane < params.level_count && step < params.level_count);
    // gather replays the scatter walk backwards
    let t = params.level_count - 1 - step;
    let dim = params.dimension(lane, t);
    let mut matrix = SendMatrix::empty(params.node_count, params.pow(step));
    for src in 0..params.node_count {
        let (first, count) = params.responsibility(lane, src, t + 1);
        debug_assert_eq!(count, matrix.block_count);
        let own = params.digit(src, dim);
        for value in (0..params.group_size).filter(|v| *v != own) {
            let dst = params.with_digit(src, dim, value);
            matrix.cells[src][dst] = first as i64;
        }
    }
    matrix
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(n: usize, l: usize) -> RoutingParams {
        RoutingParams {
            group_size: n,
            level_count: l,
            node_count: n.pow(l as u32),
        }
    }

    #[test]
    fn scatter_first_step_bcube_3_2() {
        let p = params(3, 2);
        let m = scatter_matrix(0, 0, &p);
        assert_eq!(m.block_count, 3);
        // lane 0 walks level 0 first: node 4 (digit 1) sends digit-0 and
        // digit-2 thirds of the slab to nodes 3 and 5
        assert_eq!(m.cells[4][3], 0);
        assert_eq!(m.cells[4][5], 6);
        assert_eq!(m.cells[4][1], NO_SEND);
        assert_eq!(m.cells[4][4], NO_SEND);

        let m = scatter_matrix(1, 0, &p);
        // lane 1 walks level 1 first, inside slab [9, 18)
        assert_eq!(m.cells[4][1], 9);
        assert_eq!(m.cells[4][7], 15);
        assert_eq!(m.cells[4][3], NO_SEND);
    }

    #[test]
    fn gather_sends_whole_holding() {
        let p = params(3, 2);
        let m = gather_matrix(0, 0, &p);
        assert_eq!(m.block_count, 1);
        // node 4 holds exactly one block of lane 0 after scatter
        let (first, count) = p.responsibility(0, 4, 2);
        assert_eq!(count, 1);
        assert_eq!(m.cells[4][1], first as i64);
        assert_eq!(m.cells[4][7], first as i64);

        let m = gather_matrix(0, 1, &p);
        assert_eq!(m.block_count, 3);
        let (first, _) = p.responsibility(0, 4, 1);
        assert_eq!(m.cells[4][3], first as i64);
    }

    #[test]
    fn every_node_sends_to_its_group_each_step() {
        for (n, l) in [(2, 2), (3, 2), (2, 3), (4, 1)] {
            let p = params(n, l);
            for lane in 0..l {
                for step in 0..l {
                    for m in [scatter_matrix(lane, step, &p), gather_matrix(lane, step, &p)] {
                        for row in &m.cells {
                            assert_eq!(row.iter().filter(|c| **c != NO_SEND).count(), n - 1);
                        }
                    }
                }
            }
        }
    }
}
