//! Cross-lane reduction of per-lane cycle counts.
//!
//! The same shuffle-down tree runs on the host (`tree_reduce`) and inside a lane group
//! (`Lane::reduce`): at each round lane `i` folds in the value held by lane `i + offset`, with the
//! offset halving until it reaches 1. Lane 0 ends up holding the group result.

/// How per-lane (and per-launch) cycle counts collapse into one value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reduction {
    /// Best-case lane, approximating unloaded latency
    Min,
    /// Total over all lanes
    Sum,
}

impl Reduction {
    /// Sentinel the cycle counter is reset to before a sweep point
    pub fn identity(self) -> u64 {
        match self {
            Reduction::Min => u64::MAX,
            Reduction::Sum => 0,
        }
    }

    pub fn combine(self, a: u64, b: u64) -> u64 {
        match self {
            Reduction::Min => a.min(b),
            Reduction::Sum => a.saturating_add(b),
        }
    }

    /// Lanes whose work is represented in the reduced value
    pub fn counted_lanes(self, group_size: usize) -> u64 {
        match self {
            Reduction::Min => 1,
            Reduction::Sum => group_size as u64,
        }
    }

    /// Launches whose work is represented in the value accumulated over outer iterations
    pub fn counted_outer(self, outer_iterations: u64) -> u64 {
        match self {
            Reduction::Min => 1,
            Reduction::Sum => outer_iterations,
        }
    }
}

/// First shuffle offset for a group of `len` lanes
pub(crate) fn first_offset(len: usize) -> usize {
    len.next_power_of_two() / 2
}

/// Reduce `values` with the shuffle-down tree, returning what lane 0 would hold
pub fn tree_reduce(values: &[u64], reduction: Reduction) -> u64 {
    let mut lanes = values.to_vec();
    let mut offset = first_offset(lanes.len());
    while offset > 0 {
        for i in 0..lanes.len() {
            if i + offset < lanes.len() {
                lanes[i] = reduction.combine(lanes[i], lanes[i + offset]);
            }
        }
        offset /= 2;
    }
    lanes.first().copied().unwrap_or(reduction.identity())
}
