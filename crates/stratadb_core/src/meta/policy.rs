//! Persist scheduling: how many recent generations to consolidate.
//!
//! Each metadata store keeps a clock that advances once per persist and a
//! list of generation blocks, newest first. A policy maps the clock to the
//! number of newest generations the next persist replaces and to the range
//! of modification clocks it must therefore rewrite.

use std::fmt;

/// What one persist consolidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeSize {
    /// Number of newest generations replaced by the new block.
    pub npersists: usize,
    /// Entries modified at clocks within `timespan` of the current clock
    /// are rewritten.
    pub timespan: u64,
}

/// Strategy choosing how much to consolidate on each persist.
pub trait ConsolidationPolicy: Send + Sync + fmt::Debug {
    /// Consolidation for a store whose clock is `clock`. `flatten` requests
    /// a full rewrite.
    fn merge_size(&self, clock: u64, flatten: bool) -> MergeSize;
}

/// Binary-counter schedule: the number of trailing one bits of the clock is
/// the number of generations merged. Every persist writes one level, every
/// second persist merges two, every fourth merges three, and so on.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrailingOnes;

impl ConsolidationPolicy for TrailingOnes {
    fn merge_size(&self, clock: u64, flatten: bool) -> MergeSize {
        let clock = if flatten { u64::MAX } else { clock };
        let ones = clock.trailing_ones();
        let timespan = if ones >= u64::BITS {
            u64::MAX
        } else {
            (1 << ones) - 1
        };
        MergeSize {
            npersists: ones as usize,
            timespan,
        }
    }
}

/// Offset of generation `n`, or 0 past the end.
pub(crate) fn nth(offs: &[u64], n: usize) -> u64 {
    offs.get(n).copied().unwrap_or(0)
}

/// Replaces the first `n` generations with `off`.
pub(crate) fn replace(offs: &[u64], n: usize, off: u64) -> Vec<u64> {
    if n == 0 && offs.first() == Some(&off) {
        return offs.to_vec();
    }
    let mut out = Vec::with_capacity(offs.len() + 1);
    out.push(off);
    out.extend_from_slice(offs.get(n..).unwrap_or_default());
    out
}

/// Clock for a store just read from disk.
///
/// A single generation is fully consolidated, so incremental persists can
/// start. With several generations the clock is saturated, which forces the
/// first persist to consolidate everything.
pub(crate) fn clock_for(ngenerations: usize, delay: u64) -> u64 {
    match ngenerations {
        0 => 0,
        1 => delay,
        _ => u64::MAX,
    }
}
