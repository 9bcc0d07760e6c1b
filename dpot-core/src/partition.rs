// MIT License
// Copyright 2023--present dpot developers

//! Contiguous block partitioning of a batch across ranks.
//!
//! With `N` items and `R` ranks the block size is `ceil(N / R)`; rank `r`
//! owns `[r * block, min(N, (r + 1) * block))`. Ranks past the last
//! non-empty block get empty shards, so `N = 0` and `N < R` need no special
//! handling by callers.

use std::num::NonZeroUsize;
use std::ops::Range;

use crate::batch::{Payload, WorkItem};

/// Index range owned by each rank, in rank order.
pub fn shard_ranges(n: usize, rank_count: NonZeroUsize) -> Vec<Range<usize>> {
    let ranks = rank_count.get();
    let block = n.div_ceil(ranks);
    (0..ranks)
        .map(|r| {
            let start = (r * block).min(n);
            let end = ((r + 1) * block).min(n);
            start..end
        })
        .collect()
}

/// Split `payloads` into one shard per rank, tagging each item with its
/// position in the input.
pub fn partition(payloads: Vec<Payload>, rank_count: NonZeroUsize) -> Vec<Vec<WorkItem>> {
    let ranges = shard_ranges(payloads.len(), rank_count);
    let mut items = payloads
        .into_iter()
        .enumerate()
        .map(|(original_index, payload)| WorkItem {
            original_index,
            payload,
        });
    ranges
        .into_iter()
        .map(|range| items.by_ref().take(range.len()).collect())
        .collect()
}
