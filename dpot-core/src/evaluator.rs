// MIT License
// Copyright 2023--present dpot developers

//! One collective evaluation round.
//!
//! 1. partition the payloads into one contiguous shard per rank;
//! 2. scatter shards `1..R` to the worker ranks;
//! 3. evaluate shard 0 on the coordinator while the workers evaluate theirs;
//! 4. gather one reply per worker rank;
//! 5. reassemble by `original_index`;
//! 6. under [`DeliveryMode::BroadcastAll`], broadcast the ordered result.
//!
//! Potential failures never leave a rank's shard loop: they come back as
//! per-item [`EvaluationError`](crate::batch::EvaluationError)s and the round
//! completes. Only participation failures fail the round, and those are
//! fatal to the session.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, debug_span};

use crate::batch::{
    Batch, Configuration, EvaluationResult, GroupOutcome, ItemOutcome, Outcome, Output, Payload,
};
use crate::comm::Delivery;
use crate::config::DeliveryMode;
use crate::error::{DpotError, Result};
use crate::partition::partition;
use crate::pool::RankPool;
use crate::potential::evaluate_item;

#[derive(Debug, Clone, Copy)]
pub struct CollectiveEvaluator {
    delivery: DeliveryMode,
    round_timeout: Option<Duration>,
}

struct Round {
    id: u64,
    outcomes: Vec<ItemOutcome>,
}

impl CollectiveEvaluator {
    pub fn new(delivery: DeliveryMode, round_timeout: Option<Duration>) -> Self {
        Self {
            delivery,
            round_timeout,
        }
    }

    pub fn delivery(&self) -> DeliveryMode {
        self.delivery
    }

    /// Single mode: one work item per configuration.
    pub fn evaluate(&self, pool: &mut RankPool, batch: &Batch) -> Result<Vec<Outcome>> {
        self.evaluate_singles(pool, batch).map(|(_, outcomes)| outcomes)
    }

    /// As [`evaluate`](Self::evaluate), also returning the round id.
    fn evaluate_singles(&self, pool: &mut RankPool, batch: &Batch) -> Result<(u64, Vec<Outcome>)> {
        let payloads = batch.iter().cloned().map(Payload::Single).collect();
        let round = self.run(pool, payloads)?;
        let id = round.id;
        let outcomes: Vec<Outcome> = round
            .outcomes
            .into_iter()
            .map(|o| match o {
                Ok(Output::Single(e)) => Ok(Ok(e)),
                Ok(Output::Group(_)) => Err(DpotError::protocol(id, "group output for a single item")),
                Err(e) => Ok(Err(e)),
            })
            .collect::<Result<_>>()?;
        Ok((id, outcomes))
    }

    /// Vectorized mode: one work item per group, one potential call per group.
    pub fn evaluate_groups(&self, pool: &mut RankPool, groups: &[Batch]) -> Result<Vec<GroupOutcome>> {
        let payloads = groups.iter().cloned().map(Payload::Group).collect();
        let round = self.run(pool, payloads)?;
        let id = round.id;
        round
            .outcomes
            .into_iter()
            .map(|o| match o {
                Ok(Output::Group(v)) => Ok(Ok(v)),
                Ok(Output::Single(_)) => Err(DpotError::protocol(id, "single output for a group")),
                Err(e) => Ok(Err(e)),
            })
            .collect()
    }

    /// Convenience wrapper: a batch of size one.
    pub fn evaluate_one(&self, pool: &mut RankPool, configuration: &Configuration) -> Result<Outcome> {
        let batch = Batch::new(configuration.dim(), vec![configuration.clone()])?;
        let (round, outcomes) = self.evaluate_singles(pool, &batch)?;
        sole_outcome(round, outcomes)
    }

    fn run(&self, pool: &mut RankPool, payloads: Vec<Payload>) -> Result<Round> {
        let n = payloads.len();
        let id = pool.begin_round();
        let started = Instant::now();
        let span = debug_span!("round", round = id, items = n, ranks = pool.rank_count().get());
        let _guard = span.enter();

        let mut shards = partition(payloads, pool.rank_count()).into_iter();
        let own = shards.next().unwrap_or_default();
        pool.link().scatter(id, shards)?;

        let mut results: Vec<EvaluationResult> = own
            .into_iter()
            .map(|item| evaluate_item(pool.potential(), item))
            .collect();
        results.extend(pool.link().gather(id, started, self.round_timeout)?);

        let outcomes = reassemble(id, n, results)?;
        if self.delivery == DeliveryMode::BroadcastAll {
            let delivery = Delivery {
                round: id,
                results: Arc::from(outcomes.as_slice()),
            };
            pool.link().broadcast(&delivery)?;
        }

        let failed = outcomes.iter().filter(|o| o.is_err()).count();
        debug!(failed, elapsed = ?started.elapsed(), "round complete");
        Ok(Round { id, outcomes })
    }
}

/// The only outcome of a one-item round.
fn sole_outcome(round: u64, outcomes: Vec<Outcome>) -> Result<Outcome> {
    let count = outcomes.len();
    let mut outcomes = outcomes.into_iter();
    match (outcomes.next(), count) {
        (Some(outcome), 1) => Ok(outcome),
        _ => Err(DpotError::protocol(
            round,
            format!("one-item round returned {count} results"),
        )),
    }
}

/// Place every result at its original index. Each index in `0..n` must be
/// covered exactly once.
fn reassemble(round: u64, n: usize, results: Vec<EvaluationResult>) -> Result<Vec<ItemOutcome>> {
    let mut slots: Vec<Option<ItemOutcome>> = (0..n).map(|_| None).collect();
    for r in results {
        let slot = slots.get_mut(r.original_index).ok_or_else(|| {
            DpotError::protocol(round, format!("result for unknown item {}", r.original_index))
        })?;
        if slot.replace(r.outcome).is_some() {
            return Err(DpotError::protocol(
                round,
                format!("duplicate result for item {}", r.original_index),
            ));
        }
    }
    slots
        .into_iter()
        .enumerate()
        .map(|(i, slot)| {
            slot.ok_or_else(|| DpotError::protocol(round, format!("no result for item {i}")))
        })
        .collect()
}
