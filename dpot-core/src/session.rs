// MIT License
// Copyright 2023--present dpot developers

//! The session handle: owns the rank pool for its lifetime and is the entry
//! point for every evaluation.
//!
//! A [`Session`] is rank 0. It is active from [`Session::initialize`] until
//! [`Session::teardown`] or until a round fails with a fatal error, after
//! which every call returns [`DpotError::NotInitialized`].

use std::sync::Arc;

use tracing::{error, info};

use crate::batch::{Batch, Configuration, GroupOutcome, Outcome};
use crate::comm::Delivery;
use crate::config::SessionConfig;
use crate::error::{DpotError, Result};
use crate::evaluator::CollectiveEvaluator;
use crate::pool::RankPool;
use crate::potential::Potential;

/// What [`Session::info`] reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionInfo {
    pub rank_count: usize,
    pub this_rank: usize,
}

pub struct Session {
    pool: Option<RankPool>,
    evaluator: CollectiveEvaluator,
}

impl Session {
    /// Bring up the rank pool described by `config`.
    pub fn initialize(config: &SessionConfig, potential: Arc<dyn Potential>) -> Result<Self> {
        let ranks = config.resolve_ranks()?;
        let pool = RankPool::spawn(ranks, potential)?;
        let evaluator = CollectiveEvaluator::new(config.delivery, config.round_timeout());
        info!(
            ranks = ranks.get(),
            delivery = ?config.delivery,
            round_timeout = ?config.round_timeout(),
            "session started"
        );
        Ok(Self {
            pool: Some(pool),
            evaluator,
        })
    }

    /// Shorthand for [`Session::initialize`] with a Rust potential.
    pub fn with_potential<P>(config: &SessionConfig, potential: P) -> Result<Self>
    where
        P: Potential + 'static,
    {
        Self::initialize(config, Arc::new(potential))
    }

    pub fn is_active(&self) -> bool {
        self.pool.is_some()
    }

    pub fn info(&self) -> Result<SessionInfo> {
        let pool = self.pool.as_ref().ok_or(DpotError::NotInitialized)?;
        Ok(SessionInfo {
            rank_count: pool.rank_count().get(),
            this_rank: 0,
        })
    }

    /// Evaluate one configuration.
    pub fn call_potential(&mut self, configuration: &Configuration) -> Result<Outcome> {
        let evaluator = self.evaluator;
        self.run(|pool| evaluator.evaluate_one(pool, configuration))
    }

    /// Evaluate every configuration of `batch`, spread across the ranks.
    /// `result[i]` belongs to `batch[i]`.
    pub fn call_potential_distributed(&mut self, batch: &Batch) -> Result<Vec<Outcome>> {
        let evaluator = self.evaluator;
        self.run(|pool| evaluator.evaluate(pool, batch))
    }

    /// Evaluate whole groups: one potential call per group, groups spread
    /// across the ranks.
    pub fn call_potential_vectorized(&mut self, groups: &[Batch]) -> Result<Vec<GroupOutcome>> {
        let evaluator = self.evaluator;
        self.run(|pool| evaluator.evaluate_groups(pool, groups))
    }

    /// The sequence worker `rank` received in the latest broadcast.
    pub fn delivered(&self, rank: usize) -> Option<Delivery> {
        self.pool.as_ref().and_then(|p| p.delivered(rank))
    }

    /// Stop every rank. Safe to call any number of times.
    pub fn teardown(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.shutdown();
            info!("session closed");
        }
    }

    fn run<T, F>(&mut self, round: F) -> Result<T>
    where
        F: FnOnce(&mut RankPool) -> Result<T>,
    {
        let pool = self.pool.as_mut().ok_or(DpotError::NotInitialized)?;
        let result = round(pool);
        if let Err(e) = &result {
            if e.is_fatal() {
                error!(error = %e, "round failed, aborting session");
                if let Some(pool) = self.pool.take() {
                    pool.abort();
                }
            }
        }
        result
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{Evaluation, EvaluationError, Output};
    use crate::config::DeliveryMode;
    use crate::potential::PotentialFn;
    use approx::assert_relative_eq;
    use std::time::{Duration, Instant};

    fn harmonic() -> impl Potential {
        PotentialFn::new(|x: &[f64]| {
            let energy = 0.5 * x.iter().map(|v| v * v).sum::<f64>();
            Ok(Evaluation::with_gradient(energy, x.to_vec()))
        })
    }

    fn session(ranks: usize) -> Session {
        Session::with_potential(&SessionConfig::default().with_ranks(ranks), harmonic()).unwrap()
    }

    fn rows(n: usize) -> Batch {
        Batch::from_rows((0..n).map(|i| vec![i as f64, 1.0])).unwrap()
    }

    #[test]
    fn info_reports_coordinator_view() {
        let s = session(3);
        assert!(s.is_active());
        assert_eq!(
            s.info().unwrap(),
            SessionInfo {
                rank_count: 3,
                this_rank: 0
            }
        );
    }

    #[test]
    fn initialize_rejects_zero_ranks() {
        let err = Session::with_potential(&SessionConfig::default().with_ranks(0), harmonic())
            .err()
            .unwrap();
        assert!(matches!(err, DpotError::Initialization(_)));
    }

    #[test]
    fn initialize_rejects_more_ranks_than_allowed() {
        let mut cfg = SessionConfig::default().with_ranks(5);
        cfg.max_ranks = 4;
        let err = Session::with_potential(&cfg, harmonic()).err().unwrap();
        assert!(matches!(err, DpotError::Initialization(_)));
    }

    #[test]
    fn call_potential_returns_energy_and_gradient() {
        let mut s = session(2);
        let e = s
            .call_potential(&Configuration::from(vec![1.0, 2.0]))
            .unwrap()
            .unwrap();
        assert_relative_eq!(e.energy, 2.5);
        assert_eq!(e.gradient, Some(vec![1.0, 2.0]));
    }

    #[test]
    fn distributed_preserves_order() {
        let mut s = session(3);
        let out = s.call_potential_distributed(&rows(7)).unwrap();
        assert_eq!(out.len(), 7);
        for (i, o) in out.iter().enumerate() {
            let x = i as f64;
            assert_relative_eq!(o.as_ref().unwrap().energy, 0.5 * (x * x + 1.0));
        }
    }

    #[test]
    fn four_items_two_ranks_failure_at_two() {
        let pot = PotentialFn::new(|x: &[f64]| {
            if x[0] == 2.0 {
                Err("overlapping atoms".into())
            } else {
                Ok(Evaluation::energy(x[0]))
            }
        });
        let mut s = Session::with_potential(&SessionConfig::default().with_ranks(2), pot).unwrap();
        let out = s.call_potential_distributed(&rows(4)).unwrap();
        assert_eq!(out.len(), 4);
        assert!(out[0].is_ok() && out[1].is_ok() && out[3].is_ok());
        assert_eq!(
            out[2],
            Err(EvaluationError {
                original_index: 2,
                message: "overlapping atoms".into()
            })
        );
        // the round completed, so the session is still usable
        assert!(s.is_active());
        assert_eq!(s.call_potential_distributed(&rows(1)).unwrap().len(), 1);
    }

    #[test]
    fn empty_batch_on_three_ranks() {
        let mut s = session(3);
        assert!(s.call_potential_distributed(&Batch::empty(2)).unwrap().is_empty());
    }

    #[test]
    fn one_item_on_four_ranks() {
        let mut s = session(4);
        let out = s.call_potential_distributed(&rows(1)).unwrap();
        assert_eq!(out.len(), 1);
        assert_relative_eq!(out[0].as_ref().unwrap().energy, 0.5);
    }

    #[test]
    fn vectorized_returns_one_outcome_per_group() {
        let mut s = session(2);
        let groups = rows(5).chunks(2).unwrap();
        let out = s.call_potential_vectorized(&groups).unwrap();
        let sizes: Vec<usize> = out.iter().map(|g| g.as_ref().unwrap().len()).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
        assert_relative_eq!(out[2].as_ref().unwrap()[0].energy, 8.5);
    }

    #[test]
    fn teardown_twice_is_a_noop() {
        let mut s = session(3);
        s.teardown();
        assert!(!s.is_active());
        s.teardown();
        assert!(!s.is_active());
    }

    #[test]
    fn calls_after_teardown_are_not_initialized() {
        let mut s = session(2);
        s.teardown();
        assert!(matches!(s.info(), Err(DpotError::NotInitialized)));
        assert!(matches!(
            s.call_potential(&Configuration::from(vec![0.0])),
            Err(DpotError::NotInitialized)
        ));
        assert!(matches!(
            s.call_potential_distributed(&rows(2)),
            Err(DpotError::NotInitialized)
        ));
        assert!(matches!(
            s.call_potential_vectorized(&[rows(2)]),
            Err(DpotError::NotInitialized)
        ));
    }

    #[test]
    fn broadcast_all_is_the_default_delivery() {
        assert_eq!(SessionConfig::default().delivery, DeliveryMode::BroadcastAll);

        let mut s = session(3);
        let out = s.call_potential_distributed(&rows(4)).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        for rank in 1..3 {
            let d = loop {
                if let Some(d) = s.delivered(rank) {
                    break d;
                }
                assert!(Instant::now() < deadline, "rank {rank} got no delivery");
                std::thread::sleep(Duration::from_millis(1));
            };
            assert_eq!(d.results.len(), out.len());
            match &d.results[3] {
                Ok(Output::Single(e)) => assert_relative_eq!(e.energy, 5.0),
                other => panic!("unexpected delivery {other:?}"),
            }
        }
    }

    #[test]
    fn coordinator_only_delivers_nothing() {
        let cfg = SessionConfig::default()
            .with_ranks(3)
            .with_delivery(DeliveryMode::CoordinatorOnly);
        let mut s = Session::with_potential(&cfg, harmonic()).unwrap();
        s.call_potential_distributed(&rows(4)).unwrap();
        s.call_potential_distributed(&rows(4)).unwrap();
        assert!(s.delivered(1).is_none());
        assert!(s.delivered(2).is_none());
    }

    #[test]
    fn timeout_aborts_the_session() {
        let slow = PotentialFn::new(|x: &[f64]| {
            if x[0] >= 1.0 {
                std::thread::sleep(Duration::from_millis(300));
            }
            Ok(Evaluation::energy(0.0))
        });
        let cfg = SessionConfig::default()
            .with_ranks(2)
            .with_round_timeout(Duration::from_millis(30));
        let mut s = Session::with_potential(&cfg, slow).unwrap();
        let err = s.call_potential_distributed(&rows(2)).unwrap_err();
        assert!(matches!(err, DpotError::RoundTimeout { .. }));
        assert!(!s.is_active());
        assert!(matches!(s.info(), Err(DpotError::NotInitialized)));
    }

    #[test]
    fn departed_rank_aborts_the_session() {
        let mut s = session(3);
        if let Some(pool) = s.pool.as_mut() {
            pool.sever(2);
        }
        let err = s.call_potential_distributed(&rows(6)).unwrap_err();
        assert!(matches!(err, DpotError::Protocol { .. }));
        assert!(!s.is_active());
        s.teardown();
    }
}
