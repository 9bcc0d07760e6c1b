// MIT License
// Copyright 2023--present dpot developers

//! # dpot-core
//!
//! Rank-partitioned evaluation of potential energy surfaces.
//!
//! A [`Session`] brings up a fixed pool of ranks: rank 0 is the caller, ranks
//! `1..R` are worker threads. Each call splits a batch of configurations into
//! contiguous per-rank shards, evaluates the shards in parallel, and gathers
//! the results back in input order. A configuration that fails inside the
//! potential yields an inline [`EvaluationError`] without failing the round;
//! a rank that drops out of a round aborts the whole session.
//!
//! ```no_run
//! use dpot_core::{Batch, Evaluation, PotentialFn, Session, SessionConfig};
//!
//! let harmonic = PotentialFn::new(|x: &[f64]| {
//!     let e = 0.5 * x.iter().map(|v| v * v).sum::<f64>();
//!     Ok(Evaluation::with_gradient(e, x.to_vec()))
//! });
//! let mut session = Session::with_potential(&SessionConfig::default().with_ranks(4), harmonic)?;
//! let batch = Batch::from_rows(vec![vec![0.0, 1.0], vec![2.0, 0.0]])?;
//! for outcome in session.call_potential_distributed(&batch)? {
//!     println!("{:?}", outcome.map(|e| e.energy));
//! }
//! session.teardown();
//! # Ok::<(), dpot_core::DpotError>(())
//! ```
//!
//! The same operations are exported to C (see [`c_api`]), with batches and
//! results passed as DLPack tensors.

#![allow(non_camel_case_types)]

pub mod batch;
pub mod c_api;
pub(crate) mod comm;
pub mod config;
pub mod error;
pub mod evaluator;
pub mod logging;
pub mod partition;
pub mod pool;
pub mod potential;
pub mod session;
pub mod status;
pub mod tensor;
pub mod types;

pub use batch::{
    Batch, Configuration, Evaluation, EvaluationError, EvaluationResult, GroupOutcome,
    ItemOutcome, Outcome, Output, Payload, WorkItem,
};
pub use comm::Delivery;
pub use config::{DeliveryMode, SessionConfig};
pub use error::{DpotError, Result};
pub use evaluator::CollectiveEvaluator;
pub use partition::{partition, shard_ranges};
pub use pool::RankPool;
pub use potential::{CallbackPotential, Potential, PotentialFn};
pub use session::{Session, SessionInfo};
