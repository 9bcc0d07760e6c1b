// MIT License
// Copyright 2023--present dpot developers

//! Session-level error type.
//!
//! Per-item failures are *not* represented here: they travel inline through a
//! round as [`EvaluationError`](crate::batch::EvaluationError) values. A
//! [`DpotError`] means the call as a whole produced no result.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DpotError {
    /// The session was never initialized, has been torn down, or was aborted
    /// by an earlier fatal round.
    #[error("session is not initialized")]
    NotInitialized,

    /// The rank pool could not be formed.
    #[error("failed to initialize rank pool: {0}")]
    Initialization(String),

    /// A collective step saw mismatched participation.
    #[error("protocol violation in round {round}: {detail}")]
    Protocol { round: u64, detail: String },

    /// The gather step did not complete before the configured deadline.
    #[error("round {round} timed out after {elapsed:?}")]
    RoundTimeout { round: u64, elapsed: Duration },

    /// Caller-supplied configurations do not form a valid batch.
    #[error("invalid batch: {0}")]
    InvalidBatch(String),

    #[error("invalid configuration: {0}")]
    Config(#[from] envy::Error),
}

impl DpotError {
    pub(crate) fn protocol(round: u64, detail: impl Into<String>) -> Self {
        DpotError::Protocol {
            round,
            detail: detail.into(),
        }
    }

    /// Whether this error leaves the session unusable.
    ///
    /// A collective has no safe partial-completion state, so protocol
    /// violations and timeouts tear the whole session down.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DpotError::Protocol { .. } | DpotError::RoundTimeout { .. }
        )
    }
}

pub type Result<T, E = DpotError> = std::result::Result<T, E>;
