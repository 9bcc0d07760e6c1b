// MIT License
// Copyright 2023--present dpot developers

//! Session configuration.
//!
//! Values come from code (builder methods) or from `DPOT_`-prefixed
//! environment variables:
//!
//! | Variable | Meaning | Default |
//! |----------|---------|---------|
//! | `DPOT_RANKS` | number of ranks, coordinator included | available parallelism |
//! | `DPOT_DELIVERY` | `broadcast_all` or `coordinator_only` | `broadcast_all` |
//! | `DPOT_ROUND_TIMEOUT_MS` | gather deadline per round | none |
//! | `DPOT_MAX_RANKS` | upper bound on `DPOT_RANKS` | 256 |

use std::num::NonZeroUsize;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{DpotError, Result};
use crate::types::dpot_delivery_t;

/// Who receives the reassembled results of a round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// Every rank ends the round holding the full ordered sequence.
    #[default]
    BroadcastAll,
    /// Only the coordinator receives results.
    CoordinatorOnly,
}

impl From<dpot_delivery_t> for DeliveryMode {
    fn from(d: dpot_delivery_t) -> Self {
        match d {
            dpot_delivery_t::DPOT_BROADCAST_ALL => DeliveryMode::BroadcastAll,
            dpot_delivery_t::DPOT_COORDINATOR_ONLY => DeliveryMode::CoordinatorOnly,
        }
    }
}

fn default_max_ranks() -> usize {
    256
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SessionConfig {
    #[serde(default)]
    pub ranks: Option<usize>,
    #[serde(default)]
    pub delivery: DeliveryMode,
    #[serde(default)]
    pub round_timeout_ms: Option<u64>,
    #[serde(default = "default_max_ranks")]
    pub max_ranks: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ranks: None,
            delivery: DeliveryMode::default(),
            round_timeout_ms: None,
            max_ranks: default_max_ranks(),
        }
    }
}

impl SessionConfig {
    /// Read `DPOT_*` variables from the process environment.
    pub fn from_env() -> Result<Self> {
        Ok(envy::prefixed("DPOT_").from_env::<Self>()?)
    }

    /// Read `DPOT_*` variables from explicit key/value pairs.
    pub fn from_vars<I>(vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        Ok(envy::prefixed("DPOT_").from_iter::<_, Self>(vars)?)
    }

    pub fn with_ranks(mut self, ranks: usize) -> Self {
        self.ranks = Some(ranks);
        self
    }

    pub fn with_delivery(mut self, delivery: DeliveryMode) -> Self {
        self.delivery = delivery;
        self
    }

    pub fn with_round_timeout(mut self, timeout: Duration) -> Self {
        self.round_timeout_ms = Some(timeout.as_millis().min(u64::MAX as u128) as u64);
        self
    }

    pub fn round_timeout(&self) -> Option<Duration> {
        self.round_timeout_ms.map(Duration::from_millis)
    }

    /// Resolve the rank count, falling back to the machine's parallelism.
    pub fn resolve_ranks(&self) -> Result<NonZeroUsize> {
        let requested = match self.ranks {
            Some(n) => n,
            None => std::thread::available_parallelism().map_or(1, NonZeroUsize::get),
        };
        let ranks = NonZeroUsize::new(requested).ok_or_else(|| {
            DpotError::Initialization("rank count must be at least 1".into())
        })?;
        if ranks.get() > self.max_ranks {
            return Err(DpotError::Initialization(format!(
                "requested {ranks} ranks, at most {} are available",
                self.max_ranks
            )));
        }
        Ok(ranks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults_broadcast_to_all_ranks() {
        let cfg = SessionConfig::default();
        assert_eq!(cfg.delivery, DeliveryMode::BroadcastAll);
        assert_eq!(cfg.round_timeout(), None);
        assert_eq!(cfg.max_ranks, 256);
    }

    #[test]
    fn empty_environment_gives_defaults() {
        let cfg = SessionConfig::from_vars(Vec::new()).unwrap();
        assert_eq!(cfg, SessionConfig::default());
    }

    #[test]
    fn reads_prefixed_variables() {
        let cfg = SessionConfig::from_vars(vars(&[
            ("DPOT_RANKS", "4"),
            ("DPOT_DELIVERY", "coordinator_only"),
            ("DPOT_ROUND_TIMEOUT_MS", "1500"),
            ("DPOT_MAX_RANKS", "8"),
            ("UNRELATED", "x"),
        ]))
        .unwrap();
        assert_eq!(cfg.ranks, Some(4));
        assert_eq!(cfg.delivery, DeliveryMode::CoordinatorOnly);
        assert_eq!(cfg.round_timeout(), Some(Duration::from_millis(1500)));
        assert_eq!(cfg.max_ranks, 8);
    }

    #[test]
    fn bad_delivery_is_config_error() {
        let err = SessionConfig::from_vars(vars(&[("DPOT_DELIVERY", "sometimes")])).unwrap_err();
        assert!(matches!(err, DpotError::Config(_)));
    }

    #[test]
    fn resolve_rejects_zero_and_oversubscription() {
        let zero = SessionConfig::default().with_ranks(0);
        assert!(matches!(zero.resolve_ranks(), Err(DpotError::Initialization(_))));

        let mut big = SessionConfig::default().with_ranks(9);
        big.max_ranks = 8;
        assert!(matches!(big.resolve_ranks(), Err(DpotError::Initialization(_))));

        let ok = SessionConfig::default().with_ranks(3);
        assert_eq!(ok.resolve_ranks().unwrap().get(), 3);
    }

    #[test]
    fn unset_ranks_uses_machine_parallelism() {
        let cfg = SessionConfig::default();
        assert!(cfg.resolve_ranks().unwrap().get() >= 1);
    }

    #[test]
    fn delivery_converts_from_c_enum() {
        assert_eq!(
            DeliveryMode::from(dpot_delivery_t::DPOT_COORDINATOR_ONLY),
            DeliveryMode::CoordinatorOnly
        );
        assert_eq!(
            DeliveryMode::from(dpot_delivery_t::DPOT_BROADCAST_ALL),
            DeliveryMode::BroadcastAll
        );
    }
}
