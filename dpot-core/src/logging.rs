// MIT License
// Copyright 2023--present dpot developers

//! Process-wide `tracing` subscriber.
//!
//! The filter comes from `DPOT_LOG` using `EnvFilter` syntax, for example
//! `DPOT_LOG=dpot_core=debug`. Unset or unparsable values fall back to `warn`.

use std::sync::Once;

use tracing_subscriber::{fmt, EnvFilter};

pub const FILTER_ENV: &str = "DPOT_LOG";
const DEFAULT_FILTER: &str = "warn";

static INIT: Once = Once::new();

/// Install the subscriber. Later calls do nothing, and so does the first one
/// if the host application already installed a global subscriber.
pub fn init() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_env(FILTER_ENV)
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
        let _ = fmt()
            .with_env_filter(filter)
            .with_thread_names(true)
            .with_writer(std::io::stderr)
            .try_init();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        init();
        init();
        tracing::debug!("still alive");
    }
}
