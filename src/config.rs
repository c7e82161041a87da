//! Runtime configuration.
//!
//! Every knob has a default that matches the behaviour of a plain
//! `node-core script.js` invocation. `RuntimeConfig::from_env` layers
//! `NODE_CORE_*` environment overrides on top of the defaults.

use std::time::Duration;

/// Configuration for a [`Runtime`](crate::runtime::Runtime).
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Number of background threads executing blocking work requests.
    pub worker_threads: usize,
    /// Maximum readiness events collected per reactor wait.
    pub max_events: usize,
    /// Maximum script call depth before a `RangeError` is thrown.
    pub max_call_depth: usize,
    /// External memory (bytes) reported since the last collection that
    /// triggers a garbage collection at the next safe point.
    pub gc_external_threshold: i64,
    /// How long an idle worker parks before re-checking the queue.
    pub worker_park_timeout: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            worker_threads: 4,
            max_events: 1024,
            max_call_depth: 1000,
            gc_external_threshold: 8 * 1024 * 1024,
            worker_park_timeout: Duration::from_millis(10),
        }
    }
}

impl RuntimeConfig {
    /// Defaults overridden by `NODE_CORE_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an explicit variable source.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(n) = parse_var::<usize>(&lookup, "NODE_CORE_WORKERS") {
            if n == 0 {
                tracing::warn!("NODE_CORE_WORKERS must be at least 1, keeping {}", config.worker_threads);
            } else {
                config.worker_threads = n;
            }
        }
        if let Some(n) = parse_var::<usize>(&lookup, "NODE_CORE_MAX_EVENTS") {
            config.max_events = n.max(1);
        }
        if let Some(n) = parse_var::<usize>(&lookup, "NODE_CORE_MAX_CALL_DEPTH") {
            config.max_call_depth = n.max(1);
        }
        if let Some(n) = parse_var::<i64>(&lookup, "NODE_CORE_GC_THRESHOLD") {
            config.gc_external_threshold = n;
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "NODE_CORE_PARK_TIMEOUT_MS") {
            config.worker_park_timeout = Duration::from_millis(ms.max(1));
        }

        config
    }
}

fn parse_var<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!("ignoring invalid value {:?} for {}", raw, key);
            None
        }
    }
}
