//! Bounded retry with exponential backoff, independent of trading logic.

use std::fmt::Display;
use std::time::Duration;

use backoff::ExponentialBackoffBuilder;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Longest single backoff delay a configuration may ask for.
pub const MAX_RETRY_INTERVAL_MS: u64 = 1_000;

/// Most attempts a configuration may ask for.
pub const MAX_RETRY_ATTEMPTS: u32 = 10;

/// Retry budget for a single read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,

    /// Delay before the second attempt (milliseconds)
    pub initial_interval_ms: u64,

    /// Upper bound on any single delay (milliseconds)
    pub max_interval_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_interval_ms: 25,
            max_interval_ms: 200,
        }
    }
}

/// Run `op` until it succeeds or `policy.max_attempts` is spent.
///
/// Returns the last error when the budget runs out. Blocks the calling
/// thread between attempts: the engine core is synchronous and runs inline
/// on the feed task, so a retrying read stalls that feed (and its shutdown
/// check) for at most `max_attempts - 1` delays of `max_interval_ms`, which
/// `EngineConfig::validate` keeps under the limits above.
pub fn retry_with_backoff<T, E, F>(policy: &RetryPolicy, label: &str, mut op: F) -> Result<T, E>
where
    E: Display,
    F: FnMut() -> Result<T, E>,
{
    let max_attempts = policy.max_attempts.max(1);
    let schedule = ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_millis(policy.initial_interval_ms))
        .with_max_interval(Duration::from_millis(policy.max_interval_ms))
        .with_max_elapsed_time(None)
        .build();

    let mut attempt = 0u32;
    let result = backoff::retry(schedule, || {
        attempt += 1;
        op().map_err(|err| {
            if attempt >= max_attempts {
                backoff::Error::permanent(err)
            } else {
                debug!(label, attempt, error = %err, "Retrying");
                backoff::Error::transient(err)
            }
        })
    });

    result.map_err(|err| match err {
        backoff::Error::Permanent(err) => err,
        backoff::Error::Transient { err, .. } => err,
    })
}
