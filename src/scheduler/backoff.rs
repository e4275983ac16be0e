//! Per-key exponential backoff.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use super::ObjectKey;

/// Delay before retry number `attempt` (0-based): `base * 2^attempt`, capped at `max`.
pub fn delay_for(base: Duration, max: Duration, attempt: u32) -> Duration {
    let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
    base.checked_mul(factor).unwrap_or(max).min(max)
}

/// Tracks consecutive failures per key.
#[derive(Debug)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    failures: Mutex<HashMap<ObjectKey, u32>>,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Record a failure of `key` and return how long to wait before retrying.
    pub fn next_delay(&self, key: &ObjectKey) -> Duration {
        let mut failures = match self.failures.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let attempt = failures.entry(key.clone()).or_insert(0);
        let delay = delay_for(self.base, self.max, *attempt);
        *attempt = attempt.saturating_add(1);
        delay
    }

    /// Forget the failures of `key`.
    pub fn reset(&self, key: &ObjectKey) {
        let mut failures = match self.failures.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        failures.remove(key);
    }
}
