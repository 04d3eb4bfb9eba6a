use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Maximum denied attempts before lockout.
const MAX_FAILURES: u32 = 5;
/// Sliding window over which denials are counted.
const WINDOW: Duration = Duration::from_secs(60);
/// Lockout duration after exceeding MAX_FAILURES.
const LOCKOUT: Duration = Duration::from_secs(300);

struct AttemptRecord {
    failures: u32,
    window_start: Instant,
    locked_until: Option<Instant>,
}

/// Per-identity limiter on verification attempts.
///
/// Only a DENY decision counts as a failure; collaborator or store errors
/// never do. ALLOW clears the counter, STEP_UP leaves it untouched.
pub struct RateLimiter {
    records: HashMap<i64, AttemptRecord>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            records: HashMap::new(),
        }
    }

    /// Whether the user may start a verification attempt right now.
    /// On lockout, returns the remaining seconds.
    pub fn check(&mut self, user_id: i64) -> Result<(), u64> {
        let now = Instant::now();
        let record = self.records.entry(user_id).or_insert(AttemptRecord {
            failures: 0,
            window_start: now,
            locked_until: None,
        });

        if let Some(locked_until) = record.locked_until {
            if now < locked_until {
                return Err(locked_until.duration_since(now).as_secs());
            }
            *record = AttemptRecord {
                failures: 0,
                window_start: now,
                locked_until: None,
            };
        } else if now.duration_since(record.window_start) >= WINDOW {
            record.failures = 0;
            record.window_start = now;
        }

        Ok(())
    }

    /// Count a DENY. May trigger a lockout.
    pub fn record_denial(&mut self, user_id: i64) {
        let now = Instant::now();
        let record = self.records.entry(user_id).or_insert(AttemptRecord {
            failures: 0,
            window_start: now,
            locked_until: None,
        });

        if now.duration_since(record.window_start) >= WINDOW {
            record.failures = 0;
            record.window_start = now;
        }

        record.failures += 1;
        if record.failures >= MAX_FAILURES {
            record.locked_until = Some(now + LOCKOUT);
            tracing::warn!(
                user_id,
                failures = record.failures,
                lockout_secs = LOCKOUT.as_secs(),
                "rate limit triggered — locking user"
            );
        }
    }

    /// An ALLOW clears the failure counter.
    pub fn record_allow(&mut self, user_id: i64) {
        self.records.remove(&user_id);
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_under_limit() {
        let mut rl = RateLimiter::new();
        for _ in 0..4 {
            assert!(rl.check(1).is_ok());
            rl.record_denial(1);
        }
        assert!(rl.check(1).is_ok());
    }

    #[test]
    fn locks_after_max_denials() {
        let mut rl = RateLimiter::new();
        for _ in 0..MAX_FAILURES {
            rl.record_denial(1);
        }
        let remaining = rl.check(1).unwrap_err();
        assert!(remaining > 0);
    }

    #[test]
    fn allow_clears_counter() {
        let mut rl = RateLimiter::new();
        for _ in 0..4 {
            rl.record_denial(1);
        }
        rl.record_allow(1);
        assert!(rl.check(1).is_ok());
    }

    #[test]
    fn users_are_independent() {
        let mut rl = RateLimiter::new();
        for _ in 0..MAX_FAILURES {
            rl.record_denial(1);
        }
        assert!(rl.check(2).is_ok());
        assert!(rl.check(1).is_err());
    }
}
