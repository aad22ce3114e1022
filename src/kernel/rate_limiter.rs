//! Rate limiting and throttling.
//!
//! Fixed-window admission counter per (process id, message type). Envelopes
//! over the limit are dropped, not queued; callers retry with backoff.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::time::Instant;

use crate::types::{Error, ProcessId, Result};

/// Rate limit window configuration.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Window length. Counters reset when a window rolls over.
    #[serde(with = "humantime_serde")]
    #[schemars(with = "String")]
    pub window: Duration,

    /// Limit for message types without an explicit entry.
    pub default_limit: u32,

    /// Per message type limits.
    pub limits: BTreeMap<String, u32>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(1),
            default_limit: 1000,
            limits: BTreeMap::new(),
        }
    }
}

impl RateLimitConfig {
    pub fn limit_for(&self, message_type: &str) -> u32 {
        self.limits
            .get(message_type)
            .copied()
            .unwrap_or(self.default_limit)
    }
}

/// Counter for the current window.
#[derive(Debug)]
struct FixedWindow {
    started_at: Instant,
    count: u32,
}

impl FixedWindow {
    fn new(now: Instant) -> Self {
        Self {
            started_at: now,
            count: 0,
        }
    }

    /// Check if request is allowed and record it.
    fn check_and_record(&mut self, now: Instant, window: Duration, limit: u32) -> bool {
        if now.duration_since(self.started_at) >= window {
            // Align to window boundaries so bursts straddling a rollover stay bounded.
            let elapsed = now.duration_since(self.started_at);
            let windows = (elapsed.as_nanos() / window.as_nanos().max(1)) as u32;
            self.started_at += window * windows;
            self.count = 0;
        }

        if self.count >= limit {
            return false;
        }
        self.count += 1;
        true
    }
}

/// Rate limiter - enforces per-(process, message type) admission windows.
///
/// NOT a separate actor - owned by the router and called via &mut self.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    windows: HashMap<(ProcessId, String), FixedWindow>,
}

impl RateLimiter {
    pub fn new(config: Option<RateLimitConfig>) -> Self {
        Self {
            config: config.unwrap_or_default(),
            windows: HashMap::new(),
        }
    }

    /// Check the limit for an envelope and record it if admitted.
    pub fn check_rate_limit(&mut self, pid: ProcessId, message_type: &str) -> Result<()> {
        self.check_at(pid, message_type, Instant::now())
    }

    pub(crate) fn check_at(
        &mut self,
        pid: ProcessId,
        message_type: &str,
        now: Instant,
    ) -> Result<()> {
        let limit = self.config.limit_for(message_type);
        let window_len = self.config.window;
        let window = self
            .windows
            .entry((pid, message_type.to_string()))
            .or_insert_with(|| FixedWindow::new(now));

        if window.check_and_record(now, window_len, limit) {
            Ok(())
        } else {
            Err(Error::RateLimited(format!(
                "process {} exceeded {} '{}' messages per {:?}",
                pid, limit, message_type, window_len
            )))
        }
    }

    /// Count admitted in the current window.
    pub fn current_count(&self, pid: ProcessId, message_type: &str) -> u32 {
        self.windows
            .get(&(pid, message_type.to_string()))
            .filter(|w| w.started_at.elapsed() < self.config.window)
            .map_or(0, |w| w.count)
    }

    /// Forget every window of a process (on termination).
    pub fn clear_process(&mut self, pid: ProcessId) {
        self.windows.retain(|(owner, _), _| *owner != pid);
    }

    /// Drop windows that have been idle for a full window. Returns the number dropped.
    pub fn cleanup_expired(&mut self) -> usize {
        let before = self.windows.len();
        let window = self.config.window;
        self.windows
            .retain(|_, w| w.started_at.elapsed() < window * 2);
        before - self.windows.len()
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn limiter(limit: u32, window: Duration) -> RateLimiter {
        let mut limits = BTreeMap::new();
        limits.insert("model.classify".to_string(), limit);
        RateLimiter::new(Some(RateLimitConfig {
            window,
            default_limit: 1000,
            limits,
        }))
    }

    #[tokio::test(start_paused = true)]
    async fn test_exactly_limit_admitted_then_rate_limited() {
        let mut rl = limiter(3, Duration::from_secs(1));
        let pid = ProcessId::new(4);

        for _ in 0..3 {
            rl.check_rate_limit(pid, "model.classify").unwrap();
        }
        let err = rl.check_rate_limit(pid, "model.classify").unwrap_err();
        assert!(matches!(err, Error::RateLimited(_)));
        assert_eq!(rl.current_count(pid, "model.classify"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_admission_resumes_after_rollover() {
        let mut rl = limiter(2, Duration::from_secs(1));
        let pid = ProcessId::new(4);

        rl.check_rate_limit(pid, "model.classify").unwrap();
        rl.check_rate_limit(pid, "model.classify").unwrap();
        assert!(rl.check_rate_limit(pid, "model.classify").is_err());

        tokio::time::advance(Duration::from_millis(1001)).await;

        rl.check_rate_limit(pid, "model.classify").unwrap();
        rl.check_rate_limit(pid, "model.classify").unwrap();
        assert!(rl.check_rate_limit(pid, "model.classify").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_windows_are_per_process_and_type() {
        let mut rl = limiter(1, Duration::from_secs(1));

        rl.check_rate_limit(ProcessId::new(1), "model.classify").unwrap();
        rl.check_rate_limit(ProcessId::new(2), "model.classify").unwrap();
        rl.check_rate_limit(ProcessId::new(1), "model.embed").unwrap();
        assert!(rl.check_rate_limit(ProcessId::new(1), "model.classify").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_expired_and_clear_process() {
        let mut rl = limiter(5, Duration::from_secs(1));
        rl.check_rate_limit(ProcessId::new(1), "a").unwrap();
        rl.check_rate_limit(ProcessId::new(2), "a").unwrap();

        rl.clear_process(ProcessId::new(2));
        assert_eq!(rl.current_count(ProcessId::new(2), "a"), 0);

        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(rl.cleanup_expired(), 1);
    }

    proptest! {
        #[test]
        fn prop_never_more_than_limit_per_window(limit in 1u32..20, attempts in 1usize..60) {
            let mut rl = limiter(limit, Duration::from_secs(60));
            let now = Instant::now();
            let admitted = (0..attempts)
                .filter(|_| rl.check_at(ProcessId::new(9), "model.classify", now).is_ok())
                .count();
            prop_assert_eq!(admitted, attempts.min(limit as usize));
        }
    }
}
