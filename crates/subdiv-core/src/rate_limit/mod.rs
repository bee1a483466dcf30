//! Per-service request budget for outbound generation calls.
//!
//! Each named service gets a rolling window of `max_requests` per
//! `window_secs` plus an optional daily quota. Every caller, including
//! concurrent batch variants, must pass through the same limiter instance
//! for the budget to hold.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// What `acquire` does when the window is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcquireMode {
    /// Sleep until a slot frees up.
    #[default]
    Block,
    /// Return [`RateLimitExceeded::RetryAfter`] immediately.
    FailFast,
}

/// Budget for one service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub window_secs: u64,
    /// Requests allowed per rolling 24h; `None` means unlimited.
    pub daily_quota: Option<u32>,
    pub mode: AcquireMode,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 10,
            window_secs: 60,
            daily_quota: None,
            mode: AcquireMode::Block,
        }
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// Why a slot could not be granted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RateLimitExceeded {
    /// The window is full; a slot frees up after `retry_after`.
    #[error("rate limit for {service} reached; next slot in {retry_after:?}")]
    RetryAfter {
        service: String,
        retry_after: Duration,
    },

    /// Nothing more today; callers should surface this to the user.
    #[error("daily quota of {quota} requests exhausted for {service}")]
    DailyQuotaExhausted { service: String, quota: u32 },

    /// `max_requests` is zero, so no slot will ever open.
    #[error("no request budget configured for {service}")]
    NoBudget { service: String },
}

/// Proof that a call was admitted under the budget.
#[derive(Debug, Clone)]
pub struct Permit {
    pub service: String,
    pub granted_at: Instant,
    /// Monotonic per-service admission counter (1-based).
    pub sequence: u64,
}

#[derive(Debug)]
struct Window {
    recent: VecDeque<Instant>,
    day_started: Instant,
    day_count: u32,
    admitted: u64,
}

impl Window {
    fn new(now: Instant) -> Self {
        Self {
            recent: VecDeque::new(),
            day_started: now,
            day_count: 0,
            admitted: 0,
        }
    }
}

/// Sliding-window rate limiter keyed by service name.
#[derive(Debug, Default)]
pub struct RateLimiter {
    default_config: RateLimitConfig,
    overrides: HashMap<String, RateLimitConfig>,
    windows: Mutex<HashMap<String, Window>>,
}

impl RateLimiter {
    pub fn new(default_config: RateLimitConfig) -> Self {
        Self {
            default_config,
            overrides: HashMap::new(),
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Use a dedicated budget for `service` instead of the default.
    pub fn with_service(mut self, service: impl Into<String>, config: RateLimitConfig) -> Self {
        self.overrides.insert(service.into(), config);
        self
    }

    pub fn config_for(&self, service: &str) -> &RateLimitConfig {
        self.overrides.get(service).unwrap_or(&self.default_config)
    }

    /// Acquire a slot for `service`, honouring the configured [`AcquireMode`].
    pub async fn acquire(&self, service: &str) -> Result<Permit, RateLimitExceeded> {
        loop {
            match self.try_acquire(service) {
                Ok(permit) => return Ok(permit),
                Err(RateLimitExceeded::RetryAfter { retry_after, .. })
                    if self.config_for(service).mode == AcquireMode::Block =>
                {
                    tracing::debug!(
                        service,
                        wait_ms = retry_after.as_millis() as u64,
                        "rate limit window full, waiting"
                    );
                    tokio::time::sleep(retry_after).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Admit a call now or report how long until one would be admitted.
    pub fn try_acquire(&self, service: &str) -> Result<Permit, RateLimitExceeded> {
        let config = self.config_for(service);
        if config.max_requests == 0 {
            return Err(RateLimitExceeded::NoBudget {
                service: service.to_owned(),
            });
        }
        let window_len = config.window();
        let now = Instant::now();

        let mut windows = self.windows.lock();
        let window = windows
            .entry(service.to_owned())
            .or_insert_with(|| Window::new(now));

        if now.duration_since(window.day_started) >= DAY {
            window.day_started = now;
            window.day_count = 0;
        }
        if let Some(quota) = config.daily_quota {
            if window.day_count >= quota {
                return Err(RateLimitExceeded::DailyQuotaExhausted {
                    service: service.to_owned(),
                    quota,
                });
            }
        }

        while let Some(oldest) = window.recent.front() {
            if now.duration_since(*oldest) >= window_len {
                window.recent.pop_front();
            } else {
                break;
            }
        }

        if window.recent.len() >= config.max_requests as usize {
            let retry_after = window
                .recent
                .front()
                .map(|oldest| window_len.saturating_sub(now.duration_since(*oldest)))
                .unwrap_or(window_len);
            return Err(RateLimitExceeded::RetryAfter {
                service: service.to_owned(),
                retry_after,
            });
        }

        window.recent.push_back(now);
        window.day_count += 1;
        window.admitted += 1;
        Ok(Permit {
            service: service.to_owned(),
            granted_at: now,
            sequence: window.admitted,
        })
    }

    /// Calls admitted for `service` inside the current window.
    pub fn in_window(&self, service: &str) -> usize {
        let window_len = self.config_for(service).window();
        let now = Instant::now();
        self.windows
            .lock()
            .get(service)
            .map(|w| {
                w.recent
                    .iter()
                    .filter(|t| now.duration_since(**t) < window_len)
                    .count()
            })
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn config(max_requests: u32, window_secs: u64, mode: AcquireMode) -> RateLimitConfig {
        RateLimitConfig {
            max_requests,
            window_secs,
            daily_quota: None,
            mode,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fail_fast_reports_wait_hint() {
        let limiter = RateLimiter::new(config(2, 10, AcquireMode::FailFast));
        limiter.acquire("gemini").await.unwrap();
        tokio::time::advance(Duration::from_secs(4)).await;
        limiter.acquire("gemini").await.unwrap();

        let err = limiter.acquire("gemini").await.unwrap_err();
        assert_eq!(
            err,
            RateLimitExceeded::RetryAfter {
                service: "gemini".into(),
                retry_after: Duration::from_secs(6),
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn window_slides_open_again() {
        let limiter = RateLimiter::new(config(1, 5, AcquireMode::FailFast));
        limiter.acquire("gemini").await.unwrap();
        assert!(limiter.try_acquire("gemini").is_err());

        tokio::time::advance(Duration::from_secs(5)).await;
        let permit = limiter.try_acquire("gemini").unwrap();
        assert_eq!(permit.sequence, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn blocking_mode_waits_for_slot() {
        let limiter = RateLimiter::new(config(1, 3, AcquireMode::Block));
        let start = Instant::now();
        limiter.acquire("gemini").await.unwrap();
        limiter.acquire("gemini").await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn services_have_independent_budgets() {
        let limiter = RateLimiter::new(config(1, 60, AcquireMode::FailFast))
            .with_service("imagen", config(2, 60, AcquireMode::FailFast));
        limiter.acquire("gemini").await.unwrap();
        limiter.acquire("imagen").await.unwrap();
        limiter.acquire("imagen").await.unwrap();

        assert!(limiter.try_acquire("gemini").is_err());
        assert!(limiter.try_acquire("imagen").is_err());
        assert_eq!(limiter.in_window("imagen"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn daily_quota_is_distinct_from_window_wait() {
        let mut cfg = config(10, 1, AcquireMode::Block);
        cfg.daily_quota = Some(2);
        let limiter = RateLimiter::new(cfg);
        limiter.acquire("gemini").await.unwrap();
        limiter.acquire("gemini").await.unwrap();

        let err = limiter.acquire("gemini").await.unwrap_err();
        assert!(matches!(
            err,
            RateLimitExceeded::DailyQuotaExhausted { quota: 2, .. }
        ));

        tokio::time::advance(DAY).await;
        assert!(limiter.acquire("gemini").await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn zero_budget_fails_instead_of_waiting() {
        let limiter = RateLimiter::new(config(0, 60, AcquireMode::Block));
        let res = tokio::time::timeout(Duration::from_secs(1), limiter.acquire("gemini"))
            .await
            .expect("acquire must not block on an empty budget");
        assert_eq!(
            res.unwrap_err(),
            RateLimitExceeded::NoBudget {
                service: "gemini".into()
            }
        );
        assert_eq!(limiter.in_window("gemini"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_never_exceed_budget() {
        let limiter = Arc::new(RateLimiter::new(config(3, 60, AcquireMode::FailFast)));
        let mut handles = Vec::new();
        for _ in 0..10 {
            let limiter = Arc::clone(&limiter);
            handles.push(tokio::spawn(async move { limiter.acquire("gemini").await }));
        }
        let mut granted = 0;
        for h in handles {
            if h.await.unwrap().is_ok() {
                granted += 1;
            }
        }
        assert_eq!(granted, 3);
        assert_eq!(limiter.in_window("gemini"), 3);
    }
}
