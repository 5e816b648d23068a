//! Per-token rate limiting for event ingestion.
//!
//! Each access token is limited with the generic cell rate algorithm (GCRA):
//! the limiter stores one timestamp per token, the *theoretical arrival
//! time* (TAT) of its next request. Requests may arrive up to `burst - 1`
//! emission intervals ahead of the TAT; anything earlier is rejected and told
//! how long to wait.
//!
//! A token whose TAT lies in the past has its full burst available again,
//! which is the same as having no entry, so [`RateLimiter::sweep`] can drop
//! it without a separate idle timeout.
//!
//! The wait is reported in whole seconds for `Retry-After`. The agent retries
//! after `max(retry_delay, Retry-After)`, so a limited agent never comes back
//! before its bucket has room.
//!
//! ```rust
//! use tabpulse_server::rate_limit::{Decision, RateLimiter};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let limiter = RateLimiter::new(1.0, 2);
//!
//! assert!(limiter.check("token-a").is_allowed());
//! assert!(limiter.check("token-a").is_allowed());
//! assert_eq!(limiter.check("token-a"), Decision::Limited { retry_after_secs: 1 });
//! # }
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

/// Default sustained rate per access token, in requests per second.
pub const DEFAULT_RATE: f64 = 2.0;

/// Default number of requests a token may send back to back.
pub const DEFAULT_BURST: u32 = 20;

/// Smallest `Retry-After` the limiter reports.
pub const MIN_RETRY_AFTER_SECS: u64 = 1;

/// Outcome of [`RateLimiter::check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allowed,
    Limited { retry_after_secs: u64 },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }

    /// Seconds to send back in `Retry-After`, if limited.
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            Self::Allowed => None,
            Self::Limited { retry_after_secs } => Some(*retry_after_secs),
        }
    }
}

#[derive(Debug)]
struct Limits {
    /// Time one request "costs".
    interval: Duration,
    /// How far ahead of the TAT a request may arrive.
    tolerance: Duration,
}

/// Shared limiter keyed by access token. Clones share state.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    limits: Arc<Limits>,
    arrivals: Arc<Mutex<HashMap<String, Instant>>>,
}

impl RateLimiter {
    /// Allows `rate` requests per second on average and bursts of `burst`.
    ///
    /// A non-positive rate is treated as one request per second and a zero
    /// burst as one.
    pub fn new(rate: f64, burst: u32) -> Self {
        let rate = if rate > 0.0 { rate } else { 1.0 };
        let interval = Duration::from_secs_f64(1.0 / rate);
        let tolerance = interval * burst.max(1).saturating_sub(1);

        Self {
            limits: Arc::new(Limits { interval, tolerance }),
            arrivals: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn arrivals(&self) -> MutexGuard<'_, HashMap<String, Instant>> {
        self.arrivals.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records a request from `token` if it fits within the limit.
    pub fn check(&self, token: &str) -> Decision {
        let now = Instant::now();
        let Limits { interval, tolerance } = *self.limits;
        let mut arrivals = self.arrivals();

        let tat = arrivals.get(token).map_or(now, |&tat| tat.max(now));
        let allowed_from = tat.checked_sub(tolerance).unwrap_or(now);

        if allowed_from > now {
            let wait = allowed_from - now;
            let retry_after_secs = wait.as_secs_f64().ceil() as u64;
            return Decision::Limited {
                retry_after_secs: retry_after_secs.max(MIN_RETRY_AFTER_SECS),
            };
        }

        arrivals.insert(token.to_string(), tat + interval);
        Decision::Allowed
    }

    /// Drops the state for `token`, e.g. after logout. Returns `true` if the
    /// token had recent requests.
    pub fn forget(&self, token: &str) -> bool {
        self.arrivals().remove(token).is_some()
    }

    /// Removes tokens whose full burst is available again.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut arrivals = self.arrivals();
        let before = arrivals.len();
        arrivals.retain(|_, tat| *tat > now);
        before - arrivals.len()
    }

    /// Number of tokens with limiter state.
    pub fn tracked(&self) -> usize {
        self.arrivals().len()
    }

    /// Runs [`sweep`](Self::sweep) every `every` until the handle is aborted.
    pub fn spawn_sweeper(&self, every: Duration) -> JoinHandle<()> {
        let limiter = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                let removed = limiter.sweep();
                if removed > 0 {
                    debug!(removed, "Swept idle rate limit state");
                }
            }
        })
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_RATE, DEFAULT_BURST)
    }
}
