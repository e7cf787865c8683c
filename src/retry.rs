//! Client retry policy with pluggable backoff.
//!
//! A [`RetryPolicy`] is consulted with each completed response's status
//! code. It answers `None` (do not retry) or a millisecond delay to sleep
//! before re-issuing the request. The policy is stateful through its
//! [`Backoff`], which terminates the sequence after `max_retry` delays.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Status codes that trigger a retry when none are given explicitly:
/// request timeout, too many requests, bad gateway, service unavailable,
/// gateway timeout.
pub const TRIGGER_CODES_DEFAULT: [u16; 5] = [408, 429, 502, 503, 504];

pub const MAX_RETRY_DEFAULT: u32 = 3;
pub const INITIAL_DELAY_DEFAULT: u64 = 1000;

/// A stateful generator of retry delays, terminating with `None`.
pub trait Backoff: Send {
    /// The next delay in milliseconds, or `None` once retries are exhausted.
    fn next(&mut self) -> Option<u64>;
}

/// Decides whether an HTTP status is retried and how long to wait.
///
/// # Examples
/// ```
/// use rivulet::retry::{RetryPolicy, FixedBackoff};
///
/// let mut policy = RetryPolicy::new(FixedBackoff::new(2, 100));
/// assert_eq!(policy.retry(200), None);
/// assert_eq!(policy.retry(503), Some(100));
/// assert_eq!(policy.retry(503), Some(100));
/// assert_eq!(policy.retry(503), None);
/// ```
pub struct RetryPolicy {
    codes: Vec<u16>,
    backoff: Box<dyn Backoff>,
}

impl RetryPolicy {
    pub fn new(backoff: impl Backoff + 'static) -> Self {
        Self {
            codes: TRIGGER_CODES_DEFAULT.to_vec(),
            backoff: Box::new(backoff),
        }
    }

    /// A policy triggering on an explicit code set instead of the default.
    pub fn with_codes(backoff: impl Backoff + 'static, codes: Vec<u16>) -> Self {
        Self {
            codes,
            backoff: Box::new(backoff),
        }
    }

    /// `None` if the status should not be retried, else the delay to sleep.
    pub fn retry(&mut self, status_code: u16) -> Option<u64> {
        if !self.codes.contains(&status_code) {
            return None;
        }
        self.backoff.next()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(FixedBackoff::default())
    }
}

fn jitter(rng: &mut StdRng, value: u64, jitter_pct: u32) -> u64 {
    if jitter_pct == 0 {
        return value;
    }
    let draw = rng.gen_range(-(jitter_pct as i64)..=jitter_pct as i64);
    (value as f64 * (1.0 + draw as f64 / 100.0)) as u64
}

/// Produces the same base delay on every call, with fresh jitter each time.
///
/// # Examples
/// ```
/// use rivulet::retry::{Backoff, FixedBackoff};
///
/// let mut backoff = FixedBackoff::new(2, 250);
/// assert_eq!(backoff.next(), Some(250));
/// assert_eq!(backoff.next(), Some(250));
/// assert_eq!(backoff.next(), None);
/// ```
pub struct FixedBackoff {
    max_retry: u32,
    retries: u32,
    delay_ms: u64,
    jitter_pct: u32,
    rng: StdRng,
}

impl FixedBackoff {
    pub fn new(max_retry: u32, initial_delay_ms: u64) -> Self {
        Self {
            max_retry,
            retries: 0,
            delay_ms: initial_delay_ms,
            jitter_pct: 0,
            rng: StdRng::from_entropy(),
        }
    }

    pub fn jitter_pct(mut self, jitter_pct: u32) -> Self {
        self.jitter_pct = jitter_pct;
        self
    }

    /// Deterministic jitter for tests.
    pub fn seeded(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }
}

impl Default for FixedBackoff {
    fn default() -> Self {
        Self::new(MAX_RETRY_DEFAULT, INITIAL_DELAY_DEFAULT)
    }
}

impl Backoff for FixedBackoff {
    fn next(&mut self) -> Option<u64> {
        if self.retries == self.max_retry {
            return None;
        }
        self.retries += 1;
        Some(jitter(&mut self.rng, self.delay_ms, self.jitter_pct))
    }
}

/// Increases the delay by a fixed step after each produced value.
///
/// # Examples
/// ```
/// use rivulet::retry::{Backoff, LinearBackoff};
///
/// let mut backoff = LinearBackoff::new(3, 100, 50);
/// assert_eq!(backoff.next(), Some(100));
/// assert_eq!(backoff.next(), Some(150));
/// assert_eq!(backoff.next(), Some(200));
/// assert_eq!(backoff.next(), None);
/// ```
pub struct LinearBackoff {
    max_retry: u32,
    retries: u32,
    delay_ms: u64,
    increase_ms: u64,
    jitter_pct: u32,
    rng: StdRng,
}

impl LinearBackoff {
    pub fn new(max_retry: u32, initial_delay_ms: u64, increase_ms: u64) -> Self {
        Self {
            max_retry,
            retries: 0,
            delay_ms: initial_delay_ms,
            increase_ms,
            jitter_pct: 0,
            rng: StdRng::from_entropy(),
        }
    }

    pub fn jitter_pct(mut self, jitter_pct: u32) -> Self {
        self.jitter_pct = jitter_pct;
        self
    }

    pub fn seeded(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }
}

impl Default for LinearBackoff {
    fn default() -> Self {
        Self::new(MAX_RETRY_DEFAULT, INITIAL_DELAY_DEFAULT, INITIAL_DELAY_DEFAULT)
    }
}

impl Backoff for LinearBackoff {
    fn next(&mut self) -> Option<u64> {
        if self.retries == self.max_retry {
            return None;
        }
        self.retries += 1;
        let produced = jitter(&mut self.rng, self.delay_ms, self.jitter_pct);
        self.delay_ms += self.increase_ms;
        Some(produced)
    }
}

/// Multiplies the delay after each produced value.
///
/// # Examples
/// ```
/// use rivulet::retry::{Backoff, ExponentialBackoff};
///
/// let mut backoff = ExponentialBackoff::new(3, 100, 2);
/// assert_eq!(backoff.next(), Some(100));
/// assert_eq!(backoff.next(), Some(200));
/// assert_eq!(backoff.next(), Some(400));
/// assert_eq!(backoff.next(), None);
/// ```
pub struct ExponentialBackoff {
    max_retry: u32,
    retries: u32,
    delay_ms: u64,
    multiplier: u64,
    jitter_pct: u32,
    rng: StdRng,
}

impl ExponentialBackoff {
    pub fn new(max_retry: u32, initial_delay_ms: u64, multiplier: u64) -> Self {
        Self {
            max_retry,
            retries: 0,
            delay_ms: initial_delay_ms,
            multiplier,
            jitter_pct: 0,
            rng: StdRng::from_entropy(),
        }
    }

    pub fn jitter_pct(mut self, jitter_pct: u32) -> Self {
        self.jitter_pct = jitter_pct;
        self
    }

    pub fn seeded(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(MAX_RETRY_DEFAULT, INITIAL_DELAY_DEFAULT, 2)
    }
}

impl Backoff for ExponentialBackoff {
    fn next(&mut self) -> Option<u64> {
        if self.retries == self.max_retry {
            return None;
        }
        self.retries += 1;
        let produced = jitter(&mut self.rng, self.delay_ms, self.jitter_pct);
        self.delay_ms = self.delay_ms.saturating_mul(self.multiplier);
        Some(produced)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_backoff_repeats_then_stops() {
        let mut backoff = FixedBackoff::new(3, 567);
        assert_eq!(backoff.next(), Some(567));
        assert_eq!(backoff.next(), Some(567));
        assert_eq!(backoff.next(), Some(567));
        assert_eq!(backoff.next(), None);
        assert_eq!(backoff.next(), None);
    }

    #[test]
    fn linear_backoff_steps() {
        let mut backoff = LinearBackoff::new(3, 1000, 100);
        assert_eq!(backoff.next(), Some(1000));
        assert_eq!(backoff.next(), Some(1100));
        assert_eq!(backoff.next(), Some(1200));
        assert_eq!(backoff.next(), None);
    }

    #[test]
    fn exponential_backoff_multiplies() {
        let mut backoff = ExponentialBackoff::new(3, 1000, 2);
        assert_eq!(backoff.next(), Some(1000));
        assert_eq!(backoff.next(), Some(2000));
        assert_eq!(backoff.next(), Some(4000));
        assert_eq!(backoff.next(), None);
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let mut backoff = FixedBackoff::new(100, 1000).jitter_pct(10).seeded(12321);
        for _ in 0..100 {
            let delay = backoff.next().unwrap();
            assert!((900..=1100).contains(&delay), "delay {delay} out of bounds");
        }
    }

    #[test]
    fn jitter_is_deterministic_with_a_seed() {
        let collect = || {
            let mut backoff = LinearBackoff::new(5, 1000, 1000).jitter_pct(10).seeded(42);
            std::iter::from_fn(|| backoff.next()).collect::<Vec<_>>()
        };
        assert_eq!(collect(), collect());
    }

    #[test]
    fn default_policy_triggers_on_default_codes() {
        let mut policy = RetryPolicy::default();
        assert_eq!(policy.retry(200), None);

        for code in TRIGGER_CODES_DEFAULT {
            let mut policy = RetryPolicy::default();
            assert_eq!(policy.retry(code), Some(INITIAL_DELAY_DEFAULT), "{code}");
        }
    }

    #[test]
    fn policy_exhausts_after_max_retry() {
        let mut policy = RetryPolicy::default();
        assert_eq!(policy.retry(502), Some(INITIAL_DELAY_DEFAULT));
        assert_eq!(policy.retry(502), Some(INITIAL_DELAY_DEFAULT));
        assert_eq!(policy.retry(502), Some(INITIAL_DELAY_DEFAULT));
        assert_eq!(policy.retry(502), None);
    }

    #[test]
    fn custom_trigger_codes() {
        let mut policy = RetryPolicy::with_codes(LinearBackoff::new(3, 100, 100), vec![1, 2, 3]);
        assert_eq!(policy.retry(200), None);
        assert_eq!(policy.retry(1), Some(100));
        assert_eq!(policy.retry(100), None);
        assert_eq!(policy.retry(2), Some(200));
        assert_eq!(policy.retry(2), Some(300));
        assert_eq!(policy.retry(2), None);
    }
}
