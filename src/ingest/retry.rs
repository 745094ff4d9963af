use chrono::{DateTime, Utc};
use rand::Rng;
use reqwest::StatusCode;
use std::time::Duration;

/// Retry policy shared by every outbound ledger request.
///
/// Delay for attempt `n` (0-based) is the server's `Retry-After` hint when one
/// was sent, otherwise `base * 2^n` plus up to 25% jitter, capped at `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
        }
    }

    /// Total attempts including the first request
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt + 1 < self.max_attempts
    }

    pub fn delay_for(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        if let Some(hint) = hint {
            return hint.min(self.max_delay);
        }

        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt.min(16)));
        let jitter_cap = exp.as_millis() as u64 / 4;
        let jitter = if jitter_cap > 0 {
            rand::thread_rng().gen_range(0..=jitter_cap)
        } else {
            0
        };

        (exp + Duration::from_millis(jitter)).min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1), Duration::from_secs(30))
    }
}

/// Statuses worth retrying: rate limiting and gateway hiccups
pub fn is_transient(status: StatusCode) -> bool {
    matches!(status.as_u16(), 429 | 502 | 503 | 504)
}

/// Parse a `Retry-After` value: either delta-seconds or an HTTP date
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }

    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    Some((at - now).to_std().unwrap_or(Duration::ZERO))
}
