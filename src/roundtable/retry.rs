//! Backoff schedule and retry-hint parsing for the API adapter.
//!
//! Transient backend failures (connect errors, 5xx) are retried on an
//! exponential schedule with jitter.  HTTP 429 responses override the
//! schedule with the server's own hint: the `Retry-After` header when
//! present, otherwise a "try again in 1.5s"-style phrase embedded in the
//! error body, since several gateways only report the wait there.
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use roundtable::retry::{parse_retry_hint, RetryConfig};
//!
//! let schedule = RetryConfig::default();
//! assert_eq!(schedule.max_attempts, 3);
//!
//! let wait = parse_retry_hint("Rate limit reached, try again in 0.5s.");
//! assert_eq!(wait, Some(Duration::from_secs_f64(0.5)));
//! ```

use std::time::Duration;

/// Backoff schedule applied between retry attempts.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Ceiling on any computed delay.
    pub max_delay: Duration,
    /// Exponential growth factor.
    pub multiplier: f64,
    /// Fraction of the delay randomized away to avoid thundering herds
    /// (`0.0..=1.0`).
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl RetryConfig {
    /// Delay before retrying after the given zero-based failed attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_millis() as f64;
        let exp = base * self.multiplier.powi(attempt as i32);
        let capped = exp.min(self.max_delay.as_millis() as f64);
        let jitter_range = capped * self.jitter;
        let jitter = rand::random::<f64>() * jitter_range - jitter_range / 2.0;
        Duration::from_millis((capped + jitter).max(0.0) as u64)
    }
}

/// Parse a `Retry-After` header value carrying a delay in seconds.
///
/// Both integral and fractional second values are accepted; HTTP-date forms
/// are not (callers fall back to the body hint or the backoff schedule).
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let secs: f64 = value.trim().parse().ok()?;
    if secs < 0.0 {
        return None;
    }
    Some(Duration::from_secs_f64(secs))
}

/// Scan an error body for an embedded retry hint such as
/// `"try again in 0.5s"` or `"try again in 750ms"`.
pub fn parse_retry_hint(body: &str) -> Option<Duration> {
    let lower = body.to_lowercase();
    let idx = lower.find("try again in ")?;
    let rest = &lower[idx + "try again in ".len()..];

    let number_end = rest
        .char_indices()
        .find(|(_, c)| !c.is_ascii_digit() && *c != '.')
        .map(|(i, _)| i)
        .unwrap_or(rest.len());
    let value: f64 = rest[..number_end].parse().ok()?;
    let unit = &rest[number_end..];

    if unit.starts_with("ms") {
        Some(Duration::from_secs_f64(value / 1000.0))
    } else if unit.starts_with('s') {
        Some(Duration::from_secs_f64(value))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_grow_and_cap() {
        let config = RetryConfig {
            jitter: 0.0,
            ..RetryConfig::default()
        };
        let d0 = config.delay_for(0);
        let d1 = config.delay_for(1);
        let d2 = config.delay_for(2);
        assert!(d1 > d0);
        assert!(d2 > d1);

        let tight = RetryConfig {
            jitter: 0.0,
            max_delay: Duration::from_millis(800),
            ..RetryConfig::default()
        };
        assert_eq!(tight.delay_for(10), Duration::from_millis(800));
    }

    #[test]
    fn retry_after_header_parses_seconds() {
        assert_eq!(parse_retry_after("2"), Some(Duration::from_secs(2)));
        assert_eq!(
            parse_retry_after(" 0.5 "),
            Some(Duration::from_secs_f64(0.5))
        );
        assert_eq!(parse_retry_after("soon"), None);
        assert_eq!(parse_retry_after("-1"), None);
    }

    #[test]
    fn body_hint_parses_both_units() {
        assert_eq!(
            parse_retry_hint("Rate limit exceeded. Please try again in 0.5s."),
            Some(Duration::from_secs_f64(0.5))
        );
        assert_eq!(
            parse_retry_hint("overloaded, try again in 750ms"),
            Some(Duration::from_secs_f64(0.75))
        );
        assert_eq!(parse_retry_hint("try again later"), None);
        assert_eq!(parse_retry_hint("no hint here"), None);
    }
}
