//! Interval literal parsing.
//!
//! Rate-limit rules accept human-readable interval literals such as
//! `"10s"`, `"1m"`, `"1h30m"`, or a bare number of seconds (`"60"`).
//! Parsed intervals must be positive; anything else is a configuration
//! error surfaced at construction time.

use std::time::Duration;

use crate::error::ConfigError;

/// Parse an interval literal into a [`Duration`].
///
/// Accepted forms:
/// - bare integer: seconds (`"60"` = 1 minute)
/// - one or more `<number><unit>` segments where unit is one of
///   `ms`, `s`, `m`, `h`, `d` (`"1h30m"`, `"250ms"`)
///
/// The total must be a positive duration.
pub fn parse_interval(literal: &str) -> Result<Duration, ConfigError> {
    let s = literal.trim();
    if s.is_empty() {
        return Err(ConfigError::InvalidInterval(literal.to_string()));
    }

    // Bare integer means seconds.
    if s.bytes().all(|b| b.is_ascii_digit()) {
        let secs: u64 = s
            .parse()
            .map_err(|_| ConfigError::InvalidInterval(literal.to_string()))?;
        return positive(Duration::from_secs(secs), literal);
    }

    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let digits_end = rest
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| ConfigError::InvalidInterval(literal.to_string()))?;
        if digits_end == 0 {
            return Err(ConfigError::InvalidInterval(literal.to_string()));
        }
        let value: u64 = rest[..digits_end]
            .parse()
            .map_err(|_| ConfigError::InvalidInterval(literal.to_string()))?;
        rest = &rest[digits_end..];

        let (unit_len, unit_ms) = if rest.starts_with("ms") {
            (2, 1)
        } else if rest.starts_with('s') {
            (1, 1_000)
        } else if rest.starts_with('m') {
            (1, 60_000)
        } else if rest.starts_with('h') {
            (1, 3_600_000)
        } else if rest.starts_with('d') {
            (1, 86_400_000)
        } else {
            return Err(ConfigError::InvalidInterval(literal.to_string()));
        };
        rest = &rest[unit_len..];

        let segment_ms = value
            .checked_mul(unit_ms)
            .ok_or_else(|| ConfigError::InvalidInterval(literal.to_string()))?;
        total = total
            .checked_add(Duration::from_millis(segment_ms))
            .ok_or_else(|| ConfigError::InvalidInterval(literal.to_string()))?;
    }

    positive(total, literal)
}

fn positive(d: Duration, literal: &str) -> Result<Duration, ConfigError> {
    if d.is_zero() {
        Err(ConfigError::InvalidInterval(literal.to_string()))
    } else {
        Ok(d)
    }
}

/// Render an interval the way it appears in storage keys.
///
/// Seconds when the interval is whole seconds (`"60"`), milliseconds
/// otherwise (`"1500ms"`). Keeps keys stable across equivalent literals
/// (`"1m"` and `"60s"` map to the same key segment).
pub fn interval_key_segment(interval: Duration) -> String {
    let ms = interval.as_millis();
    if ms % 1000 == 0 {
        (ms / 1000).to_string()
    } else {
        format!("{ms}ms")
    }
}
