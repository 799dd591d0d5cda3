//! Parsing of user-supplied durations and timestamps

use anyhow::{bail, Context, Result};
use chrono::NaiveDateTime;

use crate::Timestamp;

/// Accepted layouts for absolute start times (second resolution).
const TIMESTAMP_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S", "%Y%m%d_%H%M%S"];

/// Parse a duration in whole seconds.
///
/// Accepts a bare number (seconds) or unit-suffixed parts that may be
/// chained: `10`, `10s`, `2m`, `1h`, `1m30s`.
pub fn parse_duration(s: &str) -> Result<u64> {
    let s = s.trim();
    if s.is_empty() {
        bail!("Empty duration string");
    }

    if let Ok(secs) = s.parse::<u64>() {
        return Ok(secs);
    }

    let mut total = 0u64;
    let mut digits = String::new();
    for c in s.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let multiplier = match c {
            's' => 1,
            'm' => 60,
            'h' => 3600,
            'd' => 86400,
            _ => bail!("Invalid duration unit '{}' in '{}'", c, s),
        };
        if digits.is_empty() {
            bail!("Missing number before '{}' in '{}'", c, s);
        }
        let num: u64 = digits.parse().context("Invalid duration number")?;
        total = num
            .checked_mul(multiplier)
            .and_then(|v| total.checked_add(v))
            .context("Duration overflow")?;
        digits.clear();
    }

    if !digits.is_empty() {
        bail!("Trailing number without unit in '{}'", s);
    }

    Ok(total)
}

/// Parse an absolute start time such as `2024-05-01T10:02:00`.
pub fn parse_timestamp(s: &str) -> Result<Timestamp> {
    let s = s.trim();
    for format in TIMESTAMP_FORMATS {
        if let Ok(ts) = NaiveDateTime::parse_from_str(s, format) {
            return Ok(ts);
        }
    }
    bail!("Invalid time '{}'. Use YYYY-MM-DDTHH:MM:SS", s)
}
