//! Text rendering and parsing for the monitoring/control surface.
//!
//! The transport (sysfs-style attribute, admin API, CLI) lives elsewhere;
//! this module only produces and consumes the attribute text.

use std::fmt::Write as _;

use crate::error::{AdmissionError, AdmissionResult};
use crate::limiter::RateLimiter;

/// One-line limiter status:
/// `wb:<ceiling>/<capacity>(<reserved>) (stop:<<low>/<zone_low>, full:><high>/<zone_high>, free:<free>)`.
pub fn status_line(limiter: &RateLimiter) -> String {
    let stats = limiter.stats();
    format!(
        "wb:{}/{}({}) (stop:<{}/{}, full:>{}/{}, free:{})\n",
        stats.admission_ceiling,
        stats.full_capacity,
        stats.reserved_count,
        stats.low_threshold,
        stats.per_zone_low,
        stats.high_threshold,
        stats.per_zone_high,
        stats.free_blocks,
    )
}

/// One line per zone: `zone(<i>):f=<free>,t=<blocks>,starved=<0|1>`.
pub fn zone_listing(limiter: &RateLimiter) -> String {
    let blocks_per_zone = limiter.geometry().blocks_per_zone;
    let mut out = String::new();
    for (zone, free) in limiter.zone_free_counts().into_iter().enumerate() {
        let starved = limiter.zone_starved(zone as u32).unwrap_or(false);
        let _ = writeln!(
            out,
            "zone({}):f={},t={},starved={}",
            zone,
            free,
            blocks_per_zone,
            u8::from(starved)
        );
    }
    out
}

/// Parses an unsigned attribute value: decimal, `0x` hex or leading-`0`
/// octal, optional leading `+`, at most one trailing newline.
pub fn parse_unsigned(input: &str) -> AdmissionResult<u64> {
    let invalid = |reason| AdmissionError::InvalidControlInput {
        input: input.to_string(),
        reason,
    };

    let body = input.strip_suffix('\n').unwrap_or(input);
    let body = body.strip_prefix('+').unwrap_or(body);
    if body.is_empty() {
        return Err(invalid("empty value"));
    }

    let (digits, radix) = if let Some(hex) = body
        .strip_prefix("0x")
        .or_else(|| body.strip_prefix("0X"))
    {
        (hex, 16)
    } else if body.len() > 1 && body.starts_with('0') {
        (&body[1..], 8)
    } else {
        (body, 10)
    };

    if digits.is_empty() || !digits.chars().all(|c| c.is_digit(radix)) {
        return Err(invalid("not an unsigned integer"));
    }
    u64::from_str_radix(digits, radix).map_err(|_| invalid("value out of range"))
}

/// Applies a textual ceiling override. Returns the number of bytes consumed.
pub fn store_ceiling(limiter: &RateLimiter, input: &str) -> AdmissionResult<usize> {
    let value = parse_unsigned(input)?;
    limiter.set_ceiling(value);
    Ok(input.len())
}
