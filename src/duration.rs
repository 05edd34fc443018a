//! Human-friendly duration parsing for CLI flags.

use std::time::Duration;

/// Parse a duration with an optional unit suffix.
///
/// Accepts `ms`, `s`, `m` and `h`; a bare number is read as seconds.
/// Zero is rejected since it would disable the bound it configures.
///
/// # Example
/// ```
/// use sense_ble_gateway::duration::parse_duration;
/// use std::time::Duration;
///
/// assert_eq!(parse_duration("3s").unwrap(), Duration::from_secs(3));
/// assert_eq!(parse_duration("1m").unwrap(), Duration::from_secs(60));
/// assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
/// ```
pub fn parse_duration(src: &str) -> Result<Duration, String> {
    let src = src.trim();
    if src.is_empty() {
        return Err("empty duration string".to_string());
    }

    // "ms" must be checked before "m" and "s"
    let (number, unit_ms, unit) = if let Some(n) = src.strip_suffix("ms") {
        (n, 1, "milliseconds")
    } else if let Some(n) = src.strip_suffix('h') {
        (n, 3_600_000, "hours")
    } else if let Some(n) = src.strip_suffix('m') {
        (n, 60_000, "minutes")
    } else if let Some(n) = src.strip_suffix('s') {
        (n, 1_000, "seconds")
    } else {
        (src, 1_000, "seconds")
    };

    let value: u64 = number
        .trim()
        .parse()
        .map_err(|_| format!("invalid {unit}: {number}"))?;
    let millis = value
        .checked_mul(unit_ms)
        .ok_or_else(|| format!("duration too large: {src}"))?;

    if millis == 0 {
        return Err("duration must be greater than zero".to_string());
    }

    Ok(Duration::from_millis(millis))
}
