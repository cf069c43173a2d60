//! Duration-string parsing for rule fields like `"30s"`, `"3m"`, `"500ms"`.

use std::time::Duration;

/// Parse a duration string with `ms`, `s`, `m`, or `h` suffix.
///
/// A bare number is seconds. Returns `None` on anything else, including
/// zero-length input and negative values.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if let Some(ms) = s.strip_suffix("ms") {
        return ms.parse::<u64>().ok().map(Duration::from_millis);
    }
    if let Some(hours) = s.strip_suffix('h') {
        return hours.parse::<u64>().ok().map(|h| Duration::from_secs(h * 3600));
    }
    if let Some(mins) = s.strip_suffix('m') {
        return mins.parse::<u64>().ok().map(|m| Duration::from_secs(m * 60));
    }
    if let Some(secs) = s.strip_suffix('s') {
        return secs.parse::<u64>().ok().map(Duration::from_secs);
    }
    s.parse::<u64>().ok().map(Duration::from_secs)
}
