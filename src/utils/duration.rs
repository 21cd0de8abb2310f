use std::time::Duration;

/// Parse a compound duration string: `"300ms"`, `"10s"`, `"5m"`, `"1h30m"`.
///
/// Units: `ms`, `s`, `m`, `h`. Fractional values are not supported; config
/// cadences are whole units. Returns `None` on any unparseable segment.
pub fn parse_duration(raw: &str) -> Option<Duration> {
    let input = raw.trim();
    if input.is_empty() {
        return None;
    }

    let mut total_ms: u64 = 0;
    let mut digits = String::new();
    let mut unit = String::new();

    let mut flush = |digits: &mut String, unit: &mut String, total_ms: &mut u64| -> bool {
        if digits.is_empty() {
            return false;
        }
        let value: u64 = match digits.parse() {
            Ok(v) => v,
            Err(_) => return false,
        };
        let scale_ms = match unit.as_str() {
            "ms" => 1,
            "s" => 1_000,
            "m" => 60_000,
            "h" => 3_600_000,
            _ => return false,
        };
        *total_ms = total_ms.saturating_add(value.saturating_mul(scale_ms));
        digits.clear();
        unit.clear();
        true
    };

    for ch in input.chars() {
        if ch.is_ascii_digit() {
            if !unit.is_empty() && !flush(&mut digits, &mut unit, &mut total_ms) {
                return None;
            }
            digits.push(ch);
        } else if ch.is_ascii_alphabetic() {
            if digits.is_empty() {
                return None;
            }
            unit.push(ch);
        } else {
            return None;
        }
    }
    if !flush(&mut digits, &mut unit, &mut total_ms) {
        return None;
    }

    Some(Duration::from_millis(total_ms))
}

/// Cadence resolution for subscription overrides: try the duration-string
/// form first, then a bare integer interpreted as seconds.
pub fn parse_duration_or_seconds(raw: &str) -> Option<Duration> {
    if let Some(parsed) = parse_duration(raw) {
        return Some(parsed);
    }
    raw.trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Render a duration back into the compact `1h30m` form used in config and
/// schedule specs. Sub-second remainders render as `ms`.
pub fn format_duration(duration: Duration) -> String {
    let total_ms = duration.as_millis() as u64;
    if total_ms == 0 {
        return "0s".to_string();
    }

    let mut out = String::new();
    let hours = total_ms / 3_600_000;
    let minutes = (total_ms % 3_600_000) / 60_000;
    let seconds = (total_ms % 60_000) / 1_000;
    let millis = total_ms % 1_000;
    if hours > 0 {
        out.push_str(&format!("{hours}h"));
    }
    if minutes > 0 {
        out.push_str(&format!("{minutes}m"));
    }
    if seconds > 0 {
        out.push_str(&format!("{seconds}s"));
    }
    if millis > 0 {
        out.push_str(&format!("{millis}ms"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::{format_duration, parse_duration, parse_duration_or_seconds};
    use std::time::Duration;

    #[test]
    fn test_parse_duration_simple_units() {
        assert_eq!(parse_duration("300ms"), Some(Duration::from_millis(300)));
        assert_eq!(parse_duration("10s"), Some(Duration::from_secs(10)));
        assert_eq!(parse_duration("5m"), Some(Duration::from_secs(300)));
        assert_eq!(parse_duration("2h"), Some(Duration::from_secs(7_200)));
    }

    #[test]
    fn test_parse_duration_compound() {
        assert_eq!(parse_duration("1h30m"), Some(Duration::from_secs(5_400)));
        assert_eq!(
            parse_duration("1m30s500ms"),
            Some(Duration::from_millis(90_500))
        );
    }

    #[test]
    fn test_parse_duration_rejects_garbage() {
        assert_eq!(parse_duration(""), None);
        assert_eq!(parse_duration("90"), None);
        assert_eq!(parse_duration("5x"), None);
        assert_eq!(parse_duration("m5"), None);
        assert_eq!(parse_duration("1.5h"), None);
    }

    #[test]
    fn test_parse_duration_or_seconds_prefers_duration_form() {
        assert_eq!(
            parse_duration_or_seconds("90"),
            Some(Duration::from_secs(90))
        );
        assert_eq!(
            parse_duration_or_seconds("90s"),
            Some(Duration::from_secs(90))
        );
        // duration form wins: "1m" is one minute, not one second
        assert_eq!(
            parse_duration_or_seconds("1m"),
            Some(Duration::from_secs(60))
        );
        assert_eq!(parse_duration_or_seconds("soon"), None);
    }

    #[test]
    fn test_format_duration_round_trips() {
        for raw in ["1h30m", "10s", "300ms", "2h", "1m30s500ms"] {
            let parsed = parse_duration(raw).expect("parse");
            assert_eq!(format_duration(parsed), raw);
        }
        assert_eq!(format_duration(Duration::ZERO), "0s");
    }
}
