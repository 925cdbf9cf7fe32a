use std::time::Duration;

/// Parses a duration from a plain `12` / `12s` seconds count or a
/// `humantime`-style string such as `"5m"` or `"2h30m"`. Used as a clap
/// `value_parser` for the scheduler's `--every`/`--timeout` options.
pub fn parse_duration(raw: &str) -> Result<Duration, String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err("duration must not be empty".to_string());
    }

    if let Ok(secs) = trimmed.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    humantime::parse_duration(trimmed).map_err(|err| err.to_string())
}

/// Parses a byte count from a plain decimal or a `KiB`/`MiB`/`GiB`
/// suffixed string (binary units, case-insensitive). Used as a clap
/// `value_parser` for `--batch-size`.
pub fn parse_size(raw: &str) -> Result<u64, String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err("size must not be empty".to_string());
    }

    const UNITS: [(&str, u64); 3] = [("kib", 1024), ("mib", 1024 * 1024), ("gib", 1024 * 1024 * 1024)];

    let lower = trimmed.to_ascii_lowercase();
    for (suffix, multiplier) in UNITS {
        if let Some(number) = lower.strip_suffix(suffix) {
            let count: u64 = number.trim().parse().map_err(|_| format!("invalid size: {raw}"))?;
            return Ok(count * multiplier);
        }
    }

    trimmed.parse().map_err(|_| format!("invalid size: {raw}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_seconds() {
        assert_eq!(parse_duration("90").unwrap(), Duration::from_secs(90));
    }

    #[test]
    fn parses_humantime() {
        assert_eq!(parse_duration("2h30m").unwrap(), Duration::from_secs(2 * 3600 + 30 * 60));
    }

    #[test]
    fn rejects_empty() {
        assert!(parse_duration("  ").is_err());
    }

    #[test]
    fn parses_plain_bytes() {
        assert_eq!(parse_size("1024").unwrap(), 1024);
    }

    #[test]
    fn parses_binary_suffixes_case_insensitively() {
        assert_eq!(parse_size("256KiB").unwrap(), 256 * 1024);
        assert_eq!(parse_size("2MiB").unwrap(), 2 * 1024 * 1024);
        assert_eq!(parse_size("1gib").unwrap(), 1024 * 1024 * 1024);
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_size("banana").is_err());
    }
}
