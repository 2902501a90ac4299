//! Human-readable byte sizes, used by the `max_message_size` config option
//! and the oversize close reason.

use thiserror::Error;

const KIB: u64 = 1024;
const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * 1024 * 1024;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid byte size {0:?}, expected a number with an optional K/M/G suffix")]
pub struct SizeParseError(pub String);

/// Parse a human-readable byte size such as `"10M"`, `"512K"` or `"1048576"`.
/// Suffixes are case-insensitive powers of 1024; a trailing `B` is accepted.
pub fn parse_size(input: &str) -> Result<u64, SizeParseError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(SizeParseError(input.to_string()));
    }

    let upper = trimmed.to_ascii_uppercase();
    let stripped = upper.strip_suffix('B').unwrap_or(&upper);
    let (number, multiplier) = match stripped.chars().last() {
        Some('K') => (&stripped[..stripped.len() - 1], KIB),
        Some('M') => (&stripped[..stripped.len() - 1], MIB),
        Some('G') => (&stripped[..stripped.len() - 1], GIB),
        _ => (stripped, 1),
    };

    let value: f64 = number
        .trim()
        .parse()
        .map_err(|_| SizeParseError(input.to_string()))?;
    if value < 0.0 {
        return Err(SizeParseError(input.to_string()));
    }

    Ok((value * multiplier as f64) as u64)
}

/// Format a byte count the way the config expects it back, e.g. `10.0M`.
pub fn format_size(bytes: u64) -> String {
    if bytes >= GIB {
        format!("{:.1}G", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.1}M", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.1}K", bytes as f64 / KIB as f64)
    } else {
        format!("{}B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_numbers() {
        assert_eq!(parse_size("100").unwrap(), 100);
        assert_eq!(parse_size("0").unwrap(), 0);
    }

    #[test]
    fn parses_suffixes() {
        assert_eq!(parse_size("512K").unwrap(), 512 * 1024);
        assert_eq!(parse_size("10M").unwrap(), 10 * 1024 * 1024);
        assert_eq!(parse_size("1G").unwrap(), 1024 * 1024 * 1024);
        assert_eq!(parse_size("10m").unwrap(), 10 * 1024 * 1024);
        assert_eq!(parse_size("4KB").unwrap(), 4096);
    }

    #[test]
    fn parses_fractions() {
        assert_eq!(parse_size("1.5M").unwrap(), (1.5 * 1024.0 * 1024.0) as u64);
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_size("").is_err());
        assert!(parse_size("ten megabytes").is_err());
        assert!(parse_size("-5M").is_err());
    }

    #[test]
    fn formats_round_trip_style() {
        assert_eq!(format_size(10 * 1024 * 1024), "10.0M");
        assert_eq!(format_size(1536), "1.5K");
        assert_eq!(format_size(42), "42B");
    }
}
