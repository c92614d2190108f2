//! Parsing of human-readable sizes and percentages from the stats stream
//!
//! Every parser here is total: malformed input yields zero.

use regex::Regex;
use std::sync::OnceLock;

const KIB: f64 = 1024.0;

/// Separators accepted in `MemUsage` fields
pub const USAGE_SEPARATORS: &[&str] = &[" / ", "/", " | ", "|"];

/// Separators accepted in `NetIO` and `BlockIO` fields
pub const IO_SEPARATORS: &[&str] = &[" / ", "/"];

static SIZE_RE: OnceLock<Regex> = OnceLock::new();
static NUMBER_RE: OnceLock<Regex> = OnceLock::new();

fn size_regex() -> &'static Regex {
    SIZE_RE.get_or_init(|| {
        Regex::new(r"^([0-9.]+)\s*([A-Za-z]+)?$").expect("size pattern is valid")
    })
}

fn number_regex() -> &'static Regex {
    NUMBER_RE.get_or_init(|| Regex::new(r"[\d.]+").expect("number pattern is valid"))
}

fn unit_multiplier(unit: &str) -> f64 {
    match unit.to_ascii_uppercase().as_str() {
        "B" => 1.0,
        "K" | "KB" | "KIB" | "KI" => KIB,
        "M" | "MB" | "MIB" | "MI" => KIB * KIB,
        "G" | "GB" | "GIB" | "GI" => KIB * KIB * KIB,
        "T" | "TB" | "TIB" | "TI" => KIB * KIB * KIB * KIB,
        // Unknown unit: bare value
        _ => 1.0,
    }
}

/// Parse sizes such as `512MiB`, `1.2MB` or `0B` into bytes (1024-based).
pub fn parse_size_with_unit(text: &str) -> u64 {
    let text = text.trim();
    if text.is_empty() {
        return 0;
    }

    match size_regex().captures(text) {
        Some(caps) => {
            let value = caps
                .get(1)
                .and_then(|m| m.as_str().parse::<f64>().ok())
                .unwrap_or(0.0);
            let multiplier = caps.get(2).map(|m| unit_multiplier(m.as_str())).unwrap_or(1.0);
            to_bytes(value * multiplier)
        }
        None => text.parse::<f64>().map(to_bytes).unwrap_or(0),
    }
}

fn to_bytes(value: f64) -> u64 {
    if value.is_finite() && value > 0.0 {
        value as u64
    } else {
        0
    }
}

/// Parse percentages such as `12.50%`; placeholders like `--` yield 0.
pub fn parse_percentage(text: &str) -> f64 {
    let text = text.trim();
    let text = text.strip_suffix('%').unwrap_or(text).trim();
    if matches!(text, "" | "--" | "-" | "N/A" | "n/a") {
        return 0.0;
    }

    if let Ok(value) = text.parse::<f64>() {
        return if value.is_finite() { value } else { 0.0 };
    }

    number_regex()
        .find(text)
        .and_then(|m| m.as_str().parse::<f64>().ok())
        .unwrap_or(0.0)
}

/// Split a two-part field on the first separator that occurs in it.
///
/// Without any separator the whole text is the first part.
pub fn split_pair<'a>(text: &'a str, separators: &[&str]) -> (&'a str, &'a str) {
    for separator in separators {
        if let Some((left, right)) = text.split_once(separator) {
            return (left.trim(), right.trim());
        }
    }
    (text.trim(), "")
}

/// Parse a two-part size field into `(first, second)` bytes.
pub fn parse_size_pair(text: &str, separators: &[&str]) -> (u64, u64) {
    let (left, right) = split_pair(text, separators);
    (parse_size_with_unit(left), parse_size_with_unit(right))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binary_units() {
        assert_eq!(parse_size_with_unit("512MiB"), 536_870_912);
        assert_eq!(parse_size_with_unit("2GiB"), 2_147_483_648);
        assert_eq!(parse_size_with_unit("1KB"), 1024);
        assert_eq!(parse_size_with_unit("1TiB"), 1_099_511_627_776);
        assert_eq!(parse_size_with_unit("0B"), 0);
    }

    #[test]
    fn test_fractional_value_is_truncated() {
        assert_eq!(parse_size_with_unit("1.2MB"), 1_258_291);
    }

    #[test]
    fn test_case_insensitive_units() {
        assert_eq!(parse_size_with_unit("3mib"), 3 * 1024 * 1024);
        assert_eq!(parse_size_with_unit("1 gb"), 1024 * 1024 * 1024);
        assert_eq!(parse_size_with_unit("4k"), 4096);
    }

    #[test]
    fn test_unknown_unit_falls_back_to_bare_value() {
        assert_eq!(parse_size_with_unit("42XB"), 42);
        assert_eq!(parse_size_with_unit("42"), 42);
    }

    #[test]
    fn test_malformed_sizes_are_zero() {
        assert_eq!(parse_size_with_unit(""), 0);
        assert_eq!(parse_size_with_unit("--"), 0);
        assert_eq!(parse_size_with_unit("1.2.3MB"), 0);
        assert_eq!(parse_size_with_unit("abc"), 0);
    }

    #[test]
    fn test_percentages() {
        assert_eq!(parse_percentage("12.50%"), 12.5);
        assert_eq!(parse_percentage(" 0.00% "), 0.0);
        assert_eq!(parse_percentage("--"), 0.0);
        assert_eq!(parse_percentage("N/A"), 0.0);
        assert_eq!(parse_percentage(""), 0.0);
        assert_eq!(parse_percentage("~3.5 pct"), 3.5);
        assert_eq!(parse_percentage("none"), 0.0);
    }

    #[test]
    fn test_split_pair_separators() {
        assert_eq!(split_pair("1MiB / 2GiB", USAGE_SEPARATORS), ("1MiB", "2GiB"));
        assert_eq!(split_pair("1MiB/2GiB", USAGE_SEPARATORS), ("1MiB", "2GiB"));
        assert_eq!(split_pair("1MiB | 2GiB", USAGE_SEPARATORS), ("1MiB", "2GiB"));
        assert_eq!(split_pair("1MiB|2GiB", USAGE_SEPARATORS), ("1MiB", "2GiB"));
        assert_eq!(split_pair("1MiB|2GiB", IO_SEPARATORS), ("1MiB|2GiB", ""));
        assert_eq!(split_pair("7kB", IO_SEPARATORS), ("7kB", ""));
    }

    #[test]
    fn test_parse_size_pair() {
        assert_eq!(
            parse_size_pair("1.2MB / 500KB", IO_SEPARATORS),
            (1_258_291, 512_000)
        );
        assert_eq!(parse_size_pair("garbage", IO_SEPARATORS), (0, 0));
    }
}
