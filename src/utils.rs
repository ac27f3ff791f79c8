//! Size, rate and duration parsing utility functions / 大小、速率与时长解析工具函数
//!
//! rclone prints human readable values such as `65.3 MiB`, `12 MiB/s` and `1m10s`.
//! All sizes use binary multiples (1 K = 1024).

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Size string parse error / 大小字符串解析错误
///
/// Callers treat a failed parse as "unknown", never as a real zero reading.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SizeParseError {
    #[error("empty size string")]
    Empty,
    #[error("invalid size string: {0:?}")]
    Invalid(String),
    #[error("size out of range: {0:?}")]
    Overflow(String),
}

const KIB: u64 = 1024;
const MIB: u64 = KIB * 1024;
const GIB: u64 = MIB * 1024;
const TIB: u64 = GIB * 1024;

/// `<number><optional unit>`, unit = K|M|G|T with optional `i` and optional `B`
static SIZE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(\d+)(?:\.(\d+))?\s*([kmgt]?)(i?)(b?)$").unwrap()
});

static ETA_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:(\d+)y)?(?:(\d+)w)?(?:(\d+)d)?(?:(\d+)h)?(?:(\d+)m)?(?:(\d+)(?:\.\d+)?s)?$").unwrap()
});

fn unit_multiplier(unit: &str) -> u64 {
    match unit.to_ascii_uppercase().as_str() {
        "K" => KIB,
        "M" => MIB,
        "G" => GIB,
        "T" => TIB,
        _ => 1,
    }
}

/// Parse a size string into bytes / 解析大小字符串为字节数
///
/// Accepts `100`, `100B`, `65 MiB`, `65.3Mi`, `1.5G`, `2 TB` (case-insensitive).
/// A bare `i` without a unit letter (`"10iB"`) is rejected. Fractions are truncated
/// toward zero after multiplication.
pub fn parse_bytes(input: &str) -> Result<u64, SizeParseError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(SizeParseError::Empty);
    }

    let caps = SIZE_RE
        .captures(trimmed)
        .ok_or_else(|| SizeParseError::Invalid(trimmed.to_string()))?;

    let unit = caps.get(3).map_or("", |m| m.as_str());
    let binary_marker = caps.get(4).map_or("", |m| m.as_str());
    if unit.is_empty() && !binary_marker.is_empty() {
        return Err(SizeParseError::Invalid(trimmed.to_string()));
    }
    let multiplier = unit_multiplier(unit) as u128;

    let overflow = || SizeParseError::Overflow(trimmed.to_string());

    let whole: u128 = caps[1].parse().map_err(|_| overflow())?;
    let mut bytes = whole.checked_mul(multiplier).ok_or_else(overflow)?;

    // Exact integer arithmetic for the fractional part / 小数部分使用整数精确计算
    if let Some(frac) = caps.get(2) {
        let digits = frac.as_str();
        // 18 digits keep numerator * TiB inside u128
        let digits = &digits[..digits.len().min(18)];
        let numerator: u128 = digits.parse().map_err(|_| overflow())?;
        let denominator = 10u128.pow(digits.len() as u32);
        bytes += numerator * multiplier / denominator;
    }

    u64::try_from(bytes).map_err(|_| overflow())
}

/// Parse a rate string (`12.4 MiB/s`) into bytes per second / 解析速率字符串
pub fn parse_rate(input: &str) -> Result<u64, SizeParseError> {
    let trimmed = input.trim();
    let without_suffix = trimmed
        .strip_suffix("/s")
        .or_else(|| trimmed.strip_suffix("/S"))
        .unwrap_or(trimmed);
    parse_bytes(without_suffix)
}

/// Format bytes losslessly with the largest exact binary unit / 无损格式化字节数
///
/// `parse_bytes(&format_bytes(n)) == Ok(n)` holds for every `n`.
pub fn format_bytes(bytes: u64) -> String {
    if bytes == 0 {
        return "0 B".to_string();
    }
    for (size, name) in [(TIB, "TiB"), (GIB, "GiB"), (MIB, "MiB"), (KIB, "KiB")] {
        if bytes % size == 0 {
            return format!("{} {}", bytes / size, name);
        }
    }
    format!("{} B", bytes)
}

/// Parse an rclone ETA (`3s`, `1m10s`, `1d2h`, `-`) into seconds / 解析ETA为秒数
///
/// Returns `None` for unknown (`-`) or malformed values.
pub fn parse_eta(input: &str) -> Option<u64> {
    let trimmed = input.trim();
    if trimmed.is_empty() || trimmed == "-" {
        return None;
    }
    let caps = ETA_RE.captures(trimmed)?;

    const FACTORS: [u64; 6] = [365 * 86_400, 7 * 86_400, 86_400, 3_600, 60, 1];
    let mut total: u64 = 0;
    let mut matched = false;
    for (idx, factor) in FACTORS.iter().enumerate() {
        if let Some(m) = caps.get(idx + 1) {
            matched = true;
            let value: u64 = m.as_str().parse().ok()?;
            total = total.checked_add(value.checked_mul(*factor)?)?;
        }
    }
    matched.then_some(total)
}
