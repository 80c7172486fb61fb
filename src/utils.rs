//! Small pure helpers shared by the collector and the reconciler.

/// Canonicalize a free-text address token into a dotted address.
///
/// All non-digit characters are stripped and the digit run is split by its
/// length:
/// - 12 and 11 digits: 3-3-3-rest
/// - 10 and 9 digits: 3-3-2-rest
/// - 8 and 7 digits: 3-3-rest (three segments)
///
/// Any other length is returned unsplit; the caller decides whether that is
/// usable. Empty, whitespace-only and digit-free tokens yield `None`, which
/// means "skip this device".
///
/// Tokens that are already dotted (only digits and dots) are returned as-is so
/// normalizing twice never re-splits an address.
pub fn normalize_address(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    if trimmed.contains('.') && trimmed.chars().all(|c| c.is_ascii_digit() || c == '.') {
        return Some(trimmed.to_string());
    }

    let digits: String = trimmed.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }

    let cuts: &[usize] = match digits.len() {
        11 | 12 => &[3, 6, 9],
        9 | 10 => &[3, 6, 8],
        7 | 8 => &[3, 6],
        _ => &[],
    };

    let mut parts = Vec::with_capacity(cuts.len() + 1);
    let mut start = 0;
    for &cut in cuts {
        parts.push(&digits[start..cut]);
        start = cut;
    }
    parts.push(&digits[start..]);
    Some(parts.join("."))
}

/// Parse a scraped level token such as `"45%"`, `" 7 % "`, `"<10%"` or
/// `"12,5"` into a percentage in `0..=100`.
pub fn parse_percentage(raw: &str) -> Option<f64> {
    let mut s = raw.trim();
    s = s.trim_start_matches(['<', '>', '~', '≈']).trim_start();
    s = s.trim_end_matches('*').trim_end();
    s = s.strip_suffix('%').unwrap_or(s).trim();
    if s.is_empty() {
        return None;
    }

    let value: f64 = s.replace(',', ".").parse().ok()?;
    if value.is_finite() && (0.0..=100.0).contains(&value) {
        Some(value)
    } else {
        None
    }
}

/// Display form used for persisted levels, e.g. `45.4` -> `"45%"`.
pub fn format_percentage(value: f64) -> String {
    format!("{}%", value.round() as i64)
}
