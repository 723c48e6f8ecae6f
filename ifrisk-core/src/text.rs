//! Label cleaning and locale-tolerant number parsing.
//!
//! Everything here is total: bad input yields an empty string or `None`,
//! never an error.

use serde_json::Value;

/// Clean a free-text label.
///
/// - control characters (including CR/LF/TAB) become spaces
/// - whitespace runs collapse to a single space, ends trimmed
/// - `=` gets exactly one space on each side
pub fn clean(text: Option<&str>) -> String {
    let Some(text) = text else {
        return String::new();
    };

    let mut spaced = String::with_capacity(text.len() + 4);
    for ch in text.chars() {
        if ch == '=' {
            spaced.push_str(" = ");
        } else if ch.is_control() {
            spaced.push(' ');
        } else {
            spaced.push(ch);
        }
    }

    spaced.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Parse an upstream cell into a finite number.
///
/// - JSON numbers pass through
/// - booleans, nulls, arrays and objects are rejected
/// - `"1.234,56"` (both separators) reads as thousands-then-decimal
/// - `"12,5"` (comma only) reads as decimal-comma
/// - `"1.234.567"` and `"1.234"` (dot only, thousands groups) drop the dots
/// - `"12.5"` and `"0.125"` (any other dot-only form) read as a plain decimal
///
/// Non-finite results are `None`.
pub fn parse_value(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Number(n) => n.as_f64().filter(|v| v.is_finite()),
        Value::String(s) => parse_number_text(s),
        _ => None,
    }
}

/// Text branch of [`parse_value`].
pub fn parse_number_text(text: &str) -> Option<f64> {
    let t = text.trim();
    if t.is_empty() {
        return None;
    }

    let normalized = match (t.contains('.'), t.contains(',')) {
        (true, true) => t.replace('.', "").replace(',', "."),
        (false, true) => t.replace(',', "."),
        (true, false) if dots_group_thousands(t) => t.replace('.', ""),
        _ => t.to_string(),
    };

    // Reject forms `f64::from_str` would accept but upstream never means
    // as numbers ("inf", "NaN", "1e5").
    let body = normalized.strip_prefix('-').unwrap_or(&normalized);
    let mut parts = body.splitn(2, '.');
    let int_part = parts.next().unwrap_or("");
    let frac_ok = parts
        .next()
        .map_or(true, |f| !f.is_empty() && f.bytes().all(|b| b.is_ascii_digit()));
    if int_part.is_empty() || !int_part.bytes().all(|b| b.is_ascii_digit()) || !frac_ok {
        return None;
    }

    normalized.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Dot-only text read as thousands grouping: several dots (`1.234.567`), or
/// a single dot followed by exactly three digits after a non-zero head
/// (`1.234`, but not `0.125`).
fn dots_group_thousands(text: &str) -> bool {
    let body = text.strip_prefix('-').unwrap_or(text);
    let mut parts = body.split('.');
    let head = parts.next().unwrap_or("");
    let tail: Vec<&str> = parts.collect();
    match tail.as_slice() {
        [] => false,
        [frac] => frac.len() == 3 && !head.is_empty() && !head.starts_with('0'),
        _ => true,
    }
}

/// Truncate to at most `max_chars` characters on a char boundary.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

const DIGEST_CHARS: usize = 8;

/// Cap `text` at `max_chars`, keeping distinct long inputs distinct.
///
/// Text over the cap keeps its head and ends in `~` plus the first eight
/// hex digits of its blake3 hash. Caps too small to hold the suffix fall
/// back to [`truncate_chars`].
pub fn cap_with_digest(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars || max_chars <= DIGEST_CHARS + 1 {
        return truncate_chars(text, max_chars);
    }
    let digest = blake3::hash(text.as_bytes()).to_hex();
    let mut capped = truncate_chars(text, max_chars - DIGEST_CHARS - 1);
    capped.push('~');
    capped.push_str(&digest.as_str()[..DIGEST_CHARS]);
    capped
}
