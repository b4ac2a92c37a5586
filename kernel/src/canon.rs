//! Canonical JSON bytes: the single serialization-for-hashing implementation.
//!
//! **Exactly one place** produces canonical JSON bytes. Input bundles, result
//! bundles, snapshot records, and evidence manifests all route through
//! [`canonical_json_bytes`] before they are hashed.
//!
//! # Canonicalization rules
//!
//! 1. Object keys are sorted lexicographically (byte order) at every level.
//! 2. No extraneous whitespace (compact form: `{"a":1,"b":2}`).
//! 3. Strings are written verbatim as UTF-8. Only `"`, `\` and control
//!    characters below U+0020 are escaped; non-ASCII is never `\u`-escaped.
//! 4. Integers (`i64` or `u64`) are written as plain decimal integers.
//! 5. Any other number is rounded to [`FRACTION_DIGITS`] fractional digits
//!    (half away from zero), trailing zeros are stripped, and an integral
//!    result is written without a fraction. `-0` becomes `0`.
//! 6. `null`, `true`, `false` are written literally. Members whose value is
//!    `null` are kept, so `{"a":null}` and `{}` are different records.
//! 7. Output is always valid UTF-8.

use std::io::Write;

use rust_decimal::{Decimal, RoundingStrategy};

/// Fractional digits kept for non-integer numbers.
pub const FRACTION_DIGITS: u32 = 12;

/// Error type for canonical JSON serialization.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CanonError {
    /// A non-integer number does not fit the decimal range.
    #[error("number outside canonical decimal range: {raw}")]
    NumberOutOfRange { raw: String },
}

/// Produce canonical JSON bytes from a `serde_json::Value`.
///
/// Pure function: two values with the same logical content produce the same
/// bytes, whatever their original key order or formatting.
///
/// # Errors
///
/// Returns [`CanonError::NumberOutOfRange`] if a non-integer number is too
/// large to be represented as a decimal.
pub fn canonical_json_bytes(value: &serde_json::Value) -> Result<Vec<u8>, CanonError> {
    let mut buf = Vec::new();
    write_value(&mut buf, value)?;
    Ok(buf)
}

/// Remove every object member named in `keys`, at every nesting level.
///
/// Used to keep wall-clock stamps and other run-dependent fields out of a
/// hashed payload. Arrays keep their order.
#[must_use]
pub fn strip_keys<S: AsRef<str>>(value: &serde_json::Value, keys: &[S]) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => serde_json::Value::Object(
            map.iter()
                .filter(|(k, _)| !keys.iter().any(|s| s.as_ref() == k.as_str()))
                .map(|(k, v)| (k.clone(), strip_keys(v, keys)))
                .collect(),
        ),
        serde_json::Value::Array(arr) => {
            serde_json::Value::Array(arr.iter().map(|v| strip_keys(v, keys)).collect())
        }
        other => other.clone(),
    }
}

fn write_value(buf: &mut Vec<u8>, value: &serde_json::Value) -> Result<(), CanonError> {
    match value {
        serde_json::Value::Null => {
            buf.extend_from_slice(b"null");
        }
        serde_json::Value::Bool(b) => {
            if *b {
                buf.extend_from_slice(b"true");
            } else {
                buf.extend_from_slice(b"false");
            }
        }
        serde_json::Value::Number(n) => {
            write_number(buf, n)?;
        }
        serde_json::Value::String(s) => {
            write_string(buf, s);
        }
        serde_json::Value::Array(arr) => {
            buf.push(b'[');
            for (i, item) in arr.iter().enumerate() {
                if i > 0 {
                    buf.push(b',');
                }
                write_value(buf, item)?;
            }
            buf.push(b']');
        }
        serde_json::Value::Object(map) => {
            // Sorted keys (lexicographic byte order).
            let mut entries: Vec<(&String, &serde_json::Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));

            buf.push(b'{');
            for (i, (key, item)) in entries.iter().enumerate() {
                if i > 0 {
                    buf.push(b',');
                }
                write_string(buf, key);
                buf.push(b':');
                write_value(buf, item)?;
            }
            buf.push(b'}');
        }
    }
    Ok(())
}

fn write_number(buf: &mut Vec<u8>, n: &serde_json::Number) -> Result<(), CanonError> {
    // Try i64 first (handles negatives), then u64 (handles large positives).
    if let Some(i) = n.as_i64() {
        let _ = write!(buf, "{i}");
        return Ok(());
    }
    if let Some(u) = n.as_u64() {
        let _ = write!(buf, "{u}");
        return Ok(());
    }
    let out_of_range = || CanonError::NumberOutOfRange { raw: n.to_string() };
    let f = n.as_f64().ok_or_else(out_of_range)?;
    let decimal = Decimal::from_f64_retain(f)
        .ok_or_else(out_of_range)?
        .round_dp_with_strategy(FRACTION_DIGITS, RoundingStrategy::MidpointAwayFromZero)
        .normalize();
    let _ = write!(buf, "{decimal}");
    Ok(())
}

fn write_string(buf: &mut Vec<u8>, s: &str) {
    buf.push(b'"');
    for ch in s.chars() {
        match ch {
            '"' => buf.extend_from_slice(b"\\\""),
            '\\' => buf.extend_from_slice(b"\\\\"),
            '\n' => buf.extend_from_slice(b"\\n"),
            '\r' => buf.extend_from_slice(b"\\r"),
            '\t' => buf.extend_from_slice(b"\\t"),
            // Control characters U+0000..U+001F (except those handled above).
            c if c < '\u{0020}' => {
                let _ = write!(buf, "\\u{:04x}", c as u32);
            }
            c => {
                let mut utf8_buf = [0u8; 4];
                let encoded = c.encode_utf8(&mut utf8_buf);
                buf.extend_from_slice(encoded.as_bytes());
            }
        }
    }
    buf.push(b'"');
}
