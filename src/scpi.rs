//! Symbolic wire-code resolution and permissive config validation.
//!
//! Every driver resolves its enumerated settings (terminals, remote sense,
//! off-state, trip action, ...) through the same synonym-table lookup so the
//! behavior is identical across device families. The policy is deliberately
//! permissive: unrecognized input falls back to the supplied default instead
//! of failing, because a typo in a config file should never leave an
//! instrument half-configured.

use serde_json::Value;

/// Table mapping a wire code to the case-insensitive synonyms it accepts.
///
/// Boolean config values are normalized to `"true"`/`"false"` before lookup,
/// so tables wanting to accept booleans list those strings as synonyms.
pub type SynonymTable<'a> = &'a [(&'a str, &'a [&'a str])];

fn normalize(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.to_lowercase()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Resolve a requested config value to a wire code through `table`.
///
/// String input is lower-cased before comparison. If the input is absent,
/// non-scalar, or matches no table entry, `default` is returned unchanged.
/// This function never fails.
pub fn resolve_symbol(value: Option<&Value>, table: SynonymTable<'_>, default: &str) -> String {
    let needle = match value.and_then(normalize) {
        Some(n) => n,
        None => return default.to_string(),
    };

    for (code, synonyms) in table {
        if synonyms.contains(&needle.as_str()) {
            return (*code).to_string();
        }
    }
    default.to_string()
}

/// Fetch `key` from a config object and validate it against `[min, max]`.
///
/// A missing key yields `absent_default`; a present but non-numeric or
/// out-of-range value yields `invalid_default`. The two defaults differ for
/// some settings (e.g. NPLC defaults to 2 when unspecified but falls back to
/// 1 when the configured value is out of domain).
pub fn numeric_in_range(
    config: &Value,
    key: &str,
    min: f64,
    max: f64,
    absent_default: f64,
    invalid_default: f64,
) -> f64 {
    match config.get(key) {
        None => absent_default,
        Some(v) => match v.as_f64() {
            Some(n) if n >= min && n <= max => n,
            _ => invalid_default,
        },
    }
}

/// Fetch `key` from a config object and constrain it to an allow-list.
///
/// Comparison is exact (the allow-lists are wire literals); anything absent
/// or unrecognized yields `default`.
pub fn string_choice(config: &Value, key: &str, allowed: &[&str], default: &str) -> String {
    match config.get(key).and_then(Value::as_str) {
        Some(s) if allowed.contains(&s) => s.to_string(),
        _ => default.to_string(),
    }
}

/// Fetch a numeric `key`, taking its absolute value; non-numeric input yields
/// `None`. Used for source limits, where sign is meaningless.
pub fn magnitude(config: &Value, key: &str) -> Option<f64> {
    config.get(key).and_then(Value::as_f64).map(f64::abs)
}
