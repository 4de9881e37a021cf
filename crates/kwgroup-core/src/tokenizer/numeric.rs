//! Numeric expression normalization.
//!
//! Runs on the raw keyword text before word tokenization:
//! `"$1,500 laptops"` becomes `"1500 laptops"` and `"10k followers"` becomes
//! `"10000 followers"`.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

static CURRENCY: Lazy<Regex> = Lazy::new(|| Regex::new(r"[$€£¥₹¢]").expect("valid regex"));

static DIGIT_GROUP: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d),(\d{3})\b").expect("valid regex"));

static MAGNITUDE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(\d+(?:\.\d+)?)([kmb])\b").expect("valid regex"));

/// Normalize currency, digit grouping and `k/m/b` magnitude suffixes.
pub fn normalize_numbers(text: &str) -> String {
    let without_currency = CURRENCY.replace_all(text, "");

    // Each pass removes one separator per group, so "1,000,000" needs two.
    let mut collapsed = without_currency.into_owned();
    loop {
        let next = DIGIT_GROUP.replace_all(&collapsed, "$1$2").into_owned();
        if next == collapsed {
            break;
        }
        collapsed = next;
    }

    MAGNITUDE
        .replace_all(&collapsed, |caps: &Captures| expand_magnitude(&caps[1], &caps[2]))
        .into_owned()
}

fn expand_magnitude(number: &str, suffix: &str) -> String {
    let multiplier: f64 = match suffix.to_ascii_lowercase().as_str() {
        "k" => 1e3,
        "m" => 1e6,
        "b" => 1e9,
        _ => 1.0,
    };
    match number.parse::<f64>() {
        Ok(value) => format!("{}", (value * multiplier).round() as i64),
        Err(_) => format!("{number}{suffix}"),
    }
}
