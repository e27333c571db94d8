//! Storage quantities compared by capacity.
//!
//! Kubernetes accepts `"2Gi"`, `"2147483648"`, `"2.5G"` and `"1e9"` for the
//! same kind of value, so string comparison is meaningless.  Values are
//! normalised to an exact integer count of milli-units.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

use crate::error::{Error, Result};

const MILLI: u128 = 1000;

#[derive(Clone, Debug)]
pub struct StorageQuantity {
    raw: String,
    millis: u128,
}

impl StorageQuantity {
    pub fn parse(s: &str) -> Result<Self> {
        s.parse()
    }

    /// Capacity in milli-units.
    pub fn millis(&self) -> u128 {
        self.millis
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn to_quantity(&self) -> Quantity {
        Quantity(self.raw.clone())
    }
}

fn suffix_multiplier(suffix: &str) -> Option<(u128, u128)> {
    // (numerator, denominator)
    let m = match suffix {
        "" => (1, 1),
        "m" => (1, 1000),
        "k" => (1_000, 1),
        "M" => (1_000_000, 1),
        "G" => (1_000_000_000, 1),
        "T" => (1_000_000_000_000, 1),
        "P" => (1_000_000_000_000_000, 1),
        "E" => (1_000_000_000_000_000_000, 1),
        "Ki" => (1 << 10, 1),
        "Mi" => (1 << 20, 1),
        "Gi" => (1 << 30, 1),
        "Ti" => (1 << 40, 1),
        "Pi" => (1 << 50, 1),
        "Ei" => (1 << 60, 1),
        _ => return None,
    };
    Some(m)
}

/// Split `"1.5Gi"` into the numeric part and its suffix.  A decimal exponent
/// (`1e3`, `2E6`) is folded into the numeric part.
fn split_number(s: &str) -> (&str, &str) {
    let bytes = s.as_bytes();
    let mut end = 0;
    while end < bytes.len() && (bytes[end].is_ascii_digit() || bytes[end] == b'.') {
        end += 1;
    }
    if end < bytes.len() && (bytes[end] == b'e' || bytes[end] == b'E') {
        let mut exp_end = end + 1;
        if exp_end < bytes.len() && (bytes[exp_end] == b'+' || bytes[exp_end] == b'-') {
            exp_end += 1;
        }
        let digits_start = exp_end;
        while exp_end < bytes.len() && bytes[exp_end].is_ascii_digit() {
            exp_end += 1;
        }
        // "2E" is the exa suffix, not an exponent.
        if exp_end > digits_start && exp_end == bytes.len() {
            end = exp_end;
        }
    }
    (&s[..end], &s[end..])
}

fn parse_millis(s: &str) -> Option<u128> {
    let (number, suffix) = split_number(s);
    if number.is_empty() {
        return None;
    }

    let (mantissa, exponent) = match number.find(['e', 'E']) {
        Some(i) => (&number[..i], number[i + 1..].parse::<i32>().ok()?),
        None => (number, 0),
    };

    let (int_part, frac_part) = match mantissa.split_once('.') {
        Some((i, f)) => (i, f),
        None => (mantissa, ""),
    };
    if int_part.is_empty() && frac_part.is_empty() {
        return None;
    }
    if !int_part.chars().chain(frac_part.chars()).all(|c| c.is_ascii_digit()) {
        return None;
    }

    // value = digits * 10^(exponent - frac_len)
    let digits: u128 = format!("{int_part}{frac_part}").parse().ok()?;
    let scale = exponent - frac_part.len() as i32;
    let (num, den) = suffix_multiplier(suffix)?;

    let mut value = digits.checked_mul(num)?.checked_mul(MILLI)?;
    let mut divisor = den;
    if scale >= 0 {
        value = value.checked_mul(10u128.checked_pow(scale as u32)?)?;
    } else {
        divisor = divisor.checked_mul(10u128.checked_pow((-scale) as u32)?)?;
    }
    // Sub-milli precision rounds up, as the API server does.
    Some(value.div_ceil(divisor))
}

impl FromStr for StorageQuantity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        let millis = parse_millis(trimmed).ok_or_else(|| Error::Quantity(s.to_string()))?;
        Ok(Self {
            raw: trimmed.to_string(),
            millis,
        })
    }
}

impl PartialEq for StorageQuantity {
    fn eq(&self, other: &Self) -> bool {
        self.millis == other.millis
    }
}

impl Eq for StorageQuantity {}

impl PartialOrd for StorageQuantity {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for StorageQuantity {
    fn cmp(&self, other: &Self) -> Ordering {
        self.millis.cmp(&other.millis)
    }
}

impl fmt::Display for StorageQuantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn q(s: &str) -> StorageQuantity {
        s.parse().unwrap()
    }

    #[test]
    fn binary_and_decimal_suffixes_compare_by_capacity() {
        assert!(q("5Gi") > q("2Gi"));
        assert!(q("1Gi") > q("1G"));
        assert!(q("1Ti") > q("1000Gi"));
        assert!(q("500Mi") < q("1Gi"));
        assert_eq!(q("1Gi"), q("1024Mi"));
        assert_eq!(q("1073741824"), q("1Gi"));
    }

    #[test]
    fn fractions_and_exponents() {
        assert_eq!(q("1.5Gi"), q("1536Mi"));
        assert_eq!(q("1e3"), q("1k"));
        assert_eq!(q("2.5G"), q("2500M"));
        assert_eq!(q("500m").millis(), 500);
    }

    #[test]
    fn exa_suffix_is_not_an_exponent() {
        assert_eq!(q("2E").millis(), 2_000_000_000_000_000_000 * 1000);
    }

    #[test]
    fn keeps_the_original_spelling() {
        assert_eq!(q(" 5Gi ").to_string(), "5Gi");
        assert_eq!(q("5Gi").to_quantity(), Quantity("5Gi".to_string()));
    }

    #[test]
    fn rejects_garbage() {
        for bad in ["", "Gi", "abc", "5Xi", "1..2Gi", "5 Gi"] {
            assert!(bad.parse::<StorageQuantity>().is_err(), "{bad:?} should fail");
        }
    }
}
