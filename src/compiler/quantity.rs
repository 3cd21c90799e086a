//! Resource quantity comparison
//!
//! The API server keeps quantities as written, so `1000m` and `1` are the same
//! CPU request spelled two ways. Drift checks compare the parsed amount in
//! nano-units instead of the string.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ResourceRequirements;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

const NANOS_EXPONENT: i32 = 9;

/// A quantity reduced to something comparable
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Amount<'a> {
    /// Parsed amount in nano-units
    Nanos(i128),
    /// Not a quantity we can parse; compared as written
    Raw(&'a str),
}

impl<'a> Amount<'a> {
    /// Parse `quantity`, falling back to its text
    pub fn of(quantity: &'a Quantity) -> Self {
        nano_units(&quantity.0).map_or(Self::Raw(quantity.0.as_str()), Self::Nanos)
    }
}

/// Requests and limits keyed by resource name
pub type ResourceAmounts<'a> = (BTreeMap<&'a str, Amount<'a>>, BTreeMap<&'a str, Amount<'a>>);

/// Comparable form of a container's resources, `None` when nothing is set
pub fn resource_amounts(resources: Option<&ResourceRequirements>) -> Option<ResourceAmounts<'_>> {
    fn amounts(m: Option<&BTreeMap<String, Quantity>>) -> BTreeMap<&str, Amount<'_>> {
        m.into_iter()
            .flatten()
            .map(|(k, v)| (k.as_str(), Amount::of(v)))
            .collect()
    }

    let r = resources?;
    let requests = amounts(r.requests.as_ref());
    let limits = amounts(r.limits.as_ref());
    if requests.is_empty() && limits.is_empty() {
        return None;
    }
    Some((requests, limits))
}

/// Value of a Kubernetes quantity string in nano-units
///
/// Accepts decimal SI suffixes (`n` to `E`), binary suffixes (`Ki` to `Ei`)
/// and decimal exponents (`1e3`). Returns `None` for anything else or on
/// overflow. Fractions finer than a nano-unit are truncated.
pub fn nano_units(quantity: &str) -> Option<i128> {
    let q = quantity.trim();
    let split = q
        .find(|c: char| !(c.is_ascii_digit() || matches!(c, '.' | '+' | '-')))
        .unwrap_or(q.len());
    let (number, suffix) = q.split_at(split);

    let (negative, digits) = match number.as_bytes().first() {
        Some(b'-') => (true, &number[1..]),
        Some(b'+') => (false, &number[1..]),
        _ => (false, number),
    };
    let (whole, fraction) = digits.split_once('.').unwrap_or((digits, ""));
    if whole.is_empty() && fraction.is_empty() {
        return None;
    }
    if !whole.chars().chain(fraction.chars()).all(|c| c.is_ascii_digit()) {
        return None;
    }

    let mantissa: i128 = format!("{whole}{fraction}").parse().ok()?;
    let mut exponent = NANOS_EXPONENT - i32::try_from(fraction.len()).ok()?;
    let mut multiplier: i128 = 1;
    match suffix {
        "" => {}
        "n" => exponent -= 9,
        "u" => exponent -= 6,
        "m" => exponent -= 3,
        "k" => exponent += 3,
        "M" => exponent += 6,
        "G" => exponent += 9,
        "T" => exponent += 12,
        "P" => exponent += 15,
        "E" => exponent += 18,
        "Ki" => multiplier = 1 << 10,
        "Mi" => multiplier = 1 << 20,
        "Gi" => multiplier = 1 << 30,
        "Ti" => multiplier = 1 << 40,
        "Pi" => multiplier = 1 << 50,
        "Ei" => multiplier = 1 << 60,
        s if s.starts_with(['e', 'E']) => exponent += s[1..].parse::<i32>().ok()?,
        _ => return None,
    }

    let value = mantissa.checked_mul(multiplier)?;
    let scale = 10i128.checked_pow(exponent.unsigned_abs())?;
    let value = if exponent >= 0 {
        value.checked_mul(scale)?
    } else {
        value / scale
    };
    Some(if negative { -value } else { value })
}
