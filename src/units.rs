//! Capacity quantity handling
//!
//! Kubernetes expresses storage sizes as quantity strings ("10Gi", "512Mi",
//! "5G", plain bytes). The LVM tools want their own suffix form ("10g").
//! Everything size-related in the provisioner goes through here so that
//! comparisons are always done in bytes.

use crate::error::{Error, Result};

const KIB: u64 = 1024;
const MIB: u64 = KIB * 1024;
const GIB: u64 = MIB * 1024;
const TIB: u64 = GIB * 1024;

/// Parse a Kubernetes quantity string into bytes.
///
/// Supports the binary suffixes (Ki/Mi/Gi/Ti), the decimal suffixes
/// (k/K/M/G/T) and bare byte counts. Fractional values are rejected; the
/// control plane never produces them for storage requests.
pub fn parse_quantity(quantity: &str) -> Result<u64> {
    let s = quantity.trim();
    if s.is_empty() {
        return Err(Error::CapacityParse("empty quantity".into()));
    }

    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(s.len());
    let (digits, suffix) = s.split_at(split);

    let value: u64 = digits
        .parse()
        .map_err(|_| Error::CapacityParse(format!("invalid quantity: {quantity}")))?;

    let multiplier = match suffix {
        "" => 1,
        "Ki" => KIB,
        "Mi" => MIB,
        "Gi" => GIB,
        "Ti" => TIB,
        "k" | "K" => 1_000,
        "M" => 1_000_000,
        "G" => 1_000_000_000,
        "T" => 1_000_000_000_000,
        other => {
            return Err(Error::CapacityParse(format!(
                "unknown capacity suffix '{other}' in {quantity}"
            )))
        }
    };

    value
        .checked_mul(multiplier)
        .ok_or_else(|| Error::CapacityParse(format!("quantity overflow: {quantity}")))
}

/// Render a quantity string as an LVM size argument.
///
/// LVM understands binary-unit suffixes in lowercase single letters
/// ("10g" is 10GiB), so "10Gi" maps directly to "10g" and a decimal "10G"
/// is converted through bytes.
pub fn lvm_size_arg(quantity: &str) -> Result<String> {
    let s = quantity.trim();
    for (k8s, lvm) in [("Ki", "k"), ("Mi", "m"), ("Gi", "g"), ("Ti", "t")] {
        if let Some(digits) = s.strip_suffix(k8s) {
            if digits.chars().all(|c| c.is_ascii_digit()) && !digits.is_empty() {
                return Ok(format!("{digits}{lvm}"));
            }
        }
    }
    // Decimal or bare-byte quantities go through bytes; lvcreate accepts
    // a plain byte count with the "b" suffix.
    let bytes = parse_quantity(s)?;
    Ok(format!("{bytes}b"))
}
