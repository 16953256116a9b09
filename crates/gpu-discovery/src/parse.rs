//! Label value parsers
//!
//! Every parser is total: input that cannot be understood produces the zero
//! value (or `None`) instead of an error.

use std::cmp::Ordering;
use std::collections::BTreeSet;

/// Parses a memory size into MiB.
///
/// Accepts a decimal number followed by an optional unit (`KiB`, `MiB`, `GiB`,
/// `TiB` and their `Ki`/`KB`/`K` spellings, case-insensitive). A bare number
/// is taken as MiB. Negative or unparsable input yields `0`.
pub fn parse_memory_mib(value: &str) -> i64 {
    let value = value.trim();
    let split = value
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(value.len());
    let (number, unit) = value.split_at(split);

    let Ok(number) = number.parse::<f64>() else {
        return 0;
    };
    if !number.is_finite() || number < 0.0 {
        return 0;
    }

    let factor = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "mib" | "mi" | "mb" | "m" => 1.0,
        "gib" | "gi" | "gb" | "g" => 1024.0,
        "tib" | "ti" | "tb" | "t" => 1024.0 * 1024.0,
        "kib" | "ki" | "kb" | "k" => 1.0 / 1024.0,
        _ => return 0,
    };

    (number * factor) as i64
}

/// Parses the leading integer of a value, ignoring trailing units.
///
/// `"300 W"` is 300, `"250.5W"` is 250, `"x16"` has no leading integer.
pub fn parse_leading_int(value: &str) -> Option<i32> {
    let value = value.trim();
    let (sign, digits) = match value.strip_prefix('-') {
        Some(rest) => (-1, rest),
        None => (1, value),
    };
    let end = digits
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(digits.len());
    if end == 0 {
        return None;
    }
    digits[..end].parse::<i32>().ok().map(|n| sign * n)
}

/// Parses a boolean label value.
pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Some(true),
        "false" | "no" | "off" | "0" => Some(false),
        _ => None,
    }
}

/// Canonicalizes a device index: numeric strings lose their leading zeros,
/// anything else passes through unchanged, and an empty index is `"0"`.
pub fn canonical_index(value: &str) -> String {
    let value = value.trim();
    if value.is_empty() {
        return "0".to_string();
    }
    if value.bytes().all(|b| b.is_ascii_digit()) {
        let stripped = value.trim_start_matches('0');
        if stripped.is_empty() {
            return "0".to_string();
        }
        return stripped.to_string();
    }
    value.to_string()
}

/// Orders canonical indices: numeric ones numerically, then the rest
/// lexicographically.
pub fn compare_indices(a: &str, b: &str) -> Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        (Ok(_), Err(_)) => Ordering::Less,
        (Err(_), Ok(_)) => Ordering::Greater,
        (Err(_), Err(_)) => a.cmp(b),
    }
}

/// Normalizes a PCI id: trimmed, `0x` stripped, lower-case.
pub fn normalize_hex_id(value: &str) -> String {
    let value = value.trim();
    let value = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value);
    value.to_ascii_lowercase()
}

/// Canonicalizes a PCI bus address into `dddd:bb:dd.f`.
///
/// Accepts a 4 or 8 digit domain, or no domain at all. Invalid input yields
/// an empty string.
pub fn canonical_pci_address(value: &str) -> String {
    let value = value.trim().to_ascii_lowercase();
    let parts: Vec<&str> = value.split(':').collect();
    let (domain, bus, slot) = match parts.as_slice() {
        [domain, bus, slot] => (*domain, *bus, *slot),
        [bus, slot] => ("0000", *bus, *slot),
        _ => return String::new(),
    };

    let Some((device, function)) = slot.split_once('.') else {
        return String::new();
    };

    if !is_hex(domain, &[4, 8]) || !is_hex(bus, &[2]) || !is_hex(device, &[2]) {
        return String::new();
    }
    if function.len() != 1 || !matches!(function.as_bytes()[0], b'0'..=b'7') {
        return String::new();
    }

    let Ok(domain) = u32::from_str_radix(domain, 16) else {
        return String::new();
    };

    format!("{domain:04x}:{bus}:{device}.{function}")
}

fn is_hex(value: &str, lengths: &[usize]) -> bool {
    lengths.contains(&value.len()) && value.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Parses a precision list (comma or whitespace separated) into a sorted,
/// deduplicated, lower-case list.
pub fn parse_precisions(value: &str) -> Vec<String> {
    value
        .split(|c: char| c == ',' || c.is_whitespace())
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_ascii_lowercase)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}
