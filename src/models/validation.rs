// Barcode Manager - Validation Utilities
// Copyright (C) 2026 The Barcode Manager Authors
// SPDX-License-Identifier: MIT

//! Input validation for connection settings.

use once_cell::sync::Lazy;
use regex::Regex;
use uuid::Uuid;

static BDADDR_RE: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"^[0-9A-Fa-f]{2}([:-][0-9A-Fa-f]{2}){5}$").ok());

/// Canonical form of a hardware address: upper-case, colon separated.
///
/// Accepts `aa:bb:cc:dd:ee:ff` and `AA-BB-CC-DD-EE-FF`.
pub fn canonical_bdaddr(s: &str) -> Option<String> {
    let s = s.trim();
    let valid = match BDADDR_RE.as_ref() {
        Some(re) => re.is_match(s),
        None => false,
    };
    if !valid {
        return None;
    }
    Some(s.replace('-', ":").to_uppercase())
}

/// Format six raw address bytes as `AA:BB:CC:DD:EE:FF`.
pub fn format_bdaddr(bytes: &[u8]) -> Option<String> {
    if bytes.len() != 6 {
        return None;
    }
    Some(
        bytes
            .iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join(":"),
    )
}

/// Parse a textual address into its six bytes.
pub fn parse_bdaddr(s: &str) -> Option<[u8; 6]> {
    let canonical = canonical_bdaddr(s)?;
    let mut out = [0u8; 6];
    for (slot, part) in out.iter_mut().zip(canonical.split(':')) {
        *slot = u8::from_str_radix(part, 16).ok()?;
    }
    Some(out)
}

/// Whether two textual addresses name the same device.
pub fn bdaddr_eq(a: &str, b: &str) -> bool {
    match (canonical_bdaddr(a), canonical_bdaddr(b)) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

/// Validate a connection UUID.
pub fn validate_uuid(s: &str) -> bool {
    Uuid::parse_str(s).is_ok()
}
