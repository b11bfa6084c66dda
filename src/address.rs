use crate::models::AddressInput;
use hex;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::sync::OnceLock;

/// Address normalization and fingerprinting.
///
/// The fingerprint is the cache primary key and the idempotency key for a
/// given address, so it must be deterministic and insensitive to the casing
/// and whitespace quirks of caller input. Two addresses that differ only in
/// formatting always map to the same hash.

fn zip_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\d{5}(-\d{4})?$").unwrap())
}

fn state_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z]{2}$").unwrap())
}

/// Lowercases and collapses internal whitespace to single spaces.
fn normalize_component(raw: &str) -> String {
    raw.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Canonical normalized form of an address: case-folded, whitespace-collapsed
/// components joined with `|`. The unit slot is always present (possibly
/// empty) so "no unit" and "unit X" never collide.
pub fn normalize_address(address: &AddressInput) -> String {
    format!(
        "{}|{}|{}|{}|{}",
        normalize_component(&address.street),
        normalize_component(address.unit.as_deref().unwrap_or("")),
        normalize_component(&address.city),
        normalize_component(&address.state),
        normalize_component(&address.zip),
    )
}

/// Deterministic fingerprint of a normalized address (hex-encoded SHA-256).
pub fn hash_address(address: &AddressInput) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_address(address).as_bytes());
    hex::encode(hasher.finalize())
}

/// Validates the shape of a caller-supplied address.
///
/// Returns a human-readable reason on failure. This guards job creation only;
/// whether the address actually matches a property is the provider's call.
pub fn validate_address(address: &AddressInput) -> Result<(), String> {
    if address.street.trim().is_empty() {
        return Err("street is required".to_string());
    }
    if address.city.trim().is_empty() {
        return Err("city is required".to_string());
    }
    if !state_regex().is_match(address.state.trim()) {
        return Err(format!(
            "state must be a 2-letter code, got '{}'",
            address.state
        ));
    }
    if !zip_regex().is_match(address.zip.trim()) {
        return Err(format!("zip must be 5 digits (+4 optional), got '{}'", address.zip));
    }
    Ok(())
}
