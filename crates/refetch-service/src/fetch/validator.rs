//! Derived weak validators for upstreams that do not send one.

use sha2::{Digest, Sha256};

/// Derives a weak ETag-style validator from the exact fetched bytes.
///
/// The derivation is a SHA-256 digest, hex-encoded and wrapped in the HTTP
/// weak-validator form, so byte-identical content always produces the same
/// validator and the `W/` prefix marks it as derived rather than
/// upstream-supplied.
pub fn derive_weak_validator(body: &[u8]) -> String {
    let digest = Sha256::digest(body);
    format!("W/\"sha256-{}\"", hex::encode(digest))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_bytes_yield_identical_validators() {
        assert_eq!(derive_weak_validator(b"{\"v\":1}"), derive_weak_validator(b"{\"v\":1}"));
    }

    #[test]
    fn different_bytes_yield_different_validators() {
        assert_ne!(derive_weak_validator(b"{\"v\":1}"), derive_weak_validator(b"{\"v\":2}"));
    }

    #[test]
    fn validators_are_marked_weak() {
        let tag = derive_weak_validator(b"content");
        assert!(tag.starts_with("W/\"sha256-"));
        assert!(tag.ends_with('"'));
    }
}
