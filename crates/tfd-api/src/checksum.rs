//! Upload checksum gate.

use sha2::{Digest, Sha256};

/// Lower-hex SHA-256 of the archive body.
#[must_use]
pub fn calculate_checksum(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Validates a client-supplied checksum against the body.
///
/// An empty checksum is accepted with a warning; a non-empty mismatch is
/// rejected.
#[must_use]
pub fn is_checksum_valid(data: &[u8], supplied: &str) -> bool {
    if supplied.is_empty() {
        tracing::warn!("field checksum is empty");
        return true;
    }
    supplied == calculate_checksum(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_is_lower_hex_sha256() {
        // sha256("abc")
        assert_eq!(
            calculate_checksum(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn empty_checksum_is_accepted() {
        assert!(is_checksum_valid(b"payload", ""));
    }

    #[test]
    fn matching_checksum_is_accepted() {
        let sum = calculate_checksum(b"payload");
        assert!(is_checksum_valid(b"payload", &sum));
    }

    #[test]
    fn mismatched_checksum_is_rejected() {
        assert!(!is_checksum_valid(b"payload", "deadbeef"));
        let uppercase = calculate_checksum(b"payload").to_uppercase();
        assert!(!is_checksum_valid(b"payload", &uppercase));
    }
}
