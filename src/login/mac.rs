//! Hashed MAC addresses
//!
//! Peers identify their machine with a salted hash of a MAC address rather
//! than the address itself. The hash feeds ban and mute enforcement.

use sha2::{Digest, Sha256};

/// Prefix every valid MAC hash starts with
pub const MAC_HASH_PREFIX: &str = "$1$MH$";

const MAC_HASH_SALT: &str = "MH";
const DIGEST_HEX_LEN: usize = 64;

/// Hash a raw MAC address (or any stable machine identifier)
pub fn hash_mac_address(raw: &str) -> String {
    let normalized = raw.trim().to_lowercase().replace('-', ":");
    let mut hasher = Sha256::new();
    hasher.update(MAC_HASH_SALT.as_bytes());
    hasher.update(normalized.as_bytes());
    format!("{}{}", MAC_HASH_PREFIX, hex::encode(hasher.finalize()))
}

/// Check that a claimed hash has the shape `hash_mac_address` produces
pub fn is_valid_mac_hash(hash: &str) -> bool {
    match hash.strip_prefix(MAC_HASH_PREFIX) {
        Some(digest) => {
            digest.len() == DIGEST_HEX_LEN
                && digest.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
        }
        None => false,
    }
}

/// Machine identifier for hosts where no MAC address is configured
pub fn local_machine_hash() -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    hash_mac_address(&host)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_valid_and_stable() {
        let a = hash_mac_address("00:1A:2B:3C:4D:5E");
        let b = hash_mac_address("00-1a-2b-3c-4d-5e");
        assert_eq!(a, b);
        assert!(is_valid_mac_hash(&a));
        assert_ne!(a, hash_mac_address("00:1a:2b:3c:4d:5f"));
    }

    #[test]
    fn test_invalid_hashes() {
        assert!(!is_valid_mac_hash(""));
        assert!(!is_valid_mac_hash("00:1a:2b:3c:4d:5e"));
        assert!(!is_valid_mac_hash("$1$MH$abc"));
        let upper = hash_mac_address("x").to_uppercase();
        assert!(!is_valid_mac_hash(&upper));
    }

    #[test]
    fn test_local_machine_hash_is_valid() {
        assert!(is_valid_mac_hash(&local_machine_hash()));
    }
}
