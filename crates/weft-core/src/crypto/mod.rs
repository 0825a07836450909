//! Cryptographic primitives for weft.
//!
//! All cryptography uses well-audited primitives:
//!
//! - **X25519**: Channel key exchange (Diffie-Hellman)
//! - **Ed25519**: Client authentication signatures (identity)
//! - **ChaCha20-Poly1305**: Authenticated encryption (AEAD)
//! - **HKDF-SHA256**: Channel key schedule
//! - **PBKDF2-HMAC-SHA256**: Network id / network secret derivation
//!
//! ## Forbidden
//!
//! - Custom cryptography
//! - Unaudited primitives

pub mod channel;
mod kdf;
mod keys;

pub use channel::{
    ChannelConfig, ChannelReader, ChannelRole, ChannelWriter, RenegotiationPolicy, SecureChannel,
};
pub use kdf::{
    derive_group_network_id, derive_group_network_secret, derive_private_network_id,
    derive_private_network_secret, NetworkId, NetworkSecret,
};
pub use keys::{CipherSuite, MaskedUserId, NodeIdentity, UserId, USER_ID_SIZE};

use crate::error::{Error, Result};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::Zeroizing;

/// Key size for symmetric keys (256 bits).
pub const KEY_SIZE: usize = 32;

/// Derive keys using HKDF-SHA256.
pub fn hkdf_derive(
    salt: Option<&[u8]>,
    input_key_material: &[u8],
    info: &[u8],
    output_length: usize,
) -> Result<Zeroizing<Vec<u8>>> {
    let hkdf = Hkdf::<Sha256>::new(salt, input_key_material);
    let mut output = Zeroizing::new(vec![0u8; output_length]);
    hkdf.expand(info, &mut output)
        .map_err(|_| Error::Crypto("HKDF expansion failed".into()))?;
    Ok(output)
}

/// HMAC-SHA256 of `message` under `key`.
pub fn hmac_sha256(key: &[u8], message: &[u8]) -> [u8; 32] {
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(key)
        .expect("HMAC accepts keys of any length");
    mac.update(message);
    mac.finalize().into_bytes().into()
}

/// Generate cryptographically secure random bytes.
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut bytes);
    bytes
}

/// Constant-time comparison of byte slices.
///
/// Prevents timing attacks when comparing secrets.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut result = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hkdf_derive() {
        let ikm = b"input key material";
        let salt = b"salt";
        let info = b"weft key derivation";

        let out1 = hkdf_derive(Some(salt), ikm, info, 64).expect("should derive");
        assert_eq!(out1.len(), 64);

        // Deterministic
        let out2 = hkdf_derive(Some(salt), ikm, info, 64).expect("should derive");
        assert_eq!(&*out1, &*out2);

        // Different salt -> different output
        let out3 = hkdf_derive(Some(b"other"), ikm, info, 64).expect("should derive");
        assert_ne!(&*out1, &*out3);
    }

    #[test]
    fn test_hmac_deterministic() {
        let a = hmac_sha256(b"key", b"message");
        let b = hmac_sha256(b"key", b"message");
        assert_eq!(a, b);
        assert_ne!(a, hmac_sha256(b"other key", b"message"));
    }

    #[test]
    fn test_random_bytes() {
        let a: [u8; 32] = random_bytes();
        let b: [u8; 32] = random_bytes();
        assert_ne!(a, b);
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"hello", b"hello"));
        assert!(!constant_time_eq(b"hello", b"world"));
        assert!(!constant_time_eq(b"hello", b"hi"));
    }
}
