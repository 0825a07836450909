//! User identity types and keypairs.
//!
//! A user identity is a 256-bit value tied to a long-lived Ed25519
//! keypair held by the node. The masked form of an id is disclosable:
//! it lets a peer be looked up by id without revealing the id itself.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use zeroize::ZeroizeOnDrop;

use crate::error::{Error, Result};

/// Size of a user id in bytes (256 bits).
pub const USER_ID_SIZE: usize = 32;

/// Domain separator for user id masking.
const USER_ID_MASK_SALT: &[u8] = b"weft/user-id-mask/v1";

/// A 256-bit user identity.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(pub [u8; USER_ID_SIZE]);

impl UserId {
    /// Create from raw bytes.
    pub fn from_bytes(bytes: [u8; USER_ID_SIZE]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; USER_ID_SIZE] {
        &self.0
    }

    /// Masked form: `HMAC-SHA256(mask_salt, key = user_id)`.
    ///
    /// Public, and usable for DHT lookup without revealing the id.
    pub fn masked(&self) -> MaskedUserId {
        MaskedUserId(super::hmac_sha256(&self.0, USER_ID_MASK_SALT))
    }

    /// Bytewise XOR of two ids; commutative, used as the KDF salt for
    /// private networks.
    pub fn xor(&self, other: &UserId) -> [u8; USER_ID_SIZE] {
        let mut out = [0u8; USER_ID_SIZE];
        for (i, b) in out.iter_mut().enumerate() {
            *b = self.0[i] ^ other.0[i];
        }
        out
    }
}

impl fmt::Debug for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UserId({}…)", hex::encode(&self.0[..4]))
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}…", hex::encode(&self.0[..4]))
    }
}

/// The disclosable masked form of a [`UserId`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MaskedUserId(pub [u8; USER_ID_SIZE]);

impl MaskedUserId {
    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; USER_ID_SIZE] {
        &self.0
    }
}

impl fmt::Debug for MaskedUserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MaskedUserId({}…)", hex::encode(&self.0[..4]))
    }
}

/// Cipher suites a channel endpoint may offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum CipherSuite {
    /// ChaCha20-Poly1305 records, SHA-256 based key schedule.
    ChaCha20Poly1305Sha256 = 1,
}

impl CipherSuite {
    /// Parse from wire byte.
    pub fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            1 => Ok(Self::ChaCha20Poly1305Sha256),
            _ => Err(Error::Crypto(format!("unknown cipher suite: {byte:#04x}"))),
        }
    }

    /// Convert to wire byte.
    pub fn to_byte(self) -> u8 {
        self as u8
    }
}

/// The node's long-lived identity: user id plus Ed25519 signing keypair.
///
/// The secret half is zeroized on drop.
#[derive(ZeroizeOnDrop)]
pub struct NodeIdentity {
    #[zeroize(skip)]
    user_id: UserId,
    #[zeroize(skip)]
    signing: SigningKey,
}

impl NodeIdentity {
    /// Generate a fresh identity; the user id is the SHA-256 of the
    /// verifying key.
    pub fn generate() -> Self {
        let signing = SigningKey::generate(&mut OsRng);
        let user_id = UserId(Sha256::digest(signing.verifying_key().as_bytes()).into());
        Self { user_id, signing }
    }

    /// Restore from stored parts.
    pub fn from_parts(user_id: UserId, secret_key: [u8; 32]) -> Self {
        Self {
            user_id,
            signing: SigningKey::from_bytes(&secret_key),
        }
    }

    /// The local user id.
    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    /// The Ed25519 verifying key bytes.
    pub fn verifying_key_bytes(&self) -> [u8; 32] {
        self.signing.verifying_key().to_bytes()
    }

    /// Export the secret key bytes for storage.
    ///
    /// # Security
    /// These bytes must be encrypted before storage.
    pub fn secret_key_bytes(&self) -> [u8; 32] {
        self.signing.to_bytes()
    }

    /// Sign a message with the identity key.
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing.sign(message).to_bytes()
    }
}

impl fmt::Debug for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeIdentity")
            .field("user_id", &self.user_id)
            .field("signing", &"[REDACTED]")
            .finish()
    }
}

/// Verify a signature over `message` against raw verifying key bytes.
pub fn verify_signature(
    verifying_key: &[u8; 32],
    message: &[u8],
    signature: &[u8; 64],
) -> Result<()> {
    let key = VerifyingKey::from_bytes(verifying_key)
        .map_err(|_| Error::Crypto("invalid verifying key".into()))?;
    key.verify(message, &Signature::from_bytes(signature))
        .map_err(|_| Error::Crypto("signature verification failed".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_masked_id_deterministic() {
        let id = UserId([7u8; 32]);
        assert_eq!(id.masked(), id.masked());
        assert_ne!(id.masked().as_bytes(), id.as_bytes());
    }

    #[test]
    fn test_xor_commutative() {
        let a = UserId([1u8; 32]);
        let b = UserId([2u8; 32]);
        assert_eq!(a.xor(&b), b.xor(&a));
    }

    #[test]
    fn test_identity_roundtrip() {
        let identity = NodeIdentity::generate();
        let restored =
            NodeIdentity::from_parts(identity.user_id(), identity.secret_key_bytes());
        assert_eq!(identity.user_id(), restored.user_id());
        assert_eq!(identity.verifying_key_bytes(), restored.verifying_key_bytes());
    }

    #[test]
    fn test_sign_verify() {
        let identity = NodeIdentity::generate();
        let sig = identity.sign(b"transcript");
        verify_signature(&identity.verifying_key_bytes(), b"transcript", &sig)
            .expect("signature should verify");
        assert!(verify_signature(&identity.verifying_key_bytes(), b"other", &sig).is_err());
    }

    #[test]
    fn test_cipher_suite_roundtrip() {
        let suite = CipherSuite::ChaCha20Poly1305Sha256;
        assert_eq!(CipherSuite::from_byte(suite.to_byte()).unwrap(), suite);
        assert!(CipherSuite::from_byte(0xff).is_err());
    }
}
