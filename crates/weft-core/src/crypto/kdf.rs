//! Network id and network secret derivation.
//!
//! Both values are pure functions of (secret, identities | name). The KDF
//! is PBKDF2-HMAC-SHA256 applied twice: the first pass derives a 1 MiB
//! intermediate buffer with one iteration, the second runs PBKDF2 over
//! that buffer with one iteration to produce 32 bytes. The intermediate
//! buffer is an intentional memory barrier; the construction is fixed for
//! on-wire compatibility and must not be altered.
//!
//! Group network names are folded with ASCII lowercasing only before being
//! UTF-8 encoded as the salt. Callers that need Unicode case folding must
//! fold the name before constructing the network.

use pbkdf2::pbkdf2_hmac;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;
use zeroize::{Zeroize, Zeroizing};

use super::keys::UserId;

/// Domain separator mixed into the secret before deriving the network
/// secret, so it can never collide with the network id.
const NETWORK_SECRET_SALT: &[u8] = b"weft/network-secret/v1";

/// Size of the PBKDF2 intermediate buffer (1 MiB).
const INTERMEDIATE_SIZE: usize = 1024 * 1024;

/// A 256-bit network identifier; public, announced on the DHT.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NetworkId(pub [u8; 32]);

impl NetworkId {
    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for NetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NetworkId({}…)", hex::encode(&self.0[..4]))
    }
}

/// The 256-bit pre-shared key used by the secure channel after the
/// invitation phase. Zeroized on drop.
#[derive(Clone, PartialEq, Eq, Zeroize)]
pub struct NetworkSecret(pub [u8; 32]);

impl NetworkSecret {
    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for NetworkSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NetworkSecret([REDACTED])")
    }
}

/// The double-PBKDF2 construction shared by all derivations.
fn kdf(secret: &[u8], salt: &[u8]) -> [u8; 32] {
    let mut intermediate = Zeroizing::new(vec![0u8; INTERMEDIATE_SIZE]);
    pbkdf2_hmac::<Sha256>(secret, salt, 1, &mut intermediate);

    let mut output = [0u8; 32];
    pbkdf2_hmac::<Sha256>(&intermediate, salt, 1, &mut output);
    output
}

/// Salt for a private (two-party) network: XOR of both user ids.
fn private_salt(a: &UserId, b: &UserId) -> [u8; 32] {
    a.xor(b)
}

/// Salt for a group network: UTF-8 of the ASCII-lowercased name.
fn group_salt(network_name: &str) -> Vec<u8> {
    network_name.to_ascii_lowercase().into_bytes()
}

/// The secret input: UTF-8 of the shared secret, empty string when absent.
fn secret_bytes(shared_secret: Option<&str>) -> Vec<u8> {
    shared_secret.unwrap_or("").as_bytes().to_vec()
}

/// Network id for a private network between two user ids.
///
/// Symmetric in the two ids.
pub fn derive_private_network_id(
    a: &UserId,
    b: &UserId,
    shared_secret: Option<&str>,
) -> NetworkId {
    NetworkId(kdf(&secret_bytes(shared_secret), &private_salt(a, b)))
}

/// Network secret for a private network between two user ids.
pub fn derive_private_network_secret(
    a: &UserId,
    b: &UserId,
    shared_secret: Option<&str>,
) -> NetworkSecret {
    let secret = secret_bytes(shared_secret);
    let keyed = super::hmac_sha256(&secret, NETWORK_SECRET_SALT);
    NetworkSecret(kdf(&keyed, &private_salt(a, b)))
}

/// Network id for a named group network.
pub fn derive_group_network_id(network_name: &str, shared_secret: Option<&str>) -> NetworkId {
    NetworkId(kdf(&secret_bytes(shared_secret), &group_salt(network_name)))
}

/// Network secret for a named group network.
pub fn derive_group_network_secret(
    network_name: &str,
    shared_secret: Option<&str>,
) -> NetworkSecret {
    let secret = secret_bytes(shared_secret);
    let keyed = super::hmac_sha256(&secret, NETWORK_SECRET_SALT);
    NetworkSecret(kdf(&keyed, &group_salt(network_name)))
}
