//! The local profile/identity holder.
//!
//! One [`Node`] owns the user's long-lived keypair, display profile and
//! profile folder, and keeps the registry of live networks that guards
//! against two networks resolving to the same network id.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};

use crate::crypto::{CipherSuite, NetworkId, NodeIdentity, UserId};
use crate::error::{Error, Result};

/// Availability advertised in the profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProfileStatus {
    /// Away / signed out of sight.
    Inactive,
    /// Available.
    Active,
    /// Do not disturb.
    Busy,
}

/// The user's display profile.
#[derive(Debug, Clone)]
pub struct Profile {
    /// Display name.
    pub display_name: String,
    /// Availability.
    pub status: ProfileStatus,
    /// Free-form status message.
    pub status_message: String,
    /// Unix seconds of the last change.
    pub modified_at: i64,
}

impl Default for Profile {
    fn default() -> Self {
        Self {
            display_name: String::new(),
            status: ProfileStatus::Active,
            status_message: String::new(),
            modified_at: 0,
        }
    }
}

/// The user's display image.
#[derive(Debug, Clone, Default)]
pub struct ProfileImage {
    /// Encoded image bytes; empty when unset.
    pub image: Vec<u8>,
    /// Unix seconds of the last change.
    pub modified_at: i64,
}

/// The local identity, profile, and per-node network registry.
pub struct Node {
    identity: Arc<NodeIdentity>,
    profile: RwLock<Profile>,
    profile_image: RwLock<ProfileImage>,
    supported_ciphers: Vec<CipherSuite>,
    profile_folder: PathBuf,
    networks: Mutex<HashSet<NetworkId>>,
}

impl Node {
    /// Create a node around an identity and profile folder.
    pub fn new(identity: NodeIdentity, profile_folder: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            identity: Arc::new(identity),
            profile: RwLock::new(Profile::default()),
            profile_image: RwLock::new(ProfileImage::default()),
            supported_ciphers: vec![CipherSuite::ChaCha20Poly1305Sha256],
            profile_folder: profile_folder.into(),
            networks: Mutex::new(HashSet::new()),
        })
    }

    /// The local user id.
    pub fn user_id(&self) -> UserId {
        self.identity.user_id()
    }

    /// The identity keypair.
    pub fn identity(&self) -> Arc<NodeIdentity> {
        self.identity.clone()
    }

    /// Cipher suites offered on every channel.
    pub fn supported_ciphers(&self) -> Vec<CipherSuite> {
        self.supported_ciphers.clone()
    }

    /// Folder holding per-profile data, including `messages/`.
    pub fn profile_folder(&self) -> &Path {
        &self.profile_folder
    }

    /// Current profile snapshot.
    pub fn profile(&self) -> Profile {
        self.profile.read().expect("profile lock").clone()
    }

    /// Replace the profile, stamping the modification time.
    pub fn set_profile(
        &self,
        display_name: String,
        status: ProfileStatus,
        status_message: String,
        modified_at: i64,
    ) {
        let mut profile = self.profile.write().expect("profile lock");
        *profile = Profile {
            display_name,
            status,
            status_message,
            modified_at,
        };
    }

    /// Current profile image snapshot.
    pub fn profile_image(&self) -> ProfileImage {
        self.profile_image.read().expect("profile image lock").clone()
    }

    /// Replace the profile image.
    pub fn set_profile_image(&self, image: Vec<u8>, modified_at: i64) {
        let mut current = self.profile_image.write().expect("profile image lock");
        *current = ProfileImage { image, modified_at };
    }

    /// Claim a network id. Fails when another live network already holds
    /// the same id.
    pub fn register_network(&self, network_id: NetworkId) -> Result<()> {
        let mut networks = self.networks.lock().expect("registry lock");
        if !networks.insert(network_id) {
            return Err(Error::Policy("same network id already exists".into()));
        }
        Ok(())
    }

    /// Atomically swap a network's id after a shared-secret change.
    ///
    /// The old registration stays intact when the new id collides.
    pub fn network_changed(&self, old_id: NetworkId, new_id: NetworkId) -> Result<()> {
        let mut networks = self.networks.lock().expect("registry lock");
        if old_id == new_id {
            return Ok(());
        }
        if networks.contains(&new_id) {
            return Err(Error::Policy("same network id already exists".into()));
        }
        networks.remove(&old_id);
        networks.insert(new_id);
        Ok(())
    }

    /// Release a deleted network's id.
    pub fn unregister_network(&self, network_id: &NetworkId) {
        let mut networks = self.networks.lock().expect("registry lock");
        networks.remove(network_id);
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("user_id", &self.user_id())
            .field("profile_folder", &self.profile_folder)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::derive_group_network_id;

    #[test]
    fn test_registry_rejects_duplicates() {
        let node = Node::new(NodeIdentity::generate(), "/tmp/weft-test");
        let id = derive_group_network_id("lounge", None);

        node.register_network(id).expect("first registration");
        assert!(matches!(node.register_network(id), Err(Error::Policy(_))));

        node.unregister_network(&id);
        node.register_network(id).expect("after unregister");
    }

    #[test]
    fn test_network_changed_atomic() {
        let node = Node::new(NodeIdentity::generate(), "/tmp/weft-test");
        let a = derive_group_network_id("a", None);
        let b = derive_group_network_id("b", None);
        let c = derive_group_network_id("c", None);

        node.register_network(a).unwrap();
        node.register_network(b).unwrap();

        // Swapping a to b's id must fail and leave a registered.
        assert!(matches!(node.network_changed(a, b), Err(Error::Policy(_))));
        assert!(matches!(node.register_network(a), Err(Error::Policy(_))));

        // Swapping to a fresh id frees the old one.
        node.network_changed(a, c).unwrap();
        node.register_network(a).expect("old id released");
    }

    #[test]
    fn test_profile_updates() {
        let node = Node::new(NodeIdentity::generate(), "/tmp/weft-test");
        node.set_profile("nia".into(), ProfileStatus::Busy, "afk".into(), 42);

        let profile = node.profile();
        assert_eq!(profile.display_name, "nia");
        assert_eq!(profile.status, ProfileStatus::Busy);
        assert_eq!(profile.modified_at, 42);
    }
}
