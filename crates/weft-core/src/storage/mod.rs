//! Persistence: the encrypted message log and network state snapshots.

pub mod message_store;
pub mod state;

pub use message_store::MessageStore;
pub use state::NetworkState;

use std::path::{Path, PathBuf};

/// Subdirectory of the profile folder holding message stores.
pub const MESSAGES_DIR: &str = "messages";

/// `{profile_folder}/messages/`.
pub fn messages_dir(profile_folder: &Path) -> PathBuf {
    profile_folder.join(MESSAGES_DIR)
}
