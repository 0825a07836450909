//! Identity-scoped session bucket.
//!
//! A peer owns zero or more sessions to the same user id; it is online
//! while any session lives. Sends fan out to every session. The self
//! peer exists in every network and hosts sessions from the local user's
//! other devices.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, RwLock};
use tracing::warn;

use super::events::ConnectivityStatus;
use super::session::Session;
use crate::crypto::UserId;
use crate::error::{Error, Result};
use crate::protocol::packet::{MeshPacket, PeerInfo, ProfilePayload};
use crate::transport::EndPoint;
use crate::MAX_MESSAGE_SIZE;

#[derive(Debug, Clone)]
struct PeerConnectivity {
    status: ConnectivityStatus,
    not_connected_with: Vec<UserId>,
}

/// A participant of the network, self included.
pub struct Peer {
    user_id: UserId,
    is_self: bool,
    profile: RwLock<Option<ProfilePayload>>,
    profile_image: RwLock<(Vec<u8>, i64)>,
    sessions: RwLock<Vec<Arc<Session>>>,
    connectivity: Mutex<PeerConnectivity>,
}

impl Peer {
    /// Create a peer bucket with no sessions.
    pub fn new(user_id: UserId, is_self: bool) -> Arc<Self> {
        Arc::new(Self {
            user_id,
            is_self,
            profile: RwLock::new(None),
            profile_image: RwLock::new((Vec::new(), 0)),
            sessions: RwLock::new(Vec::new()),
            connectivity: Mutex::new(PeerConnectivity {
                status: ConnectivityStatus::NoNetwork,
                not_connected_with: Vec::new(),
            }),
        })
    }

    /// The peer's user id.
    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    /// Whether this is the local user's own bucket.
    pub fn is_self(&self) -> bool {
        self.is_self
    }

    /// Whether at least one session is live.
    pub fn is_online(&self) -> bool {
        !self.sessions.read().expect("session lock").is_empty()
    }

    /// Snapshot of the current sessions.
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions.read().expect("session lock").clone()
    }

    /// Whether any session terminates at `ep`.
    pub fn has_session_to(&self, ep: &EndPoint) -> bool {
        self.sessions
            .read()
            .expect("session lock")
            .iter()
            .any(|s| s.remote_ep() == *ep)
    }

    /// Add a session. Returns true when the peer just came online.
    pub fn add_session(&self, session: Arc<Session>) -> bool {
        let mut sessions = self.sessions.write().expect("session lock");
        let was_offline = sessions.is_empty();
        sessions.push(session);
        was_offline
    }

    /// Remove a session. Returns true when the peer just went offline;
    /// removal is idempotent.
    pub fn remove_session(&self, session: &Arc<Session>) -> bool {
        let mut sessions = self.sessions.write().expect("session lock");
        let before = sessions.len();
        sessions.retain(|s| !Arc::ptr_eq(s, session));
        before > 0 && sessions.is_empty()
    }

    /// Fan a control packet out to every session. Messages above the
    /// channel's frame limit are rejected before any send.
    pub async fn send_packet(&self, packet: &MeshPacket) -> Result<()> {
        let encoded = packet.to_bytes()?;
        if encoded.len() > MAX_MESSAGE_SIZE {
            return Err(Error::Policy(format!(
                "message too large: {} > {MAX_MESSAGE_SIZE}",
                encoded.len()
            )));
        }

        let sessions = self.sessions();
        if sessions.is_empty() {
            return Err(Error::NoSession);
        }
        for session in sessions {
            if let Err(e) = session.send_packet(packet).await {
                warn!(peer = %self.user_id, error = %e, "session send failed");
            }
        }
        Ok(())
    }

    /// Tear down every session.
    pub fn disconnect(&self) {
        let sessions = {
            let mut guard = self.sessions.write().expect("session lock");
            std::mem::take(&mut *guard)
        };
        for session in sessions {
            session.close();
        }
    }

    /// Current profile, when one was received.
    pub fn profile(&self) -> Option<ProfilePayload> {
        self.profile.read().expect("profile lock").clone()
    }

    /// Display name from the profile.
    pub fn display_name(&self) -> Option<String> {
        self.profile
            .read()
            .expect("profile lock")
            .as_ref()
            .map(|p| p.display_name.clone())
    }

    /// Apply a received profile when it is newer. Returns whether it was
    /// applied.
    pub fn update_profile(&self, payload: ProfilePayload) -> bool {
        let mut profile = self.profile.write().expect("profile lock");
        let newer = profile
            .as_ref()
            .map_or(true, |current| payload.modified_at > current.modified_at);
        if newer {
            *profile = Some(payload);
        }
        newer
    }

    /// Current profile image bytes and timestamp.
    pub fn profile_image(&self) -> (Vec<u8>, i64) {
        self.profile_image.read().expect("profile image lock").clone()
    }

    /// Apply a received profile image when newer.
    pub fn update_profile_image(&self, image: Vec<u8>, modified_at: i64) -> bool {
        let mut current = self.profile_image.write().expect("profile image lock");
        if modified_at > current.1 {
            *current = (image, modified_at);
            true
        } else {
            false
        }
    }

    /// Peers this peer reports being connected with, merged over its
    /// sessions' last peer-exchange payloads.
    pub fn reported_connected(&self) -> HashSet<UserId> {
        let mut connected = HashSet::new();
        for session in self.sessions() {
            for info in session.last_peer_exchange() {
                connected.insert(info.user_id);
            }
        }
        connected
    }

    /// Endpoints of the peer's current sessions, for gossip and
    /// snapshots.
    pub fn session_endpoints(&self) -> Vec<EndPoint> {
        let mut endpoints: Vec<EndPoint> = self
            .sessions()
            .iter()
            .map(|s| s.remote_ep())
            .collect();
        endpoints.dedup();
        endpoints
    }

    /// Gossip record for this peer.
    pub fn peer_info(&self) -> PeerInfo {
        PeerInfo {
            user_id: self.user_id,
            display_name: self.display_name(),
            endpoints: self.session_endpoints(),
        }
    }

    /// Current connectivity status.
    pub fn connectivity_status(&self) -> ConnectivityStatus {
        self.connectivity.lock().expect("connectivity lock").status
    }

    /// Known participants this peer is not connected with.
    pub fn not_connected_with(&self) -> Vec<UserId> {
        self.connectivity
            .lock()
            .expect("connectivity lock")
            .not_connected_with
            .clone()
    }

    /// Update connectivity state. Returns whether the status changed.
    pub fn set_connectivity(
        &self,
        status: ConnectivityStatus,
        not_connected_with: Vec<UserId>,
    ) -> bool {
        let mut connectivity = self.connectivity.lock().expect("connectivity lock");
        let changed = connectivity.status != status;
        connectivity.status = status;
        connectivity.not_connected_with = not_connected_with;
        changed
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("user_id", &self.user_id)
            .field("is_self", &self.is_self)
            .field("online", &self.is_online())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::ProfileStatus;

    fn uid(b: u8) -> UserId {
        UserId([b; 32])
    }

    #[test]
    fn test_offline_without_sessions() {
        let peer = Peer::new(uid(2), false);
        assert!(!peer.is_online());
        assert_eq!(peer.connectivity_status(), ConnectivityStatus::NoNetwork);
    }

    #[tokio::test]
    async fn test_send_without_session_fails() {
        let peer = Peer::new(uid(2), false);
        assert!(matches!(
            peer.send_packet(&MeshPacket::PingRequest).await,
            Err(Error::NoSession)
        ));
    }

    #[test]
    fn test_profile_newest_wins() {
        let peer = Peer::new(uid(2), false);
        let older = ProfilePayload {
            display_name: "old".into(),
            status: ProfileStatus::Active,
            status_message: String::new(),
            modified_at: 100,
        };
        let newer = ProfilePayload {
            display_name: "new".into(),
            status: ProfileStatus::Busy,
            status_message: String::new(),
            modified_at: 200,
        };

        assert!(peer.update_profile(newer.clone()));
        assert!(!peer.update_profile(older));
        assert_eq!(peer.display_name().as_deref(), Some("new"));
    }

    #[test]
    fn test_profile_image_newest_wins() {
        let peer = Peer::new(uid(2), false);
        assert!(peer.update_profile_image(vec![1], 100));
        assert!(!peer.update_profile_image(vec![2], 50));
        assert_eq!(peer.profile_image(), (vec![1], 100));
    }

    #[test]
    fn test_connectivity_change_detection() {
        let peer = Peer::new(uid(2), false);
        assert!(peer.set_connectivity(ConnectivityStatus::PartialMeshNetwork, vec![uid(3)]));
        assert!(!peer.set_connectivity(ConnectivityStatus::PartialMeshNetwork, vec![]));
        assert!(peer.set_connectivity(ConnectivityStatus::FullMeshNetwork, vec![]));
    }
}
