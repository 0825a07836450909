//! Per-network orchestration.
//!
//! A [`Network`] turns discovered endpoints into an authenticated
//! overlay: it runs the peer-search and keepalive timers, dials with
//! virtual fallback, classifies joining identities, gossips connected
//! peers, aggregates connectivity, and drives the message pipeline over
//! its encrypted log.
//!
//! Ownership is cyclic on paper (network ⇄ peer ⇄ session); every upward
//! reference here is a `Weak`, every downward one an `Arc`, and teardown
//! cascades top-down under the network-level operation lock.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use super::events::{ConnectivityStatus, EventBus, NetworkEvent};
use super::message::{MessageItem, MessageType};
use super::peer::Peer;
use super::session::{Session, SessionDispatcher};
use super::transfer;
use crate::crypto::{
    derive_group_network_id, derive_group_network_secret, derive_private_network_id,
    derive_private_network_secret, ChannelConfig, ChannelRole, NetworkId, NetworkSecret,
    RenegotiationPolicy, SecureChannel, UserId,
};
use crate::error::{Error, Result};
use crate::node::Node;
use crate::protocol::packet::{MeshPacket, PeerInfo, ProfilePayload};
use crate::protocol::{decode_frame, Frame};
use crate::storage::state::{NetworkKind, NetworkStatus};
use crate::storage::{messages_dir, MessageStore, NetworkState};
use crate::transport::discovery::{Dht, DiscoveryBridge};
use crate::transport::{is_local_network_endpoint, Connection, ConnectionManager, EndPoint};
use crate::MAX_MESSAGE_SIZE;

/// Peer search / announce cadence while online.
const PEER_SEARCH_INTERVAL: Duration = Duration::from_secs(60);

/// Delay before the first peer search tick.
const PEER_SEARCH_INITIAL_DELAY: Duration = Duration::from_secs(1);

/// Keepalive cadence; the first tick is disabled.
const PING_INTERVAL: Duration = Duration::from_secs(15);

/// Delay before re-dialling a lost session's endpoint.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

#[derive(Clone)]
struct Secrets {
    shared_secret: String,
    network_id: NetworkId,
    network_secret: NetworkSecret,
}

#[derive(Debug, Clone, Default)]
struct NetworkOptions {
    local_network_only: bool,
    local_network_only_at: i64,
    group_image: Vec<u8>,
    group_image_at: i64,
    group_locked: bool,
    group_locked_at: i64,
    mute: bool,
}

/// One mesh network on a node.
pub struct Network {
    node: Arc<Node>,
    connections: Arc<dyn ConnectionManager>,
    discovery: DiscoveryBridge,
    kind: NetworkKind,
    network_name: Option<String>,
    other_user_id: Option<UserId>,
    secrets: RwLock<Secrets>,
    status: RwLock<NetworkStatus>,
    peers: RwLock<HashMap<UserId, Arc<Peer>>>,
    store: Arc<MessageStore>,
    options: Mutex<NetworkOptions>,
    events: EventBus,
    seen: Mutex<HashSet<(UserId, u32)>>,
    timers: Mutex<Vec<JoinHandle<()>>>,
    op_lock: tokio::sync::Mutex<()>,
    weak: Weak<Network>,
}

impl Network {
    /// Create a private network towards `other_user_id`.
    pub fn new_private(
        node: Arc<Node>,
        connections: Arc<dyn ConnectionManager>,
        dht: Arc<dyn Dht>,
        other_user_id: UserId,
        shared_secret: Option<&str>,
    ) -> Result<Arc<Self>> {
        let local = node.user_id();
        if other_user_id == local {
            return Err(Error::Policy("cannot create a private network with self".into()));
        }
        let network_id = derive_private_network_id(&local, &other_user_id, shared_secret);
        let network_secret = derive_private_network_secret(&local, &other_user_id, shared_secret);
        Self::build(
            node,
            connections,
            dht,
            NetworkKind::Private,
            None,
            Some(other_user_id),
            shared_secret.unwrap_or("").to_string(),
            network_id,
            network_secret,
            None,
            NetworkOptions::default(),
            Vec::new(),
        )
    }

    /// Create a named group network.
    pub fn new_group(
        node: Arc<Node>,
        connections: Arc<dyn ConnectionManager>,
        dht: Arc<dyn Dht>,
        network_name: &str,
        shared_secret: Option<&str>,
    ) -> Result<Arc<Self>> {
        let network_id = derive_group_network_id(network_name, shared_secret);
        let network_secret = derive_group_network_secret(network_name, shared_secret);
        Self::build(
            node,
            connections,
            dht,
            NetworkKind::Group,
            Some(network_name.to_string()),
            None,
            shared_secret.unwrap_or("").to_string(),
            network_id,
            network_secret,
            None,
            NetworkOptions::default(),
            Vec::new(),
        )
    }

    /// Restore a network from a snapshot. The network starts offline
    /// regardless of the snapshot's status field.
    pub async fn restore(
        node: Arc<Node>,
        connections: Arc<dyn ConnectionManager>,
        dht: Arc<dyn Dht>,
        state: NetworkState,
    ) -> Result<Arc<Self>> {
        if state.local_user_id != node.user_id() {
            return Err(Error::InvariantViolation(
                "snapshot belongs to a different user".into(),
            ));
        }
        let key: [u8; 32] = state
            .message_store_key
            .as_slice()
            .try_into()
            .map_err(|_| Error::Parse("invalid message store key length".into()))?;

        let other_user_id = match state.kind {
            NetworkKind::Private => Some(
                state
                    .peers
                    .first()
                    .ok_or_else(|| Error::Parse("private snapshot requires one peer".into()))?
                    .user_id,
            ),
            NetworkKind::Group => None,
        };

        let network = Self::build(
            node,
            connections,
            dht,
            state.kind,
            state.network_name.clone(),
            other_user_id,
            state.shared_secret.clone(),
            state.network_id,
            state.network_secret.clone(),
            Some((state.message_store_id.clone(), key)),
            NetworkOptions {
                local_network_only: state.local_network_only,
                local_network_only_at: state.local_network_only_at,
                group_image: state.group_image.clone(),
                group_image_at: state.group_image_at,
                group_locked: state.group_locked,
                group_locked_at: state.group_locked_at,
                mute: state.mute,
            },
            state.peers,
        )?;

        network.prime_seen().await?;
        Ok(network)
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        node: Arc<Node>,
        connections: Arc<dyn ConnectionManager>,
        dht: Arc<dyn Dht>,
        kind: NetworkKind,
        network_name: Option<String>,
        other_user_id: Option<UserId>,
        shared_secret: String,
        network_id: NetworkId,
        network_secret: NetworkSecret,
        store_params: Option<(String, [u8; 32])>,
        options: NetworkOptions,
        known_peers: Vec<PeerInfo>,
    ) -> Result<Arc<Self>> {
        node.register_network(network_id)?;

        let (store_id, store_key) = store_params.unwrap_or_else(|| {
            (
                hex::encode(crate::crypto::random_bytes::<16>()),
                crate::crypto::random_bytes::<32>(),
            )
        });
        let store = match MessageStore::open(
            &messages_dir(node.profile_folder()),
            &store_id,
            store_key,
        ) {
            Ok(store) => Arc::new(store),
            Err(e) => {
                node.unregister_network(&network_id);
                return Err(e);
            }
        };

        let local = node.user_id();
        let mut peers = HashMap::new();
        peers.insert(local, Peer::new(local, true));
        if let Some(other) = other_user_id {
            peers.insert(other, Peer::new(other, false));
        }
        for info in &known_peers {
            if info.user_id != local {
                peers.entry(info.user_id).or_insert_with(|| Peer::new(info.user_id, false));
            }
        }

        let discovery = DiscoveryBridge::new(dht, connections.clone());
        let network = Arc::new_cyclic(|weak| Self {
            node,
            connections,
            discovery,
            kind,
            network_name,
            other_user_id,
            secrets: RwLock::new(Secrets {
                shared_secret,
                network_id,
                network_secret,
            }),
            status: RwLock::new(NetworkStatus::Offline),
            peers: RwLock::new(peers),
            store,
            options: Mutex::new(options),
            events: EventBus::new(),
            seen: Mutex::new(HashSet::new()),
            timers: Mutex::new(Vec::new()),
            op_lock: tokio::sync::Mutex::new(()),
            weak: weak.clone(),
        });

        info!(kind = ?network.kind, network = %crate::logging::ShortId(network.network_id().as_bytes()), "network created");
        Ok(network)
    }

    /// Rebuild the duplicate-suppression set from persisted entries.
    async fn prime_seen(&self) -> Result<()> {
        let local = self.node.user_id();
        let count = self.store.message_count().await;
        for number in 0..count {
            let item = self.store.read(number).await?;
            if item.sender != local {
                if let Some(remote_number) = item.remote_number {
                    self.seen
                        .lock()
                        .expect("seen lock")
                        .insert((item.sender, remote_number));
                }
            }
        }
        Ok(())
    }

    // --- accessors ---------------------------------------------------

    /// Network variant.
    pub fn kind(&self) -> NetworkKind {
        self.kind
    }

    /// Group name, for group networks.
    pub fn network_name(&self) -> Option<&str> {
        self.network_name.as_deref()
    }

    /// The other party, for private networks.
    pub fn other_user_id(&self) -> Option<UserId> {
        self.other_user_id
    }

    /// Current derived network id.
    pub fn network_id(&self) -> NetworkId {
        self.secrets.read().expect("secrets lock").network_id
    }

    /// The message log.
    pub fn store(&self) -> &Arc<MessageStore> {
        &self.store
    }

    /// Subscribe to this network's events.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<NetworkEvent> {
        self.events.subscribe()
    }

    /// Current status.
    pub fn status(&self) -> NetworkStatus {
        *self.status.read().expect("status lock")
    }

    /// Whether the network is online.
    pub fn is_online(&self) -> bool {
        self.status() == NetworkStatus::Online
    }

    /// The local-network-only flag.
    pub fn local_network_only(&self) -> bool {
        self.options.lock().expect("options lock").local_network_only
    }

    /// The advisory group lock flag.
    pub fn group_locked(&self) -> bool {
        self.options.lock().expect("options lock").group_locked
    }

    /// The mute flag.
    pub fn mute(&self) -> bool {
        self.options.lock().expect("options lock").mute
    }

    /// Group display image bytes and timestamp.
    pub fn group_image(&self) -> (Vec<u8>, i64) {
        let options = self.options.lock().expect("options lock");
        (options.group_image.clone(), options.group_image_at)
    }

    /// Known peers, self included.
    pub fn peers(&self) -> Vec<Arc<Peer>> {
        self.peers
            .read()
            .expect("peer table lock")
            .values()
            .cloned()
            .collect()
    }

    /// Look a peer up by user id.
    pub fn peer(&self, user_id: &UserId) -> Option<Arc<Peer>> {
        self.peers
            .read()
            .expect("peer table lock")
            .get(user_id)
            .cloned()
    }

    /// The self peer.
    pub fn self_peer(&self) -> Arc<Peer> {
        self.peer(&self.node.user_id()).expect("self peer always exists")
    }

    fn other_peer(&self) -> Option<Arc<Peer>> {
        self.other_user_id.and_then(|id| self.peer(&id))
    }

    fn get_or_insert_peer(&self, user_id: UserId) -> (Arc<Peer>, bool) {
        let mut peers = self.peers.write().expect("peer table lock");
        match peers.get(&user_id) {
            Some(peer) => (peer.clone(), false),
            None => {
                let peer = Peer::new(user_id, false);
                peers.insert(user_id, peer.clone());
                (peer, true)
            }
        }
    }

    fn has_session_to(&self, ep: &EndPoint) -> bool {
        self.peers().iter().any(|p| p.has_session_to(ep))
    }

    // --- status machine ----------------------------------------------

    /// Go online: start the peer-search and keepalive timers.
    pub async fn go_online(&self) {
        let _op = self.op_lock.lock().await;
        {
            let mut status = self.status.write().expect("status lock");
            if *status == NetworkStatus::Online {
                return;
            }
            *status = NetworkStatus::Online;
        }
        info!(network = %crate::logging::ShortId(self.network_id().as_bytes()), "going online");

        let weak = self.weak.clone();
        let search = tokio::spawn(async move {
            tokio::time::sleep(PEER_SEARCH_INITIAL_DELAY).await;
            loop {
                let Some(network) = weak.upgrade() else { break };
                if !network.is_online() {
                    break;
                }
                network.peer_search().await;
                drop(network);
                tokio::time::sleep(PEER_SEARCH_INTERVAL).await;
            }
        });

        let weak = self.weak.clone();
        let ping = tokio::spawn(async move {
            loop {
                tokio::time::sleep(PING_INTERVAL).await;
                let Some(network) = weak.upgrade() else { break };
                if !network.is_online() {
                    break;
                }
                network.broadcast_packet(&MeshPacket::PingRequest).await;
            }
        });

        let mut timers = self.timers.lock().expect("timer lock");
        timers.push(search);
        timers.push(ping);
    }

    /// Go offline: stop timers and disconnect every peer.
    pub async fn go_offline(&self) {
        let _op = self.op_lock.lock().await;
        {
            let mut status = self.status.write().expect("status lock");
            if *status == NetworkStatus::Offline {
                return;
            }
            *status = NetworkStatus::Offline;
        }
        info!(network = %crate::logging::ShortId(self.network_id().as_bytes()), "going offline");

        for timer in self.timers.lock().expect("timer lock").drain(..) {
            timer.abort();
        }

        for peer in self.peers() {
            if peer.is_online() {
                peer.disconnect();
                peer.set_connectivity(ConnectivityStatus::NoNetwork, Vec::new());
                self.events.emit(NetworkEvent::PeerStateChanged {
                    user_id: peer.user_id(),
                    online: false,
                });
                self.events.emit(NetworkEvent::ConnectivityStatusChanged {
                    user_id: peer.user_id(),
                    status: ConnectivityStatus::NoNetwork,
                });
            }
        }
    }

    /// Delete the network: disconnect, unregister from relays and the
    /// node, and remove the message store files.
    pub async fn delete(&self) -> Result<()> {
        self.go_offline().await;
        let network_id = self.network_id();
        self.discovery.retire_network(&network_id).await;
        self.node.unregister_network(&network_id);
        self.store.delete().await
    }

    // --- discovery & dialling ----------------------------------------

    async fn peer_search(&self) {
        let local_only = self.local_network_only();

        if self.kind == NetworkKind::Private {
            if let Some(other) = self.other_peer() {
                if other.is_online() {
                    // Connected: the search timer has nothing to do.
                    return;
                }
            }
        }

        let endpoints = if self.kind == NetworkKind::Private && self.invitation_pending().await {
            let other = self.other_user_id.expect("private network has other id");
            self.discovery.search_masked(&other.masked(), local_only).await
        } else {
            self.discovery
                .announce_network(&self.network_id(), local_only)
                .await
        };

        for ep in endpoints {
            if let Err(e) = self.begin_make_connection(ep, None) {
                debug!(endpoint = %ep, error = %e, "dial rejected");
            }
        }
    }

    /// Whether this private network's single first message is still an
    /// unacknowledged invitation.
    pub async fn invitation_pending(&self) -> bool {
        if self.kind != NetworkKind::Private {
            return false;
        }
        let Some(other) = self.other_user_id else { return false };
        if self.store.message_count().await != 1 {
            return false;
        }
        match self.store.read(0).await {
            Ok(item) => {
                item.sender == self.node.user_id()
                    && item.message_type == MessageType::TextMessage
                    && !item.is_delivered_to(&other)
            }
            Err(_) => false,
        }
    }

    /// Dial `ep` on a background worker, optionally falling back to a
    /// virtual connection through `fallback_via` when the direct dial
    /// fails.
    pub fn begin_make_connection(
        &self,
        ep: EndPoint,
        fallback_via: Option<Arc<Connection>>,
    ) -> Result<()> {
        if !self.is_online() {
            return Err(Error::Policy("network is offline".into()));
        }
        if self.local_network_only() && !is_local_network_endpoint(&ep) {
            return Err(Error::Policy(format!(
                "endpoint {ep} is not on the local network"
            )));
        }
        if self.has_session_to(&ep) {
            return Ok(());
        }

        let weak = self.weak.clone();
        tokio::spawn(async move {
            let Some(network) = weak.upgrade() else { return };
            if !network.is_online() {
                return;
            }

            match network.connections.make_connection(ep).await {
                Ok(conn) => {
                    if let Err(e) = network
                        .establish_channel_and_join(conn, ChannelRole::Client)
                        .await
                    {
                        warn!(endpoint = %ep, error = %e, "join failed");
                        network.try_virtual_fallback(ep, fallback_via).await;
                    }
                }
                Err(e) => {
                    debug!(endpoint = %ep, error = %e, "direct dial failed");
                    network.try_virtual_fallback(ep, fallback_via).await;
                }
            }
        });
        Ok(())
    }

    async fn try_virtual_fallback(&self, ep: EndPoint, via: Option<Arc<Connection>>) {
        let Some(via) = via else { return };
        if via.is_virtual() || !self.is_online() {
            return;
        }
        match self.connections.make_virtual_connection(&via, ep).await {
            Ok(conn) => {
                if let Err(e) = self
                    .establish_channel_and_join(conn, ChannelRole::Client)
                    .await
                {
                    warn!(endpoint = %ep, error = %e, "virtual join failed");
                }
            }
            Err(e) => debug!(endpoint = %ep, error = %e, "virtual dial failed"),
        }
    }

    /// Accept an inbound connection for this (known) network.
    pub async fn accept_connection(&self, conn: Connection) -> Result<()> {
        if !self.is_online() {
            return Err(Error::Policy("network is offline".into()));
        }
        self.establish_channel_and_join(conn, ChannelRole::Server)
            .await
    }

    async fn establish_channel_and_join(&self, conn: Connection, role: ChannelRole) -> Result<()> {
        let ep = conn.remote_peer_ep();
        let stream = conn.open_mesh_channel(&self.network_id()).await?;
        let config = self.channel_config(role).await;

        let result = match role {
            ChannelRole::Client => SecureChannel::connect(stream, config).await,
            ChannelRole::Server => SecureChannel::accept(stream, config).await,
        };
        let mut channel = match result {
            Ok(channel) => channel,
            Err(e) => {
                if matches!(e, Error::Crypto(_)) {
                    self.events.emit(NetworkEvent::SecureChannelFailed {
                        endpoint: ep,
                        error: e.to_string(),
                    });
                }
                return Err(e);
            }
        };

        // The invitation accept path on the other side reads the first
        // control frame and requires it to be the invitation message, so
        // it must go out before anything the session pushes.
        if role == ChannelRole::Client
            && self.kind == NetworkKind::Private
            && self.invitation_pending().await
        {
            let item = self.store.read(0).await?;
            let frame = crate::protocol::encode_control_frame(&MeshPacket::Message {
                message_number: 0,
                item: item.for_wire(),
            })?;
            channel.write_record(&frame).await?;
        }

        self.join(channel, Arc::new(conn)).await
    }

    async fn channel_config(&self, role: ChannelRole) -> ChannelConfig {
        let local = self.node.user_id();
        let network_secret = {
            let secrets = self.secrets.read().expect("secrets lock");
            secrets.network_secret.clone()
        };

        let (psk, trusted) = match self.kind {
            NetworkKind::Private => {
                let other = self.other_user_id.expect("private network has other id");
                // The invitation dial authenticates by proving knowledge
                // of the peer's id; every later channel uses the network
                // secret.
                let psk = if role == ChannelRole::Client && self.invitation_pending().await {
                    other.as_bytes().to_vec()
                } else {
                    network_secret.as_bytes().to_vec()
                };
                let trusted: HashSet<UserId> = [other, local].into_iter().collect();
                (psk, Some(trusted))
            }
            NetworkKind::Group => {
                let trusted = if self.group_locked() {
                    let known: HashSet<UserId> = self
                        .peers
                        .read()
                        .expect("peer table lock")
                        .keys()
                        .copied()
                        .collect();
                    Some(known)
                } else {
                    None
                };
                (network_secret.as_bytes().to_vec(), trusted)
            }
        };

        ChannelConfig {
            psk: Zeroizing::new(psk),
            identity: self.node.identity(),
            trusted,
            ciphers: self.node.supported_ciphers(),
            renegotiation: RenegotiationPolicy::default(),
        }
    }

    /// Classify a freshly authenticated channel's identity and attach
    /// the session to its peer bucket.
    async fn join(&self, channel: SecureChannel, conn: Arc<Connection>) -> Result<()> {
        let remote = channel.remote_user_id();
        let local = self.node.user_id();

        let peer = match self.kind {
            NetworkKind::Private => {
                let other = self.other_user_id.expect("private network has other id");
                if remote != other && remote != local {
                    return Err(Error::InvariantViolation(
                        "unexpected remote identity on private join".into(),
                    ));
                }
                self.peer(&remote).expect("private peers pre-exist")
            }
            NetworkKind::Group => {
                let (peer, added) = self.get_or_insert_peer(remote);
                if added {
                    self.events.emit(NetworkEvent::PeerAdded { user_id: remote });
                }
                peer
            }
        };

        let dispatcher = Arc::new(SessionContext {
            network: self.weak.clone(),
            peer: Arc::downgrade(&peer),
        });
        let session = Session::spawn(channel, conn, dispatcher);
        self.attach_session(&peer, session).await;
        Ok(())
    }

    async fn attach_session(&self, peer: &Arc<Peer>, session: Arc<Session>) {
        debug!(peer = %peer.user_id(), endpoint = %session.remote_ep(), virtual = session.is_virtual(), "session attached");

        let became_online = peer.add_session(session.clone());
        if became_online {
            self.events.emit(NetworkEvent::PeerStateChanged {
                user_id: peer.user_id(),
                online: true,
            });
        }

        // Push our profile and images to the new session.
        let profile = self.node.profile();
        let _ = session
            .send_packet(&MeshPacket::Profile(ProfilePayload {
                display_name: profile.display_name,
                status: profile.status,
                status_message: profile.status_message,
                modified_at: profile.modified_at,
            }))
            .await;
        let image = self.node.profile_image();
        if image.modified_at > 0 {
            let _ = session
                .send_packet(&MeshPacket::ProfileDisplayImage {
                    image: image.image,
                    modified_at: image.modified_at,
                })
                .await;
        }
        if self.kind == NetworkKind::Group {
            let (image, modified_at) = self.group_image();
            if modified_at > 0 {
                let _ = session
                    .send_packet(&MeshPacket::GroupDisplayImage { image, modified_at })
                    .await;
            }
        }

        if self.kind == NetworkKind::Private && !peer.is_self() {
            self.re_send_undelivered(&session).await;
        }

        self.update_connectivity_status().await;
        self.broadcast_peer_exchange().await;
    }

    async fn re_send_undelivered(&self, session: &Arc<Session>) {
        let local = self.node.user_id();
        let other = session.remote_user_id();
        match self.store.undelivered_from_tail(&local, &other).await {
            Ok(run) => {
                for (number, item) in run {
                    debug!(message_number = number, "re-sending undelivered message");
                    let _ = session
                        .send_packet(&MeshPacket::Message {
                            message_number: number,
                            item: item.for_wire(),
                        })
                        .await;
                }
            }
            Err(e) => warn!(error = %e, "undelivered walk failed"),
        }
    }

    // --- gossip & connectivity ---------------------------------------

    async fn broadcast_peer_exchange(&self) {
        let online: Vec<Arc<Peer>> = self.peers().into_iter().filter(|p| p.is_online()).collect();
        if online.is_empty() {
            return;
        }
        let packet = MeshPacket::PeerExchange {
            peers: online.iter().map(|p| p.peer_info()).collect(),
        };
        for peer in online {
            if let Err(e) = peer.send_packet(&packet).await {
                debug!(peer = %peer.user_id(), error = %e, "peer exchange send failed");
            }
        }
    }

    async fn broadcast_packet(&self, packet: &MeshPacket) {
        for peer in self.peers() {
            if peer.is_online() {
                if let Err(e) = peer.send_packet(packet).await {
                    debug!(peer = %peer.user_id(), error = %e, "broadcast send failed");
                }
            }
        }
    }

    /// Recompute every peer's connectivity status from the union of
    /// session-reported connected-peer lists.
    pub async fn update_connectivity_status(&self) {
        let _op = self.op_lock.lock().await;

        let local = self.node.user_id();
        let network_online = self.is_online();
        let peers = self.peers();
        let online: Vec<&Arc<Peer>> = peers
            .iter()
            .filter(|p| !p.is_self() && p.is_online())
            .collect();

        let mut unique: HashSet<UserId> = HashSet::new();
        unique.insert(local);
        for peer in &online {
            unique.insert(peer.user_id());
            unique.extend(peer.reported_connected());
        }

        for peer in &online {
            let mut connected = peer.reported_connected();
            connected.insert(local);
            connected.insert(peer.user_id());
            let not_connected: Vec<UserId> =
                unique.difference(&connected).copied().collect();
            let status = if !network_online {
                ConnectivityStatus::NoNetwork
            } else if not_connected.is_empty() {
                ConnectivityStatus::FullMeshNetwork
            } else {
                ConnectivityStatus::PartialMeshNetwork
            };
            if peer.set_connectivity(status, not_connected) {
                self.events.emit(NetworkEvent::ConnectivityStatusChanged {
                    user_id: peer.user_id(),
                    status,
                });
            }
        }

        // The self peer is connected with everything we hold sessions to.
        let self_peer = self.self_peer();
        let mut connected: HashSet<UserId> = online.iter().map(|p| p.user_id()).collect();
        connected.insert(local);
        let not_connected: Vec<UserId> = unique.difference(&connected).copied().collect();
        let status = if !network_online || online.is_empty() {
            ConnectivityStatus::NoNetwork
        } else if not_connected.is_empty() {
            ConnectivityStatus::FullMeshNetwork
        } else {
            ConnectivityStatus::PartialMeshNetwork
        };
        if self_peer.set_connectivity(status, not_connected) {
            self.events.emit(NetworkEvent::ConnectivityStatusChanged {
                user_id: local,
                status,
            });
        }
    }

    // --- packet dispatch ---------------------------------------------

    async fn handle_packet(&self, peer: &Arc<Peer>, session: &Arc<Session>, packet: MeshPacket) {
        match packet {
            MeshPacket::PingRequest => {
                let _ = session.send_packet(&MeshPacket::PingResponse).await;
            }
            MeshPacket::PingResponse => {}
            MeshPacket::PeerExchange { peers } => {
                session.set_last_peer_exchange(peers.clone());
                let local = self.node.user_id();
                for info in &peers {
                    if info.user_id == local {
                        continue;
                    }
                    let online = self.peer(&info.user_id).map_or(false, |p| p.is_online());
                    if online {
                        continue;
                    }
                    // NAT traversal: the advertising peer can relay.
                    for ep in &info.endpoints {
                        if let Err(e) =
                            self.begin_make_connection(*ep, Some(session.connection().clone()))
                        {
                            debug!(endpoint = %ep, error = %e, "exchange dial rejected");
                        }
                    }
                }
                self.update_connectivity_status().await;
            }
            MeshPacket::LocalNetworkOnly {
                enabled,
                modified_at,
            } => {
                let changed = {
                    let mut options = self.options.lock().expect("options lock");
                    if modified_at > options.local_network_only_at {
                        options.local_network_only = enabled;
                        options.local_network_only_at = modified_at;
                        true
                    } else {
                        false
                    }
                };
                if changed {
                    self.events
                        .emit(NetworkEvent::LocalNetworkOnlyChanged { enabled });
                }
            }
            MeshPacket::Profile(payload) => {
                if peer.update_profile(payload) {
                    self.events.emit(NetworkEvent::ProfileChanged {
                        user_id: peer.user_id(),
                    });
                }
            }
            MeshPacket::ProfileDisplayImage { image, modified_at } => {
                debug!(
                    peer = %peer.user_id(),
                    image = %crate::logging::RedactedBytes(&image),
                    "profile display image received"
                );
                if peer.update_profile_image(image, modified_at) {
                    self.events.emit(NetworkEvent::ProfileImageChanged {
                        user_id: peer.user_id(),
                    });
                }
            }
            MeshPacket::GroupDisplayImage { image, modified_at } => {
                if self.kind != NetworkKind::Group {
                    return;
                }
                debug!(
                    peer = %peer.user_id(),
                    image = %crate::logging::RedactedBytes(&image),
                    "group display image received"
                );
                let changed = {
                    let mut options = self.options.lock().expect("options lock");
                    if modified_at > options.group_image_at {
                        options.group_image = image;
                        options.group_image_at = modified_at;
                        true
                    } else {
                        false
                    }
                };
                if changed {
                    self.events.emit(NetworkEvent::GroupImageChanged);
                }
            }
            MeshPacket::GroupLockNetwork {
                locked,
                modified_at,
            } => {
                if self.kind != NetworkKind::Group {
                    return;
                }
                let changed = {
                    let mut options = self.options.lock().expect("options lock");
                    if modified_at > options.group_locked_at {
                        options.group_locked = locked;
                        options.group_locked_at = modified_at;
                        true
                    } else {
                        false
                    }
                };
                if changed {
                    self.events.emit(NetworkEvent::GroupLockChanged { locked });
                }
            }
            MeshPacket::MessageTypingNotification => {
                self.events.emit(NetworkEvent::MessageTyping {
                    user_id: peer.user_id(),
                });
            }
            MeshPacket::Message {
                message_number,
                item,
            } => {
                self.receive_message(peer, session, message_number, item)
                    .await;
            }
            MeshPacket::MessageDeliveryNotification { message_number } => {
                let recipient = peer.user_id();
                match self
                    .store
                    .update_delivery(message_number, &recipient, now())
                    .await
                {
                    Ok(_) => {
                        self.events.emit(NetworkEvent::MessageDeliveryNotification {
                            message_number,
                            recipient,
                        });
                    }
                    Err(e) => warn!(message_number, error = %e, "delivery update failed"),
                }
            }
            MeshPacket::FileRequest {
                message_number,
                file_offset,
                data_port,
            } => {
                // Served on its own task so the read loop keeps draining.
                let session = session.clone();
                let store = self.store.clone();
                tokio::spawn(async move {
                    let path = match store.read(message_number).await {
                        Ok(item) => item.local_file_path.map(PathBuf::from),
                        Err(e) => {
                            warn!(message_number, error = %e, "file request for unknown message");
                            None
                        }
                    };
                    match path {
                        Some(path) => {
                            if let Err(e) =
                                transfer::serve_file_request(&session, &path, file_offset, data_port)
                                    .await
                            {
                                warn!(message_number, error = %e, "file serve failed");
                            }
                        }
                        None => {
                            // Immediate close tells the requester to try
                            // another session.
                            if let Ok(mut stream) = session.open_data_stream(Some(data_port)) {
                                let _ = stream.close().await;
                            }
                        }
                    }
                });
            }
        }
    }

    async fn receive_message(
        &self,
        peer: &Arc<Peer>,
        session: &Arc<Session>,
        message_number: u32,
        mut item: MessageItem,
    ) {
        let sender = peer.user_id();

        // At-most-once per session.
        if !session.mark_seen(message_number) {
            return;
        }

        let fresh = self
            .seen
            .lock()
            .expect("seen lock")
            .insert((sender, message_number));

        if fresh {
            // The channel identity is authoritative for the sender field.
            item.sender = sender;
            item.remote_number = Some(message_number);
            match self.store.append(&item).await {
                Ok(local_number) => {
                    self.events.emit(NetworkEvent::MessageReceived {
                        from: sender,
                        message_number: local_number,
                        item: item.clone(),
                    });
                }
                Err(e) => {
                    // Not persisted: do not acknowledge, the sender will
                    // re-deliver.
                    warn!(error = %e, "failed to persist received message");
                    return;
                }
            }
        }

        let _ = session
            .send_packet(&MeshPacket::MessageDeliveryNotification { message_number })
            .await;
    }

    // --- message pipeline --------------------------------------------

    fn recipient_ids(&self) -> Vec<UserId> {
        match self.kind {
            NetworkKind::Private => self.other_user_id.into_iter().collect(),
            NetworkKind::Group => {
                let local = self.node.user_id();
                self.peers
                    .read()
                    .expect("peer table lock")
                    .keys()
                    .copied()
                    .filter(|id| *id != local)
                    .collect()
            }
        }
    }

    /// Compose, persist, and broadcast a text message. Returns its
    /// message number.
    pub async fn send_text_message(&self, text: &str) -> Result<u32> {
        let item = MessageItem::new_text(
            self.node.user_id(),
            self.recipient_ids(),
            text.as_bytes(),
            now(),
        );
        self.send_message_item(item).await
    }

    /// Compose, persist, and broadcast an inline image.
    pub async fn send_inline_image(&self, image: Vec<u8>, thumbnail: Option<Vec<u8>>) -> Result<u32> {
        let mut item = MessageItem::new_text(
            self.node.user_id(),
            self.recipient_ids(),
            &image,
            now(),
        );
        item.message_type = MessageType::InlineImage;
        item.thumbnail = thumbnail;
        self.send_message_item(item).await
    }

    /// Offer a local file for pull-based transfer.
    pub async fn send_file_attachment(
        &self,
        path: &Path,
        thumbnail: Option<Vec<u8>>,
    ) -> Result<u32> {
        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|e| Error::Storage(format!("failed to stat {path:?}: {e}")))?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());

        let item = MessageItem::new_file_attachment(
            self.node.user_id(),
            self.recipient_ids(),
            file_name,
            metadata.len(),
            path.to_string_lossy().into_owned(),
            thumbnail,
            now(),
        );
        self.send_message_item(item).await
    }

    async fn send_message_item(&self, item: MessageItem) -> Result<u32> {
        let probe = MeshPacket::Message {
            message_number: u32::MAX,
            item: item.for_wire(),
        };
        if probe.to_bytes()?.len() > MAX_MESSAGE_SIZE {
            return Err(Error::Policy("message too large".into()));
        }

        let number = self.store.append(&item).await?;
        let packet = MeshPacket::Message {
            message_number: number,
            item: item.for_wire(),
        };

        for recipient in item.recipients.iter().map(|r| r.user_id) {
            if let Some(peer) = self.peer(&recipient) {
                if peer.is_online() {
                    if let Err(e) = peer.send_packet(&packet).await {
                        debug!(peer = %recipient, error = %e, "message send failed");
                    }
                }
            }
        }

        self.events.emit(NetworkEvent::MessageReceived {
            from: self.node.user_id(),
            message_number: number,
            item,
        });
        Ok(number)
    }

    /// Tell peers we are composing.
    pub async fn send_typing_notification(&self) {
        self.broadcast_packet(&MeshPacket::MessageTypingNotification)
            .await;
    }

    /// Pull a received file attachment to `file_path`, resuming at its
    /// current length.
    pub async fn receive_file_attachment(
        &self,
        message_number: u32,
        file_path: &Path,
    ) -> Result<u64> {
        let item = self.store.read(message_number).await?;
        if item.message_type != MessageType::FileAttachment {
            return Err(Error::Policy("message is not a file attachment".into()));
        }
        let request_number = item
            .remote_number
            .ok_or_else(|| Error::Policy("attachment originates from this node".into()))?;
        let peer = self
            .peer(&item.sender)
            .ok_or_else(|| Error::NotFound("sender is not a known peer".into()))?;
        transfer::receive_file_attachment(&peer, request_number, file_path).await
    }

    // --- options & secrets -------------------------------------------

    /// Set the local-network-only flag and tell peers.
    pub async fn set_local_network_only(&self, enabled: bool) {
        let modified_at = now();
        {
            let mut options = self.options.lock().expect("options lock");
            options.local_network_only = enabled;
            options.local_network_only_at = modified_at;
        }
        self.events
            .emit(NetworkEvent::LocalNetworkOnlyChanged { enabled });
        self.broadcast_packet(&MeshPacket::LocalNetworkOnly {
            enabled,
            modified_at,
        })
        .await;
    }

    /// Set the group display image and tell peers.
    pub async fn set_group_image(&self, image: Vec<u8>) -> Result<()> {
        if self.kind != NetworkKind::Group {
            return Err(Error::Policy("not a group network".into()));
        }
        let modified_at = now();
        {
            let mut options = self.options.lock().expect("options lock");
            options.group_image = image.clone();
            options.group_image_at = modified_at;
        }
        self.events.emit(NetworkEvent::GroupImageChanged);
        self.broadcast_packet(&MeshPacket::GroupDisplayImage { image, modified_at })
            .await;
        Ok(())
    }

    /// Set the advisory group lock and tell peers.
    pub async fn set_group_locked(&self, locked: bool) -> Result<()> {
        if self.kind != NetworkKind::Group {
            return Err(Error::Policy("not a group network".into()));
        }
        let modified_at = now();
        {
            let mut options = self.options.lock().expect("options lock");
            options.group_locked = locked;
            options.group_locked_at = modified_at;
        }
        self.events.emit(NetworkEvent::GroupLockChanged { locked });
        self.broadcast_packet(&MeshPacket::GroupLockNetwork {
            locked,
            modified_at,
        })
        .await;
        Ok(())
    }

    /// Set the local mute flag.
    pub fn set_mute(&self, mute: bool) {
        self.options.lock().expect("options lock").mute = mute;
    }

    /// Change the shared secret, recomputing network id and secret.
    ///
    /// Rejected when the new id collides with another live network on
    /// this node; the network is left unchanged in that case.
    pub async fn change_shared_secret(&self, shared_secret: Option<&str>) -> Result<()> {
        let _op = self.op_lock.lock().await;

        let (new_id, new_secret) = match self.kind {
            NetworkKind::Private => {
                let other = self.other_user_id.expect("private network has other id");
                let local = self.node.user_id();
                (
                    derive_private_network_id(&local, &other, shared_secret),
                    derive_private_network_secret(&local, &other, shared_secret),
                )
            }
            NetworkKind::Group => {
                let name = self.network_name.as_deref().unwrap_or("");
                (
                    derive_group_network_id(name, shared_secret),
                    derive_group_network_secret(name, shared_secret),
                )
            }
        };

        let old_id = self.network_id();
        self.node.network_changed(old_id, new_id)?;

        let mut secrets = self.secrets.write().expect("secrets lock");
        secrets.shared_secret = shared_secret.unwrap_or("").to_string();
        secrets.network_id = new_id;
        secrets.network_secret = new_secret;
        info!(
            network = %crate::logging::ShortId(new_id.as_bytes()),
            secret = %crate::logging::Redacted(shared_secret.unwrap_or("")),
            "shared secret changed"
        );
        Ok(())
    }

    // --- snapshot -----------------------------------------------------

    /// Serializable snapshot of the network state and known peers.
    pub async fn snapshot(&self) -> NetworkState {
        let secrets = self.secrets.read().expect("secrets lock").clone();
        let options = self.options.lock().expect("options lock").clone();

        let peers = match self.kind {
            NetworkKind::Private => {
                let other = self.other_user_id.expect("private network has other id");
                vec![self.other_peer().map(|p| p.peer_info()).unwrap_or(PeerInfo {
                    user_id: other,
                    display_name: None,
                    endpoints: Vec::new(),
                })]
            }
            NetworkKind::Group => self
                .peers()
                .into_iter()
                .filter(|p| !p.is_self())
                .map(|p| p.peer_info())
                .collect(),
        };

        NetworkState {
            kind: self.kind,
            local_user_id: self.node.user_id(),
            network_name: self.network_name.clone(),
            shared_secret: secrets.shared_secret,
            status: self.status(),
            network_id: secrets.network_id,
            network_secret: secrets.network_secret,
            message_store_id: self.store.id().to_string(),
            message_store_key: self.store.key_bytes().to_vec(),
            local_network_only_at: options.local_network_only_at,
            local_network_only: options.local_network_only,
            group_image_at: options.group_image_at,
            group_image: options.group_image,
            group_locked_at: options.group_locked_at,
            group_locked: options.group_locked,
            mute: options.mute,
            peers,
        }
    }

    // --- invitation accept path --------------------------------------

    /// Accept an inbound channel whose network id is unknown to this
    /// node as a private-network invitation.
    ///
    /// The server advertises its own user id as the PSK: completing the
    /// handshake proves the caller already knows the id. The first
    /// control frame must be a text message; the derived network id must
    /// match the announced one. The new network is created offline with
    /// the invitation persisted and acknowledged.
    pub async fn accept_private_invitation(
        node: Arc<Node>,
        connections: Arc<dyn ConnectionManager>,
        dht: Arc<dyn Dht>,
        network_id: NetworkId,
        conn: Connection,
    ) -> Result<Arc<Self>> {
        let stream = conn.open_mesh_channel(&network_id).await?;
        let config = ChannelConfig {
            psk: Zeroizing::new(node.user_id().as_bytes().to_vec()),
            identity: node.identity(),
            trusted: None,
            ciphers: node.supported_ciphers(),
            renegotiation: RenegotiationPolicy::default(),
        };
        let mut channel = SecureChannel::accept(stream, config).await?;
        let remote = channel.remote_user_id();
        if remote == node.user_id() {
            return Err(Error::InvariantViolation("invitation from self".into()));
        }

        let derived = derive_private_network_id(&node.user_id(), &remote, None);
        if derived != network_id {
            return Err(Error::Crypto(
                "invitation network id does not match derivation".into(),
            ));
        }

        let record = channel
            .read_record()
            .await?
            .ok_or_else(|| Error::Transport("connection closed during invitation".into()))?;
        let (message_number, item) = match decode_frame(&record)? {
            Frame::Control(MeshPacket::Message {
                message_number,
                item,
            }) if item.message_type == MessageType::TextMessage => (message_number, item),
            _ => {
                return Err(Error::InvariantViolation(
                    "invitation must begin with a text message".into(),
                ))
            }
        };

        let network = Self::new_private(node, connections, dht, remote, None)?;

        let mut stored = item;
        stored.sender = remote;
        stored.remote_number = Some(message_number);
        let local_number = network.store.append(&stored).await?;
        network
            .seen
            .lock()
            .expect("seen lock")
            .insert((remote, message_number));

        let peer = network.peer(&remote).expect("other peer exists");
        let dispatcher = Arc::new(SessionContext {
            network: network.weak.clone(),
            peer: Arc::downgrade(&peer),
        });
        let session = Session::spawn(channel, Arc::new(conn), dispatcher);
        session.mark_seen(message_number);
        session
            .send_packet(&MeshPacket::MessageDeliveryNotification { message_number })
            .await?;
        network.attach_session(&peer, session).await;

        network.events.emit(NetworkEvent::MessageReceived {
            from: remote,
            message_number: local_number,
            item: stored,
        });

        info!(from = %remote, "private invitation accepted");
        Ok(network)
    }
}

impl std::fmt::Debug for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Network")
            .field("kind", &self.kind)
            .field("network_id", &self.network_id())
            .field("status", &self.status())
            .finish()
    }
}

/// Routes one session's packets and lifecycle back into its network.
struct SessionContext {
    network: Weak<Network>,
    peer: Weak<Peer>,
}

#[async_trait]
impl SessionDispatcher for SessionContext {
    async fn handle_packet(&self, session: &Arc<Session>, packet: MeshPacket) {
        let (Some(network), Some(peer)) = (self.network.upgrade(), self.peer.upgrade()) else {
            return;
        };
        network.handle_packet(&peer, session, packet).await;
    }

    async fn session_closed(&self, session: &Arc<Session>, error: Option<Error>) {
        let (Some(network), Some(peer)) = (self.network.upgrade(), self.peer.upgrade()) else {
            return;
        };

        if let Some(Error::Crypto(message)) = &error {
            network.events.emit(NetworkEvent::SecureChannelFailed {
                endpoint: session.remote_ep(),
                error: message.clone(),
            });
        }

        let became_offline = peer.remove_session(session);
        if became_offline {
            peer.set_connectivity(ConnectivityStatus::NoNetwork, Vec::new());
            network.events.emit(NetworkEvent::PeerStateChanged {
                user_id: peer.user_id(),
                online: false,
            });
            network.events.emit(NetworkEvent::ConnectivityStatusChanged {
                user_id: peer.user_id(),
                status: ConnectivityStatus::NoNetwork,
            });
        }

        network.update_connectivity_status().await;
        network.broadcast_peer_exchange().await;

        // Timeouts and transport errors heal by re-dialling; crypto and
        // invariant failures and orderly EOF do not reconnect.
        let reconnect = error.as_ref().map_or(false, |e| e.should_reconnect());
        if reconnect && network.is_online() {
            let ep = session.remote_ep();
            let weak = self.network.clone();
            tokio::spawn(async move {
                tokio::time::sleep(RECONNECT_DELAY).await;
                if let Some(network) = weak.upgrade() {
                    if let Err(e) = network.begin_make_connection(ep, None) {
                        debug!(endpoint = %ep, error = %e, "reconnect rejected");
                    }
                }
            });
        }
    }
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{MaskedUserId, NodeIdentity};

    struct StubConnections;

    #[async_trait]
    impl ConnectionManager for StubConnections {
        async fn make_connection(&self, _ep: EndPoint) -> Result<Connection> {
            Err(Error::Transport("stub".into()))
        }
        async fn make_virtual_connection(
            &self,
            _via: &Connection,
            _ep: EndPoint,
        ) -> Result<Connection> {
            Err(Error::Transport("stub".into()))
        }
        fn local_port(&self) -> u16 {
            4970
        }
        async fn register_hosted_network(&self, _network_id: &NetworkId) -> Result<()> {
            Ok(())
        }
        async fn unregister_hosted_network(&self, _network_id: &NetworkId) -> Result<()> {
            Ok(())
        }
    }

    struct StubDht;

    #[async_trait]
    impl Dht for StubDht {
        async fn find_peers(
            &self,
            _target: &MaskedUserId,
            _local_only: bool,
        ) -> Result<Vec<EndPoint>> {
            Ok(Vec::new())
        }
        async fn announce(
            &self,
            _network_id: &NetworkId,
            _local_only: bool,
            _service_port: u16,
        ) -> Result<Vec<EndPoint>> {
            Ok(Vec::new())
        }
    }

    fn test_node(dir: &Path) -> Arc<Node> {
        Node::new(NodeIdentity::generate(), dir)
    }

    fn group(node: &Arc<Node>, name: &str, secret: Option<&str>) -> Arc<Network> {
        Network::new_group(
            node.clone(),
            Arc::new(StubConnections),
            Arc::new(StubDht),
            name,
            secret,
        )
        .expect("group network")
    }

    #[tokio::test]
    async fn test_secret_rotation_collision_leaves_state_unchanged() {
        let tmp = tempfile::tempdir().unwrap();
        let node = test_node(tmp.path());

        // Same name, different secrets: two live networks, distinct ids.
        let a = group(&node, "alpha", Some("s1"));
        let b = group(&node, "alpha", Some("s2"));
        assert_ne!(a.network_id(), b.network_id());

        let before_id = b.network_id();
        let before_secret = b.snapshot().await.network_secret;

        // Rotating b onto a's secret would yield a's id.
        let err = b.change_shared_secret(Some("s1")).await;
        assert!(matches!(err, Err(Error::Policy(_))));

        assert_eq!(b.network_id(), before_id);
        assert_eq!(b.snapshot().await.network_secret, before_secret);

        // A non-colliding value still works.
        b.change_shared_secret(Some("s3")).await.unwrap();
        assert_eq!(b.network_id(), derive_group_network_id("alpha", Some("s3")));

        let _ = a.delete().await;
        let _ = b.delete().await;
    }

    #[tokio::test]
    async fn test_change_shared_secret_recomputes_both() {
        let tmp = tempfile::tempdir().unwrap();
        let node = test_node(tmp.path());
        let network = group(&node, "alpha", Some("one"));

        let id_before = network.network_id();
        let secret_before = network.snapshot().await.network_secret;

        network.change_shared_secret(Some("two")).await.unwrap();

        assert_ne!(network.network_id(), id_before);
        assert_ne!(network.snapshot().await.network_secret, secret_before);
        assert_eq!(network.network_id(), derive_group_network_id("alpha", Some("two")));

        let _ = network.delete().await;
    }

    #[tokio::test]
    async fn test_offline_dial_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let node = test_node(tmp.path());
        let network = group(&node, "alpha", None);

        let err = network.begin_make_connection("127.0.0.1:4970".parse().unwrap(), None);
        assert!(matches!(err, Err(Error::Policy(_))));

        let _ = network.delete().await;
    }

    #[tokio::test]
    async fn test_lan_only_filter_blocks_public_endpoints() {
        let tmp = tempfile::tempdir().unwrap();
        let node = test_node(tmp.path());
        let network = group(&node, "alpha", None);

        network.go_online().await;
        network.set_local_network_only(true).await;

        let public = network.begin_make_connection("203.0.113.9:4970".parse().unwrap(), None);
        assert!(matches!(public, Err(Error::Policy(_))));

        // A local endpoint passes the filter (the stub dial then fails in
        // the background, which is fine here).
        let local = network.begin_make_connection("192.168.1.9:4970".parse().unwrap(), None);
        assert!(local.is_ok());

        network.go_offline().await;
        let _ = network.delete().await;
    }

    #[tokio::test]
    async fn test_invitation_pending_detection() {
        let tmp = tempfile::tempdir().unwrap();
        let node = test_node(tmp.path());
        let other = UserId([0x42u8; 32]);
        let network = Network::new_private(
            node.clone(),
            Arc::new(StubConnections),
            Arc::new(StubDht),
            other,
            None,
        )
        .expect("private network");

        // Empty log: nothing pending.
        assert!(!network.invitation_pending().await);

        // One undelivered self-authored text: pending.
        network.send_text_message("hi").await.unwrap();
        assert!(network.invitation_pending().await);

        // Acknowledged: no longer pending.
        network.store.update_delivery(0, &other, now()).await.unwrap();
        assert!(!network.invitation_pending().await);

        // A second message also clears the rule.
        network.send_text_message("again").await.unwrap();
        assert!(!network.invitation_pending().await);

        let _ = network.delete().await;
    }

    #[tokio::test]
    async fn test_snapshot_roundtrip_through_restore() {
        let tmp = tempfile::tempdir().unwrap();
        let node = test_node(tmp.path());
        let network = group(&node, "alpha", Some("s"));

        network.set_mute(true);
        network.set_local_network_only(true).await;

        let state = network.snapshot().await;
        let mut buf = Vec::new();
        state.write_to(&mut buf).unwrap();
        let read = NetworkState::read_from(&mut buf.as_slice()).unwrap();
        assert_eq!(state, read);

        // Restoring under the same id must first release it.
        network.delete().await.unwrap();
        let restored = Network::restore(
            node.clone(),
            Arc::new(StubConnections),
            Arc::new(StubDht),
            read,
        )
        .await
        .expect("restore");

        assert_eq!(restored.network_id(), state.network_id);
        assert!(restored.mute());
        assert!(restored.local_network_only());
        assert_eq!(restored.status(), NetworkStatus::Offline);

        let _ = restored.delete().await;
    }

    #[tokio::test]
    async fn test_group_message_recipients_exclude_self() {
        let tmp = tempfile::tempdir().unwrap();
        let node = test_node(tmp.path());
        let network = group(&node, "alpha", None);

        network.get_or_insert_peer(UserId([2u8; 32]));
        network.get_or_insert_peer(UserId([3u8; 32]));

        let number = network.send_text_message("to the room").await.unwrap();
        let item = network.store.read(number).await.unwrap();
        assert_eq!(item.recipients.len(), 2);
        assert!(item
            .recipients
            .iter()
            .all(|r| r.user_id != node.user_id()));

        let _ = network.delete().await;
    }
}
