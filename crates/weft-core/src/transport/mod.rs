//! Transport abstractions.
//!
//! The fabric never opens sockets itself: a [`ConnectionManager`] mints
//! [`Connection`] handles (raw or virtual) and a connection can open one
//! multiplexed byte stream per mesh network. Concrete implementations
//! live with the host application; tests use in-memory duplex pairs.

pub mod discovery;

use async_trait::async_trait;
use std::net::{IpAddr, SocketAddr};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::crypto::NetworkId;
use crate::error::Result;

/// A remote endpoint.
pub type EndPoint = SocketAddr;

/// Byte-stream transports a channel can run over.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Transport for T {}

/// An owned, type-erased transport stream.
pub type BoxedTransport = Box<dyn Transport>;

/// Opens the per-network byte stream carried by a connection.
#[async_trait]
pub trait ChannelOpener: Send + Sync {
    /// Whether a mesh channel for `network_id` is already open.
    async fn channel_exists(&self, network_id: &NetworkId) -> bool;

    /// Open the mesh channel stream for `network_id`.
    async fn open_channel(&self, network_id: &NetworkId) -> Result<BoxedTransport>;
}

/// A transport connection to one remote peer.
///
/// Virtual connections are tunnelled through a third party's existing
/// connection; `via_remote_peer_ep` names that intermediary.
pub struct Connection {
    remote_peer_ep: EndPoint,
    via_remote_peer_ep: Option<EndPoint>,
    is_virtual: bool,
    opener: Box<dyn ChannelOpener>,
}

impl Connection {
    /// Wrap an opener with its connection metadata.
    pub fn new(
        remote_peer_ep: EndPoint,
        via_remote_peer_ep: Option<EndPoint>,
        is_virtual: bool,
        opener: Box<dyn ChannelOpener>,
    ) -> Self {
        Self {
            remote_peer_ep,
            via_remote_peer_ep,
            is_virtual,
            opener,
        }
    }

    /// The remote peer's endpoint.
    pub fn remote_peer_ep(&self) -> EndPoint {
        self.remote_peer_ep
    }

    /// For virtual connections, the intermediary's endpoint.
    pub fn via_remote_peer_ep(&self) -> Option<EndPoint> {
        self.via_remote_peer_ep
    }

    /// Whether this connection is tunnelled through a third party.
    pub fn is_virtual(&self) -> bool {
        self.is_virtual
    }

    /// Whether a mesh channel for `network_id` is already open.
    pub async fn channel_exists(&self, network_id: &NetworkId) -> bool {
        self.opener.channel_exists(network_id).await
    }

    /// Open the mesh channel stream for `network_id`.
    pub async fn open_mesh_channel(&self, network_id: &NetworkId) -> Result<BoxedTransport> {
        self.opener.open_channel(network_id).await
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("remote_peer_ep", &self.remote_peer_ep)
            .field("via_remote_peer_ep", &self.via_remote_peer_ep)
            .field("is_virtual", &self.is_virtual)
            .finish()
    }
}

/// Mints raw and virtual transport connections and tracks relay-hosted
/// networks.
#[async_trait]
pub trait ConnectionManager: Send + Sync {
    /// Open a direct connection to `ep`.
    async fn make_connection(&self, ep: EndPoint) -> Result<Connection>;

    /// Open a connection to `ep` tunnelled over `via`.
    async fn make_virtual_connection(&self, via: &Connection, ep: EndPoint) -> Result<Connection>;

    /// Local service port announced on the DHT.
    fn local_port(&self) -> u16;

    /// Ask connected TCP relays to announce `network_id` on our behalf.
    async fn register_hosted_network(&self, network_id: &NetworkId) -> Result<()>;

    /// Stop relays announcing `network_id`.
    async fn unregister_hosted_network(&self, network_id: &NetworkId) -> Result<()>;
}

/// Whether an endpoint is on the local network.
///
/// Used by the `local_network_only` policy: RFC 1918 and link-local
/// ranges qualify, plus loopback; everything else is rejected.
pub fn is_local_network_endpoint(ep: &EndPoint) -> bool {
    match ep.ip() {
        IpAddr::V4(ip) => ip.is_private() || ip.is_link_local() || ip.is_loopback(),
        IpAddr::V6(ip) => {
            if ip.is_loopback() {
                return true;
            }
            let segments = ip.segments();
            // fe80::/10 link-local and fc00::/7 unique-local.
            (segments[0] & 0xffc0) == 0xfe80 || (segments[0] & 0xfe00) == 0xfc00
        }
    }
}
