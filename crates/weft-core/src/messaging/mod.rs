//! The session fabric: networks, peers, sessions, and the message
//! pipeline.
//!
//! A [`network::Network`] owns [`peer::Peer`] buckets; each peer owns
//! zero or more [`session::Session`]s. All upward references are weak,
//! all downward references are strong, and teardown cascades top-down.

pub mod events;
pub mod message;
pub mod network;
pub mod peer;
pub mod session;
pub mod transfer;

pub use events::{ConnectivityStatus, EventBus, NetworkEvent};
pub use message::{MessageItem, MessageRecipient, MessageType, RecipientStatus};
pub use network::Network;
pub use peer::Peer;
pub use session::{Session, SessionDispatcher};

use crate::crypto::ChannelRole;
use crate::protocol::mux::PortParity;

/// The handshake role fixes a session's data-stream port parity.
pub(crate) fn session_role_parity(role: ChannelRole) -> PortParity {
    match role {
        ChannelRole::Client => PortParity::Client,
        ChannelRole::Server => PortParity::Server,
    }
}
