//! Event surface towards the UI.
//!
//! Events are pushed through a broadcast channel so consumer code sees
//! them serialized in emit order. A network keeps emitting even with no
//! subscriber attached; lagging subscribers drop the oldest events.

use tokio::sync::broadcast;

use super::message::MessageItem;
use crate::crypto::UserId;
use crate::transport::EndPoint;

/// How much of the mesh a peer can currently reach.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityStatus {
    /// The peer is offline or the network is.
    NoNetwork,
    /// Online but missing links to some known participants.
    PartialMeshNetwork,
    /// Connected, directly or transitively, to every known participant.
    FullMeshNetwork,
}

/// Events emitted by a network.
#[derive(Debug, Clone)]
pub enum NetworkEvent {
    /// A previously unknown peer joined a group network.
    PeerAdded {
        /// The new peer's user id.
        user_id: UserId,
    },
    /// A peer went online or offline.
    PeerStateChanged {
        /// The peer's user id.
        user_id: UserId,
        /// Whether the peer now has at least one session.
        online: bool,
    },
    /// A peer's mesh connectivity changed.
    ConnectivityStatusChanged {
        /// The peer's user id.
        user_id: UserId,
        /// The new status.
        status: ConnectivityStatus,
    },
    /// A peer's profile changed.
    ProfileChanged {
        /// The peer's user id.
        user_id: UserId,
    },
    /// A peer's display image changed.
    ProfileImageChanged {
        /// The peer's user id.
        user_id: UserId,
    },
    /// The group display image changed.
    GroupImageChanged,
    /// The group lock flag changed.
    GroupLockChanged {
        /// Whether the group is now locked.
        locked: bool,
    },
    /// The local-network-only flag changed.
    LocalNetworkOnlyChanged {
        /// Whether only local endpoints may be dialled now.
        enabled: bool,
    },
    /// A message was received (or locally sent; the sender is then the
    /// local user).
    MessageReceived {
        /// Authoring user id.
        from: UserId,
        /// Number of the entry in the local log.
        message_number: u32,
        /// The message body.
        item: MessageItem,
    },
    /// A recipient acknowledged one of our messages.
    MessageDeliveryNotification {
        /// Number of the entry in the local log.
        message_number: u32,
        /// The acknowledging recipient.
        recipient: UserId,
    },
    /// A peer is composing a message.
    MessageTyping {
        /// The typing peer's user id.
        user_id: UserId,
    },
    /// A secure channel failed to establish or died on a crypto error.
    SecureChannelFailed {
        /// The remote endpoint involved.
        endpoint: EndPoint,
        /// Failure description.
        error: String,
    },
}

/// Single-producer-side event bus.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<NetworkEvent>,
}

impl EventBus {
    /// Create a bus with a bounded backlog.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { tx }
    }

    /// Subscribe to events emitted after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<NetworkEvent> {
        self.tx.subscribe()
    }

    /// Emit an event; having no subscriber is fine.
    pub fn emit(&self, event: NetworkEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
