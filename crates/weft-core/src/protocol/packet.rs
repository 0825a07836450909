//! Control packet types and payloads.
//!
//! Control packets travel on port 0 as `type:u8` followed by a
//! bincode-encoded body. Unknown types are a parse error; the session
//! tears down rather than skipping bytes it cannot delimit.

use serde::{Deserialize, Serialize};

use crate::crypto::UserId;
use crate::error::{Error, Result};
use crate::messaging::message::MessageItem;
use crate::node::ProfileStatus;
use crate::transport::EndPoint;

/// A peer's identity and reachable endpoints, exchanged in gossip and
/// persisted in network snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    /// The peer's user id.
    pub user_id: UserId,
    /// Display name, when known.
    pub display_name: Option<String>,
    /// Endpoints the peer was last reachable on.
    pub endpoints: Vec<EndPoint>,
}

/// Profile fields pushed to every new session and on change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfilePayload {
    /// Display name.
    pub display_name: String,
    /// Availability status.
    pub status: ProfileStatus,
    /// Free-form status message.
    pub status_message: String,
    /// Unix seconds the profile was last modified; receivers keep the
    /// newest version.
    pub modified_at: i64,
}

/// Control packets routed by the session dispatcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MeshPacket {
    /// Keepalive probe.
    PingRequest,
    /// Keepalive reply.
    PingResponse,
    /// The sender's currently connected peer list.
    PeerExchange {
        /// Connected peers with their endpoints.
        peers: Vec<PeerInfo>,
    },
    /// The sender's local-network-only flag.
    LocalNetworkOnly {
        /// Whether only RFC 1918 / link-local endpoints may be dialled.
        enabled: bool,
        /// Unix seconds of the change; newest wins.
        modified_at: i64,
    },
    /// The sender's profile.
    Profile(ProfilePayload),
    /// The sender's profile display image.
    ProfileDisplayImage {
        /// Encoded image bytes; empty clears the image.
        image: Vec<u8>,
        /// Unix seconds of the change; newest wins.
        modified_at: i64,
    },
    /// The group's display image.
    GroupDisplayImage {
        /// Encoded image bytes; empty clears the image.
        image: Vec<u8>,
        /// Unix seconds of the change; newest wins.
        modified_at: i64,
    },
    /// Advisory group lock: restrict accepted identities to known peers.
    GroupLockNetwork {
        /// Whether the group is locked.
        locked: bool,
        /// Unix seconds of the change; newest wins.
        modified_at: i64,
    },
    /// The sender is composing a message.
    MessageTypingNotification,
    /// A persisted message.
    Message {
        /// The sender's message number; identity is
        /// `(sender user id, message number)`.
        message_number: u32,
        /// The message body.
        item: MessageItem,
    },
    /// Receipt for a message number.
    MessageDeliveryNotification {
        /// The acknowledged message number in the sender's log.
        message_number: u32,
    },
    /// Ask the sender of a file attachment to stream its content.
    FileRequest {
        /// Message number of the file attachment in the remote log.
        message_number: u32,
        /// Byte offset to resume from.
        file_offset: u64,
        /// Data stream port the requester listens on.
        data_port: u16,
    },
}

impl MeshPacket {
    fn kind(&self) -> u8 {
        match self {
            Self::PingRequest => 0x01,
            Self::PingResponse => 0x02,
            Self::PeerExchange { .. } => 0x03,
            Self::LocalNetworkOnly { .. } => 0x04,
            Self::Profile(_) => 0x05,
            Self::ProfileDisplayImage { .. } => 0x06,
            Self::GroupDisplayImage { .. } => 0x07,
            Self::GroupLockNetwork { .. } => 0x08,
            Self::MessageTypingNotification => 0x09,
            Self::Message { .. } => 0x0a,
            Self::MessageDeliveryNotification { .. } => 0x0b,
            Self::FileRequest { .. } => 0x0c,
        }
    }

    /// Serialize to `type:u8 || body`.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut bytes = vec![self.kind()];
        match self {
            Self::PingRequest | Self::PingResponse | Self::MessageTypingNotification => {}
            Self::PeerExchange { peers } => bytes.extend(bincode::serialize(peers)?),
            Self::LocalNetworkOnly {
                enabled,
                modified_at,
            } => bytes.extend(bincode::serialize(&(enabled, modified_at))?),
            Self::Profile(profile) => bytes.extend(bincode::serialize(profile)?),
            Self::ProfileDisplayImage { image, modified_at }
            | Self::GroupDisplayImage { image, modified_at } => {
                bytes.extend(bincode::serialize(&(image, modified_at))?)
            }
            Self::GroupLockNetwork {
                locked,
                modified_at,
            } => bytes.extend(bincode::serialize(&(locked, modified_at))?),
            Self::Message {
                message_number,
                item,
            } => bytes.extend(bincode::serialize(&(message_number, item))?),
            Self::MessageDeliveryNotification { message_number } => {
                bytes.extend(bincode::serialize(message_number)?)
            }
            Self::FileRequest {
                message_number,
                file_offset,
                data_port,
            } => bytes.extend(bincode::serialize(&(message_number, file_offset, data_port))?),
        }
        Ok(bytes)
    }

    /// Parse from `type:u8 || body`.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let (&kind, body) = bytes
            .split_first()
            .ok_or_else(|| Error::Parse("empty control packet".into()))?;

        Ok(match kind {
            0x01 => Self::PingRequest,
            0x02 => Self::PingResponse,
            0x03 => Self::PeerExchange {
                peers: bincode::deserialize(body)?,
            },
            0x04 => {
                let (enabled, modified_at) = bincode::deserialize(body)?;
                Self::LocalNetworkOnly {
                    enabled,
                    modified_at,
                }
            }
            0x05 => Self::Profile(bincode::deserialize(body)?),
            0x06 => {
                let (image, modified_at) = bincode::deserialize(body)?;
                Self::ProfileDisplayImage { image, modified_at }
            }
            0x07 => {
                let (image, modified_at) = bincode::deserialize(body)?;
                Self::GroupDisplayImage { image, modified_at }
            }
            0x08 => {
                let (locked, modified_at) = bincode::deserialize(body)?;
                Self::GroupLockNetwork {
                    locked,
                    modified_at,
                }
            }
            0x09 => Self::MessageTypingNotification,
            0x0a => {
                let (message_number, item) = bincode::deserialize(body)?;
                Self::Message {
                    message_number,
                    item,
                }
            }
            0x0b => Self::MessageDeliveryNotification {
                message_number: bincode::deserialize(body)?,
            },
            0x0c => {
                let (message_number, file_offset, data_port) = bincode::deserialize(body)?;
                Self::FileRequest {
                    message_number,
                    file_offset,
                    data_port,
                }
            }
            _ => return Err(Error::Parse(format!("unknown packet type: {kind:#04x}"))),
        })
    }
}
