//! Versioned binary snapshot of network state.
//!
//! Snapshots are hand-framed little-endian binary with a leading version
//! byte. Unrecognised versions are a clean parse error; no forward
//! compatibility is promised.

use std::io::{Read, Write};

use crate::crypto::{NetworkId, NetworkSecret, UserId};
use crate::error::{Error, Result};
use crate::protocol::packet::PeerInfo;
use crate::STATE_VERSION;

/// Network variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkKind {
    /// Two-party chat between the local user and one other.
    Private,
    /// Named multi-party chat with a dynamic peer set.
    Group,
}

impl NetworkKind {
    fn to_byte(self) -> u8 {
        match self {
            Self::Private => 1,
            Self::Group => 2,
        }
    }

    fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            1 => Ok(Self::Private),
            2 => Ok(Self::Group),
            _ => Err(Error::Parse(format!("unknown network kind: {byte}"))),
        }
    }
}

/// Online/offline status machine state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkStatus {
    /// Timers stopped, all peers disconnected.
    Offline,
    /// Discovery and keepalive timers running.
    Online,
}

impl NetworkStatus {
    fn to_byte(self) -> u8 {
        match self {
            Self::Offline => 0,
            Self::Online => 1,
        }
    }

    fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            0 => Ok(Self::Offline),
            1 => Ok(Self::Online),
            _ => Err(Error::Parse(format!("unknown network status: {byte}"))),
        }
    }
}

/// Everything needed to restore a network on the same node.
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkState {
    /// Network variant.
    pub kind: NetworkKind,
    /// The local user id the snapshot belongs to.
    pub local_user_id: UserId,
    /// Group name; `None` for private networks.
    pub network_name: Option<String>,
    /// Shared secret, empty string when unset.
    pub shared_secret: String,
    /// Status at snapshot time.
    pub status: NetworkStatus,
    /// Derived network id.
    pub network_id: NetworkId,
    /// Derived network secret.
    pub network_secret: NetworkSecret,
    /// Message store file stem.
    pub message_store_id: String,
    /// Message store encryption key.
    pub message_store_key: Vec<u8>,
    /// Unix seconds the LAN-only flag last changed.
    pub local_network_only_at: i64,
    /// Only dial RFC 1918 / link-local endpoints.
    pub local_network_only: bool,
    /// Unix seconds the group image last changed.
    pub group_image_at: i64,
    /// Group display image bytes; empty when unset.
    pub group_image: Vec<u8>,
    /// Unix seconds the lock flag last changed.
    pub group_locked_at: i64,
    /// Advisory group lock.
    pub group_locked: bool,
    /// Local mute flag.
    pub mute: bool,
    /// Known peers: exactly one record for private networks, a
    /// count-prefixed list excluding self for groups.
    pub peers: Vec<PeerInfo>,
}

impl NetworkState {
    /// Write the versioned snapshot.
    pub fn write_to(&self, w: &mut impl Write) -> Result<()> {
        write_u8(w, STATE_VERSION)?;
        write_u8(w, self.kind.to_byte())?;
        w.write_all(self.local_user_id.as_bytes())
            .map_err(io_err)?;
        if self.kind == NetworkKind::Group {
            write_string(w, self.network_name.as_deref().unwrap_or(""))?;
        }
        write_string(w, &self.shared_secret)?;
        write_u8(w, self.status.to_byte())?;
        w.write_all(self.network_id.as_bytes()).map_err(io_err)?;
        w.write_all(self.network_secret.as_bytes())
            .map_err(io_err)?;
        write_string(w, &self.message_store_id)?;
        write_bytes(w, &self.message_store_key)?;
        write_i64(w, self.local_network_only_at)?;
        write_bool(w, self.local_network_only)?;
        write_i64(w, self.group_image_at)?;
        write_bytes(w, &self.group_image)?;
        write_i64(w, self.group_locked_at)?;
        write_bool(w, self.group_locked)?;
        write_bool(w, self.mute)?;

        match self.kind {
            NetworkKind::Private => {
                let peer = self
                    .peers
                    .first()
                    .ok_or_else(|| Error::Parse("private snapshot requires one peer".into()))?;
                write_peer_info(w, peer)?;
            }
            NetworkKind::Group => {
                write_u32(w, self.peers.len() as u32)?;
                for peer in &self.peers {
                    write_peer_info(w, peer)?;
                }
            }
        }
        Ok(())
    }

    /// Read a snapshot, rejecting unknown versions.
    pub fn read_from(r: &mut impl Read) -> Result<Self> {
        let version = read_u8(r)?;
        if version != STATE_VERSION {
            return Err(Error::Parse(format!(
                "unsupported network state version: {version}"
            )));
        }

        let kind = NetworkKind::from_byte(read_u8(r)?)?;
        let local_user_id = UserId(read_array(r)?);
        let network_name = if kind == NetworkKind::Group {
            Some(read_string(r)?)
        } else {
            None
        };
        let shared_secret = read_string(r)?;
        let status = NetworkStatus::from_byte(read_u8(r)?)?;
        let network_id = NetworkId(read_array(r)?);
        let network_secret = NetworkSecret(read_array(r)?);
        let message_store_id = read_string(r)?;
        let message_store_key = read_bytes(r)?;
        let local_network_only_at = read_i64(r)?;
        let local_network_only = read_bool(r)?;
        let group_image_at = read_i64(r)?;
        let group_image = read_bytes(r)?;
        let group_locked_at = read_i64(r)?;
        let group_locked = read_bool(r)?;
        let mute = read_bool(r)?;

        let peers = match kind {
            NetworkKind::Private => vec![read_peer_info(r)?],
            NetworkKind::Group => {
                let count = read_u32(r)?;
                let mut peers = Vec::with_capacity(count.min(1024) as usize);
                for _ in 0..count {
                    peers.push(read_peer_info(r)?);
                }
                peers
            }
        };

        Ok(Self {
            kind,
            local_user_id,
            network_name,
            shared_secret,
            status,
            network_id,
            network_secret,
            message_store_id,
            message_store_key,
            local_network_only_at,
            local_network_only,
            group_image_at,
            group_image,
            group_locked_at,
            group_locked,
            mute,
            peers,
        })
    }
}

fn write_peer_info(w: &mut impl Write, peer: &PeerInfo) -> Result<()> {
    w.write_all(peer.user_id.as_bytes()).map_err(io_err)?;
    match &peer.display_name {
        Some(name) => {
            write_bool(w, true)?;
            write_string(w, name)?;
        }
        None => write_bool(w, false)?,
    }
    write_u32(w, peer.endpoints.len() as u32)?;
    for ep in &peer.endpoints {
        write_string(w, &ep.to_string())?;
    }
    Ok(())
}

fn read_peer_info(r: &mut impl Read) -> Result<PeerInfo> {
    let user_id = UserId(read_array(r)?);
    let display_name = if read_bool(r)? {
        Some(read_string(r)?)
    } else {
        None
    };
    let count = read_u32(r)?;
    let mut endpoints = Vec::with_capacity(count.min(64) as usize);
    for _ in 0..count {
        let text = read_string(r)?;
        endpoints.push(
            text.parse()
                .map_err(|_| Error::Parse(format!("invalid endpoint: {text}")))?,
        );
    }
    Ok(PeerInfo {
        user_id,
        display_name,
        endpoints,
    })
}

fn io_err(e: std::io::Error) -> Error {
    Error::Parse(e.to_string())
}

fn write_u8(w: &mut impl Write, v: u8) -> Result<()> {
    w.write_all(&[v]).map_err(io_err)
}

fn write_u32(w: &mut impl Write, v: u32) -> Result<()> {
    w.write_all(&v.to_le_bytes()).map_err(io_err)
}

fn write_i64(w: &mut impl Write, v: i64) -> Result<()> {
    w.write_all(&v.to_le_bytes()).map_err(io_err)
}

fn write_bool(w: &mut impl Write, v: bool) -> Result<()> {
    write_u8(w, v as u8)
}

fn write_bytes(w: &mut impl Write, v: &[u8]) -> Result<()> {
    write_u32(w, v.len() as u32)?;
    w.write_all(v).map_err(io_err)
}

fn write_string(w: &mut impl Write, v: &str) -> Result<()> {
    write_bytes(w, v.as_bytes())
}

fn read_u8(r: &mut impl Read) -> Result<u8> {
    let mut buf = [0u8; 1];
    r.read_exact(&mut buf).map_err(io_err)?;
    Ok(buf[0])
}

fn read_u32(r: &mut impl Read) -> Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf).map_err(io_err)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_i64(r: &mut impl Read) -> Result<i64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf).map_err(io_err)?;
    Ok(i64::from_le_bytes(buf))
}

fn read_bool(r: &mut impl Read) -> Result<bool> {
    match read_u8(r)? {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(Error::Parse(format!("invalid bool byte: {other}"))),
    }
}

fn read_array<const N: usize>(r: &mut impl Read) -> Result<[u8; N]> {
    let mut buf = [0u8; N];
    r.read_exact(&mut buf).map_err(io_err)?;
    Ok(buf)
}

fn read_bytes(r: &mut impl Read) -> Result<Vec<u8>> {
    let len = read_u32(r)? as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf).map_err(io_err)?;
    Ok(buf)
}

fn read_string(r: &mut impl Read) -> Result<String> {
    String::from_utf8(read_bytes(r)?).map_err(|_| Error::Parse("invalid utf-8 string".into()))
}
