//! Wire protocol inside the secure channel.
//!
//! Outer framing is `port:u16_le | length:u16_le | bytes[length]`, one
//! frame per channel record. Port 0 carries control packets, which
//! self-describe (`type:u8` then per-type body); all other ports carry
//! [`mux::DataStream`] traffic.

pub mod mux;
pub mod packet;

pub use packet::MeshPacket;

use crate::error::{Error, Result};

/// Port 0 is reserved for control packets.
pub const CONTROL_PORT: u16 = 0;

/// A decoded frame.
#[derive(Debug)]
pub enum Frame {
    /// A control packet (port 0).
    Control(MeshPacket),
    /// Bytes for a data stream port.
    Data {
        /// Destination port (> 0).
        port: u16,
        /// Frame payload; empty means "close stream".
        payload: Vec<u8>,
    },
}

/// Encode a control packet as a frame.
pub fn encode_control_frame(packet: &MeshPacket) -> Result<Vec<u8>> {
    let body = packet.to_bytes()?;
    let mut frame = Vec::with_capacity(2 + body.len());
    frame.extend_from_slice(&CONTROL_PORT.to_le_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Encode a data frame for `port`.
pub fn encode_data_frame(port: u16, payload: &[u8]) -> Result<Vec<u8>> {
    if port == CONTROL_PORT {
        return Err(Error::Policy("port 0 is reserved for control".into()));
    }
    if payload.len() > u16::MAX as usize {
        return Err(Error::Policy("data frame payload too large".into()));
    }
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&port.to_le_bytes());
    frame.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Decode one frame from a channel record.
pub fn decode_frame(record: &[u8]) -> Result<Frame> {
    if record.len() < 2 {
        return Err(Error::Parse("frame too short".into()));
    }
    let port = u16::from_le_bytes([record[0], record[1]]);

    if port == CONTROL_PORT {
        return Ok(Frame::Control(MeshPacket::from_bytes(&record[2..])?));
    }

    if record.len() < 4 {
        return Err(Error::Parse("data frame header too short".into()));
    }
    let length = u16::from_le_bytes([record[2], record[3]]) as usize;
    let payload = &record[4..];
    if payload.len() != length {
        return Err(Error::Parse(format!(
            "data frame length mismatch: header {length}, got {}",
            payload.len()
        )));
    }

    Ok(Frame::Data {
        port,
        payload: payload.to_vec(),
    })
}
