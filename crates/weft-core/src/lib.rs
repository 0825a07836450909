//! # Weft Core Library
//!
//! The per-network runtime that turns a set of discovered endpoints into an
//! authenticated, encrypted, multi-peer messaging overlay with ordered
//! per-peer delivery, connection healing, multiplexed in-band data streams
//! for file transfer, and a persistent encrypted message log.
//!
//! ## Core Guarantees
//!
//! - Deterministic network identity and pre-shared key derived from a
//!   human-chosen secret
//! - Mutually authenticated secure channels (PSK + public-key client auth)
//!   with transparent renegotiation
//! - Many-to-many peer sessions with reconnection and virtual (relayed)
//!   fallback
//! - At-most-once persistent messaging with delivery receipts and per-peer
//!   re-delivery on reconnection
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │              Application                │
//! ├─────────────────────────────────────────┤
//! │  messaging  │  storage  │   transport   │
//! ├─────────────────────────────────────────┤
//! │           protocol (wire)               │
//! ├─────────────────────────────────────────┤
//! │              crypto                     │
//! └─────────────────────────────────────────┘
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, clippy::all)]

pub mod crypto;
pub mod error;
pub mod logging;
pub mod messaging;
pub mod node;
pub mod protocol;
pub mod storage;
pub mod transport;

pub use error::{Error, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Wire protocol version for compatibility checks
pub const PROTOCOL_VERSION: u8 = 1;

/// Serialized network state version
pub const STATE_VERSION: u8 = 1;

/// Maximum plaintext carried by one secure-channel record (64 KiB)
pub const MAX_RECORD_SIZE: usize = 65536;

/// Maximum mesh message size: one channel record minus framing headroom
pub const MAX_MESSAGE_SIZE: usize = MAX_RECORD_SIZE - 32;
