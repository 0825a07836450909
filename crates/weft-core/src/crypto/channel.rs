//! Mutually authenticated secure channel.
//!
//! The channel wraps a raw transport stream with a pre-shared-key plus
//! public-key authenticated handshake and a ChaCha20-Poly1305 record
//! layer. The PSK enters the HKDF salt of the key schedule, so a PSK
//! mismatch surfaces as an authentication failure on the very first
//! record. Each side additionally signs the handshake transcript with its
//! Ed25519 identity key; the verifier may restrict the claimed user id to
//! a trusted set.
//!
//! Renegotiation is threshold-driven: after [`RenegotiationPolicy`] limits
//! are hit, the writer interleaves a rekey record and both directions step
//! their keys through HKDF. Readers handle rekey records transparently.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tracing::{debug, trace};
use zeroize::Zeroizing;

use super::keys::{verify_signature, CipherSuite, NodeIdentity, UserId};
use crate::error::{Error, Result};
use crate::logging::RedactedBytes;
use crate::transport::BoxedTransport;
use crate::{MAX_RECORD_SIZE, PROTOCOL_VERSION};

/// Handshake must complete within this bound.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Upper bound on an encoded hello message.
const MAX_HELLO_SIZE: usize = 1024;

/// AEAD tag size.
const TAG_SIZE: usize = 16;

/// Record type carried in the first plaintext byte.
const REC_DATA: u8 = 0;
const REC_REKEY: u8 = 1;
const REC_FINISHED: u8 = 2;

/// Nonce direction constants; client-write and server-write never collide.
const DIR_CLIENT: u32 = 1;
const DIR_SERVER: u32 = 2;

/// Which end of the handshake this side played.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelRole {
    /// We dialled.
    Client,
    /// We accepted.
    Server,
}

/// Thresholds after which the channel renegotiates its record keys.
#[derive(Debug, Clone)]
pub struct RenegotiationPolicy {
    /// Rekey after this many plaintext bytes written.
    pub max_bytes: u64,
    /// Rekey after this much time since the last (re)keying.
    pub max_age: Duration,
}

impl Default for RenegotiationPolicy {
    fn default() -> Self {
        Self {
            max_bytes: 100 * 1024 * 1024,
            max_age: Duration::from_secs(3600),
        }
    }
}

/// Parameters for establishing a channel.
pub struct ChannelConfig {
    /// Pre-shared key mixed into the key schedule. Mandatory.
    pub psk: Zeroizing<Vec<u8>>,
    /// Local identity used for client authentication.
    pub identity: Arc<NodeIdentity>,
    /// When set, the remote user id must be a member of this set.
    pub trusted: Option<HashSet<UserId>>,
    /// Cipher suites offered (client) or accepted (server).
    pub ciphers: Vec<CipherSuite>,
    /// Rekey thresholds.
    pub renegotiation: RenegotiationPolicy,
}

#[derive(Serialize, Deserialize)]
struct Hello {
    version: u8,
    user_id: UserId,
    verifying_key: [u8; 32],
    ephemeral: [u8; 32],
    ciphers: Vec<u8>,
    nonce: [u8; 32],
}

#[derive(Serialize, Deserialize)]
struct Finished {
    signature: Vec<u8>,
}

/// An established authenticated channel.
pub struct SecureChannel {
    remote_user_id: UserId,
    selected_cipher: CipherSuite,
    role: ChannelRole,
    reader: ChannelReader,
    writer: ChannelWriter,
}

impl std::fmt::Debug for SecureChannel {
    /// Key material in `reader`/`writer` is deliberately omitted.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureChannel")
            .field("remote_user_id", &self.remote_user_id)
            .field("selected_cipher", &self.selected_cipher)
            .field("role", &self.role)
            .finish_non_exhaustive()
    }
}

impl SecureChannel {
    /// Establish a channel as the dialling side.
    pub async fn connect(stream: BoxedTransport, config: ChannelConfig) -> Result<Self> {
        tokio::time::timeout(HANDSHAKE_TIMEOUT, Self::handshake(stream, config, ChannelRole::Client))
            .await
            .map_err(|_| Error::Timeout)?
    }

    /// Establish a channel as the accepting side.
    pub async fn accept(stream: BoxedTransport, config: ChannelConfig) -> Result<Self> {
        tokio::time::timeout(HANDSHAKE_TIMEOUT, Self::handshake(stream, config, ChannelRole::Server))
            .await
            .map_err(|_| Error::Timeout)?
    }

    async fn handshake(
        stream: BoxedTransport,
        config: ChannelConfig,
        role: ChannelRole,
    ) -> Result<Self> {
        let (mut rd, mut wr) = tokio::io::split(stream);

        if config.ciphers.is_empty() {
            return Err(Error::Crypto("no cipher suites configured".into()));
        }

        let ephemeral = x25519_dalek::StaticSecret::random_from_rng(rand::rngs::OsRng);
        let ephemeral_public = x25519_dalek::PublicKey::from(&ephemeral);

        let local_hello = Hello {
            version: PROTOCOL_VERSION,
            user_id: config.identity.user_id(),
            verifying_key: config.identity.verifying_key_bytes(),
            ephemeral: *ephemeral_public.as_bytes(),
            ciphers: config.ciphers.iter().map(|c| c.to_byte()).collect(),
            nonce: super::random_bytes(),
        };

        // Hellos are exchanged in the clear: client first, then server.
        let (client_bytes, server_bytes, remote_hello) = match role {
            ChannelRole::Client => {
                let sent = write_hello(&mut wr, &local_hello).await?;
                let (received, remote) = read_hello(&mut rd).await?;
                (sent, received, remote)
            }
            ChannelRole::Server => {
                let (received, remote) = read_hello(&mut rd).await?;
                let sent = write_hello(&mut wr, &local_hello).await?;
                (received, sent, remote)
            }
        };

        if remote_hello.version != PROTOCOL_VERSION {
            return Err(Error::Crypto(format!(
                "unsupported channel version: {}",
                remote_hello.version
            )));
        }

        let selected = negotiate_cipher(role, &config.ciphers, &remote_hello.ciphers)?;

        let transcript: [u8; 32] = {
            let mut hasher = Sha256::new();
            hasher.update(&client_bytes);
            hasher.update(&server_bytes);
            hasher.finalize().into()
        };

        let their_public = x25519_dalek::PublicKey::from(remote_hello.ephemeral);
        let shared = ephemeral.diffie_hellman(&their_public);

        let mut info = Vec::with_capacity(16 + 32);
        info.extend_from_slice(b"weft/channel/v1");
        info.extend_from_slice(&transcript);
        let keys = super::hkdf_derive(Some(&config.psk), shared.as_bytes(), &info, 64)?;

        let mut client_key = Zeroizing::new([0u8; 32]);
        let mut server_key = Zeroizing::new([0u8; 32]);
        client_key.copy_from_slice(&keys[..32]);
        server_key.copy_from_slice(&keys[32..]);

        let (send_key, send_dir, recv_key, recv_dir) = match role {
            ChannelRole::Client => (client_key, DIR_CLIENT, server_key, DIR_SERVER),
            ChannelRole::Server => (server_key, DIR_SERVER, client_key, DIR_CLIENT),
        };

        let mut writer = ChannelWriter {
            inner: wr,
            key: send_key,
            direction: send_dir,
            counter: 0,
            bytes_since_rekey: 0,
            rekeyed_at: Instant::now(),
            policy: config.renegotiation.clone(),
        };
        let mut reader = ChannelReader {
            inner: rd,
            key: recv_key,
            direction: recv_dir,
            counter: 0,
        };

        // Authentication: each side signs the transcript; the finished
        // records are the first AEAD traffic, so a PSK mismatch fails here.
        let local_finished = Finished {
            signature: config
                .identity
                .sign(&finished_message(role, &transcript))
                .to_vec(),
        };
        let finished_bytes = bincode::serialize(&local_finished)?;

        let remote_finished = match role {
            ChannelRole::Client => {
                writer.write_typed(REC_FINISHED, &finished_bytes).await?;
                read_finished(&mut reader).await?
            }
            ChannelRole::Server => {
                let received = read_finished(&mut reader).await?;
                writer.write_typed(REC_FINISHED, &finished_bytes).await?;
                received
            }
        };

        let remote_role = match role {
            ChannelRole::Client => ChannelRole::Server,
            ChannelRole::Server => ChannelRole::Client,
        };
        let signature: [u8; 64] = remote_finished
            .signature
            .as_slice()
            .try_into()
            .map_err(|_| Error::Crypto("invalid finished signature length".into()))?;
        verify_signature(
            &remote_hello.verifying_key,
            &finished_message(remote_role, &transcript),
            &signature,
        )?;

        if let Some(trusted) = &config.trusted {
            if !trusted.contains(&remote_hello.user_id) {
                return Err(Error::Crypto("remote identity is not trusted".into()));
            }
        }

        debug!(
            remote = %remote_hello.user_id,
            cipher = ?selected,
            role = ?role,
            psk = %RedactedBytes(&config.psk),
            "secure channel established"
        );

        Ok(Self {
            remote_user_id: remote_hello.user_id,
            selected_cipher: selected,
            role,
            reader,
            writer,
        })
    }

    /// Authenticated remote user id.
    pub fn remote_user_id(&self) -> UserId {
        self.remote_user_id
    }

    /// Negotiated cipher suite.
    pub fn selected_cipher(&self) -> CipherSuite {
        self.selected_cipher
    }

    /// Which side of the handshake we played.
    pub fn role(&self) -> ChannelRole {
        self.role
    }

    /// Read the next data record before splitting.
    ///
    /// The invitation accept path peeks at the first control frame this
    /// way before handing the channel to a session.
    pub async fn read_record(&mut self) -> Result<Option<Zeroizing<Vec<u8>>>> {
        self.reader.read_record().await
    }

    /// Write a data record before splitting.
    ///
    /// The invitation dial path sends its payload as the first control
    /// frame this way before handing the channel to a session.
    pub async fn write_record(&mut self, plaintext: &[u8]) -> Result<()> {
        self.writer.write_record(plaintext).await
    }

    /// Split into independently usable read and write halves.
    pub fn split(self) -> (ChannelReader, ChannelWriter) {
        (self.reader, self.writer)
    }
}

/// Read half of an established channel.
pub struct ChannelReader {
    inner: ReadHalf<BoxedTransport>,
    key: Zeroizing<[u8; 32]>,
    direction: u32,
    counter: u64,
}

impl ChannelReader {
    /// Read the next data record.
    ///
    /// Returns `Ok(None)` on orderly end-of-stream at a record boundary.
    /// Rekey records are consumed transparently.
    pub async fn read_record(&mut self) -> Result<Option<Zeroizing<Vec<u8>>>> {
        loop {
            let ciphertext = match self.read_raw().await? {
                Some(ct) => ct,
                None => return Ok(None),
            };

            let plaintext = open(&self.key, self.direction, self.counter, &ciphertext)?;
            self.counter += 1;

            match plaintext.first().copied() {
                Some(REC_DATA) => {
                    return Ok(Some(Zeroizing::new(plaintext[1..].to_vec())));
                }
                Some(REC_REKEY) => {
                    self.key = step_key(&self.key)?;
                    self.counter = 0;
                    trace!("receive key stepped");
                }
                Some(REC_FINISHED) => {
                    return Err(Error::Crypto("unexpected finished record".into()));
                }
                _ => return Err(Error::Parse("empty channel record".into())),
            }
        }
    }

    async fn read_raw(&mut self) -> Result<Option<Vec<u8>>> {
        // A zero-byte read at the length boundary is an orderly close.
        let mut len_buf = [0u8; 4];
        let n = self.inner.read(&mut len_buf[..1]).await?;
        if n == 0 {
            return Ok(None);
        }
        self.inner.read_exact(&mut len_buf[1..]).await?;

        let len = u32::from_le_bytes(len_buf) as usize;
        if len < TAG_SIZE || len > MAX_RECORD_SIZE + TAG_SIZE + 1 {
            return Err(Error::Parse(format!("invalid record length: {len}")));
        }

        let mut ciphertext = vec![0u8; len];
        self.inner.read_exact(&mut ciphertext).await?;
        Ok(Some(ciphertext))
    }
}

/// Write half of an established channel.
///
/// Callers serialise access (one frame at a time) with an outer lock; the
/// writer itself tracks renegotiation thresholds.
pub struct ChannelWriter {
    inner: WriteHalf<BoxedTransport>,
    key: Zeroizing<[u8; 32]>,
    direction: u32,
    counter: u64,
    bytes_since_rekey: u64,
    rekeyed_at: Instant,
    policy: RenegotiationPolicy,
}

impl ChannelWriter {
    /// Write one data record, rekeying first if thresholds are exceeded.
    pub async fn write_record(&mut self, plaintext: &[u8]) -> Result<()> {
        if plaintext.len() > MAX_RECORD_SIZE {
            return Err(Error::Policy("record exceeds maximum size".into()));
        }

        if self.bytes_since_rekey >= self.policy.max_bytes
            || self.rekeyed_at.elapsed() >= self.policy.max_age
        {
            self.write_typed(REC_REKEY, &[]).await?;
            self.key = step_key(&self.key)?;
            self.counter = 0;
            self.bytes_since_rekey = 0;
            self.rekeyed_at = Instant::now();
            debug!("send key stepped");
        }

        self.write_typed(REC_DATA, plaintext).await?;
        self.bytes_since_rekey += plaintext.len() as u64;
        Ok(())
    }

    /// Signal orderly close of the write direction.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }

    async fn write_typed(&mut self, rec_type: u8, payload: &[u8]) -> Result<()> {
        let mut plaintext = Vec::with_capacity(1 + payload.len());
        plaintext.push(rec_type);
        plaintext.extend_from_slice(payload);

        let ciphertext = seal(&self.key, self.direction, self.counter, &plaintext)?;
        self.counter += 1;

        self.inner
            .write_all(&(ciphertext.len() as u32).to_le_bytes())
            .await?;
        self.inner.write_all(&ciphertext).await?;
        self.inner.flush().await?;
        Ok(())
    }
}

fn finished_message(role: ChannelRole, transcript: &[u8; 32]) -> Vec<u8> {
    let role_byte = match role {
        ChannelRole::Client => b'C',
        ChannelRole::Server => b'S',
    };
    let mut msg = Vec::with_capacity(16 + 1 + 32);
    msg.extend_from_slice(b"weft/finished/v1");
    msg.push(role_byte);
    msg.extend_from_slice(transcript);
    msg
}

fn negotiate_cipher(
    role: ChannelRole,
    local: &[CipherSuite],
    remote: &[u8],
) -> Result<CipherSuite> {
    match role {
        // The server picks the first locally supported suite the client
        // offered; the client checks the server's single selection.
        ChannelRole::Server => remote
            .iter()
            .filter_map(|b| CipherSuite::from_byte(*b).ok())
            .find(|c| local.contains(c))
            .ok_or_else(|| Error::Crypto("no common cipher suite".into())),
        ChannelRole::Client => {
            if remote.len() != 1 {
                return Err(Error::Crypto("server must select one cipher".into()));
            }
            let selected = CipherSuite::from_byte(remote[0])?;
            if !local.contains(&selected) {
                return Err(Error::Crypto("server selected unoffered cipher".into()));
            }
            Ok(selected)
        }
    }
}

fn nonce_for(direction: u32, counter: u64) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[..4].copy_from_slice(&direction.to_le_bytes());
    nonce[4..].copy_from_slice(&counter.to_le_bytes());
    nonce
}

fn seal(key: &[u8; 32], direction: u32, counter: u64, plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .encrypt(Nonce::from_slice(&nonce_for(direction, counter)), plaintext)
        .map_err(|_| Error::Crypto("record encryption failed".into()))
}

fn open(key: &[u8; 32], direction: u32, counter: u64, ciphertext: &[u8]) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(Nonce::from_slice(&nonce_for(direction, counter)), ciphertext)
        .map_err(|_| Error::Crypto("record authentication failed".into()))
}

fn step_key(key: &[u8; 32]) -> Result<Zeroizing<[u8; 32]>> {
    let derived = super::hkdf_derive(None, key, b"weft/rekey/v1", 32)?;
    let mut next = Zeroizing::new([0u8; 32]);
    next.copy_from_slice(&derived);
    Ok(next)
}

async fn write_hello(wr: &mut WriteHalf<BoxedTransport>, hello: &Hello) -> Result<Vec<u8>> {
    let bytes = bincode::serialize(hello)?;
    if bytes.len() > MAX_HELLO_SIZE {
        return Err(Error::Crypto("hello message too large".into()));
    }
    wr.write_all(&(bytes.len() as u16).to_le_bytes()).await?;
    wr.write_all(&bytes).await?;
    wr.flush().await?;
    Ok(bytes)
}

async fn read_hello(rd: &mut ReadHalf<BoxedTransport>) -> Result<(Vec<u8>, Hello)> {
    let mut len_buf = [0u8; 2];
    rd.read_exact(&mut len_buf).await?;
    let len = u16::from_le_bytes(len_buf) as usize;
    if len > MAX_HELLO_SIZE {
        return Err(Error::Crypto("hello message too large".into()));
    }
    let mut bytes = vec![0u8; len];
    rd.read_exact(&mut bytes).await?;
    let hello: Hello = bincode::deserialize(&bytes)?;
    Ok((bytes, hello))
}

async fn read_finished(reader: &mut ChannelReader) -> Result<Finished> {
    let ciphertext = reader
        .read_raw()
        .await?
        .ok_or_else(|| Error::Crypto("connection closed during handshake".into()))?;
    let plaintext = open(&reader.key, reader.direction, reader.counter, &ciphertext)
        .map_err(|_| Error::Crypto("channel authentication failed".into()))?;
    reader.counter += 1;

    if plaintext.first().copied() != Some(REC_FINISHED) {
        return Err(Error::Crypto("expected finished record".into()));
    }
    Ok(bincode::deserialize(&plaintext[1..])?)
}
