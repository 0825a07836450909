//! One authenticated channel to a peer.
//!
//! A session owns a dedicated reader task that pulls frames off the
//! secure channel and either routes control packets to its dispatcher or
//! feeds data frames into the stream table. Sends are serialized on the
//! channel writer's mutex so frames from different producers never
//! interleave; within a session, packets are strictly FIFO.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

use super::session_role_parity;
use crate::crypto::{ChannelReader, ChannelRole, ChannelWriter, CipherSuite, SecureChannel, UserId};
use crate::error::{Error, Result};
use crate::protocol::mux::{stream_pair, DataStream, FrameSink, PortAllocator, FEED_TIMEOUT};
use crate::protocol::packet::{MeshPacket, PeerInfo};
use crate::protocol::{decode_frame, encode_control_frame, encode_data_frame, Frame};
use crate::transport::{Connection, EndPoint};

/// Serialized writer shared by the session and its data streams.
pub struct SessionSender {
    writer: tokio::sync::Mutex<ChannelWriter>,
}

impl SessionSender {
    /// Send one control packet.
    pub async fn send_control(&self, packet: &MeshPacket) -> Result<()> {
        let frame = encode_control_frame(packet)?;
        self.writer.lock().await.write_record(&frame).await
    }
}

#[async_trait]
impl FrameSink for SessionSender {
    async fn send_data_frame(&self, port: u16, payload: &[u8]) -> Result<()> {
        let frame = encode_data_frame(port, payload)?;
        self.writer.lock().await.write_record(&frame).await
    }
}

/// Receives a session's control packets and lifecycle notifications.
#[async_trait]
pub trait SessionDispatcher: Send + Sync {
    /// A control packet arrived on `session`.
    async fn handle_packet(&self, session: &Arc<Session>, packet: MeshPacket);

    /// The session's reader exited. `error` is `None` on orderly EOF.
    async fn session_closed(&self, session: &Arc<Session>, error: Option<Error>);
}

struct StreamTable {
    feeders: HashMap<u16, tokio::sync::mpsc::Sender<Vec<u8>>>,
    allocator: PortAllocator,
}

/// One authenticated, multiplexed link to a peer.
pub struct Session {
    remote_user_id: UserId,
    role: ChannelRole,
    selected_cipher: CipherSuite,
    connection: Arc<Connection>,
    sender: Arc<SessionSender>,
    streams: Mutex<StreamTable>,
    last_peer_exchange: Mutex<Vec<PeerInfo>>,
    seen_messages: Mutex<HashSet<u32>>,
    closed: AtomicBool,
    close_notify: Notify,
}

impl Session {
    /// Wrap an established channel and spawn its reader task.
    pub fn spawn(
        channel: SecureChannel,
        connection: Arc<Connection>,
        dispatcher: Arc<dyn SessionDispatcher>,
    ) -> Arc<Self> {
        let remote_user_id = channel.remote_user_id();
        let role = channel.role();
        let selected_cipher = channel.selected_cipher();
        let (reader, writer) = channel.split();

        let session = Arc::new(Self {
            remote_user_id,
            role,
            selected_cipher,
            connection,
            sender: Arc::new(SessionSender {
                writer: tokio::sync::Mutex::new(writer),
            }),
            streams: Mutex::new(StreamTable {
                feeders: HashMap::new(),
                allocator: PortAllocator::new(session_role_parity(role)),
            }),
            last_peer_exchange: Mutex::new(Vec::new()),
            seen_messages: Mutex::new(HashSet::new()),
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
        });

        tokio::spawn(Self::read_loop(session.clone(), reader, dispatcher));
        session
    }

    async fn read_loop(
        session: Arc<Session>,
        mut reader: ChannelReader,
        dispatcher: Arc<dyn SessionDispatcher>,
    ) {
        let error = loop {
            if session.closed.load(Ordering::Acquire) {
                break None;
            }
            tokio::select! {
                _ = session.close_notify.notified() => break None,
                record = reader.read_record() => match record {
                    Ok(Some(record)) => match decode_frame(&record) {
                        Ok(Frame::Control(packet)) => {
                            trace!(remote = %session.remote_user_id, "control packet");
                            dispatcher.handle_packet(&session, packet).await;
                        }
                        Ok(Frame::Data { port, payload }) => {
                            if let Err(e) = session.feed(port, payload).await {
                                break Some(e);
                            }
                        }
                        Err(e) => break Some(e),
                    },
                    Ok(None) => break None,
                    Err(e) => break Some(e),
                },
            }
        };

        match &error {
            None => debug!(remote = %session.remote_user_id, "session reader exited"),
            Some(e) => warn!(remote = %session.remote_user_id, error = %e, "session failed"),
        }

        session.closed.store(true, Ordering::Release);
        session.streams.lock().expect("stream table lock").feeders.clear();
        dispatcher.session_closed(&session, error).await;
    }

    /// Deposit a data frame into its stream's single-slot buffer.
    ///
    /// Frames are already whole records, so a stalled or vanished
    /// consumer never desynchronises the channel framing: the frame is
    /// simply dropped. A stall past the feed deadline still tears the
    /// session down.
    async fn feed(&self, port: u16, payload: Vec<u8>) -> Result<()> {
        let feeder = {
            let table = self.streams.lock().expect("stream table lock");
            table.feeders.get(&port).cloned()
        };
        let Some(feeder) = feeder else {
            trace!(port, "frame for unknown port dropped");
            return Ok(());
        };

        let is_close = payload.is_empty();
        match feeder.send_timeout(payload, FEED_TIMEOUT).await {
            Ok(()) => {
                if is_close {
                    self.remove_feeder(port);
                }
                Ok(())
            }
            Err(SendTimeoutError::Timeout(_)) => Err(Error::Timeout),
            Err(SendTimeoutError::Closed(_)) => {
                self.remove_feeder(port);
                Ok(())
            }
        }
    }

    fn remove_feeder(&self, port: u16) {
        self.streams
            .lock()
            .expect("stream table lock")
            .feeders
            .remove(&port);
    }

    /// Open a data stream.
    ///
    /// With `port: None` the next free port of this side's parity is
    /// allocated; with `Some(p)` the peer-requested port is claimed,
    /// failing when already in use.
    pub fn open_data_stream(&self, port: Option<u16>) -> Result<DataStream> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::NoSession);
        }
        let mut table = self.streams.lock().expect("stream table lock");
        let port = match port {
            Some(p) => {
                if p == 0 {
                    return Err(Error::Policy("port 0 is reserved for control".into()));
                }
                if table.feeders.contains_key(&p) {
                    return Err(Error::Policy(format!("port {p} already in use")));
                }
                p
            }
            None => {
                let used: HashSet<u16> = table.feeders.keys().copied().collect();
                table.allocator.next_free(&used)?
            }
        };

        let sink: Arc<dyn FrameSink> = self.sender.clone();
        let (tx, stream) = stream_pair(port, sink);
        table.feeders.insert(port, tx);
        Ok(stream)
    }

    /// Send one control packet on this session.
    pub async fn send_packet(&self, packet: &MeshPacket) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::NoSession);
        }
        self.sender.send_control(packet).await
    }

    /// First sight of a message number on this session?
    ///
    /// The sender identity is fixed per session, so the number alone
    /// identifies the message here.
    pub fn mark_seen(&self, message_number: u32) -> bool {
        self.seen_messages
            .lock()
            .expect("seen lock")
            .insert(message_number)
    }

    /// Authenticated remote user id.
    pub fn remote_user_id(&self) -> UserId {
        self.remote_user_id
    }

    /// Handshake role this side played.
    pub fn role(&self) -> ChannelRole {
        self.role
    }

    /// Negotiated cipher suite.
    pub fn selected_cipher(&self) -> CipherSuite {
        self.selected_cipher
    }

    /// The underlying transport connection.
    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// The remote endpoint.
    pub fn remote_ep(&self) -> EndPoint {
        self.connection.remote_peer_ep()
    }

    /// Whether the link is tunnelled through a third party.
    pub fn is_virtual(&self) -> bool {
        self.connection.is_virtual()
    }

    /// Record the peer list this session last advertised.
    pub fn set_last_peer_exchange(&self, peers: Vec<PeerInfo>) {
        *self.last_peer_exchange.lock().expect("peer exchange lock") = peers;
    }

    /// The peer list this session last advertised.
    pub fn last_peer_exchange(&self) -> Vec<PeerInfo> {
        self.last_peer_exchange
            .lock()
            .expect("peer exchange lock")
            .clone()
    }

    /// Whether the session has been torn down.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Tear the session down: the reader exits as orderly EOF and open
    /// streams observe the session's end.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.close_notify.notify_one();
        self.streams.lock().expect("stream table lock").feeders.clear();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("remote_user_id", &self.remote_user_id)
            .field("role", &self.role)
            .field("remote_ep", &self.connection.remote_peer_ep())
            .field("is_virtual", &self.connection.is_virtual())
            .finish()
    }
}
