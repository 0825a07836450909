//! End-to-end fabric tests over in-memory transports.
//!
//! Each harness node gets an endpoint in a shared world; dials create
//! duplex pairs and inbound streams are routed to the matching network,
//! or through the invitation accept path when the network id is unknown.

use async_trait::async_trait;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio::sync::{broadcast, mpsc, oneshot};

use weft_core::crypto::{MaskedUserId, NetworkId, NodeIdentity, UserId};
use weft_core::error::{Error, Result};
use weft_core::messaging::{ConnectivityStatus, Network, NetworkEvent};
use weft_core::node::Node;
use weft_core::storage::state::NetworkKind;
use weft_core::transport::discovery::Dht;
use weft_core::transport::{
    BoxedTransport, ChannelOpener, Connection, ConnectionManager, EndPoint,
};

type Inbound = (NetworkId, DuplexStream, SocketAddr);

#[derive(Clone, Default)]
struct World {
    listeners: Arc<Mutex<HashMap<SocketAddr, mpsc::UnboundedSender<Inbound>>>>,
}

struct MemOpener {
    tx: mpsc::UnboundedSender<Inbound>,
    dialer_ep: SocketAddr,
}

#[async_trait]
impl ChannelOpener for MemOpener {
    async fn channel_exists(&self, _network_id: &NetworkId) -> bool {
        false
    }

    async fn open_channel(&self, network_id: &NetworkId) -> Result<BoxedTransport> {
        let (local, remote) = tokio::io::duplex(262_144);
        self.tx
            .send((*network_id, remote, self.dialer_ep))
            .map_err(|_| Error::Transport("listener gone".into()))?;
        Ok(Box::new(local))
    }
}

/// Hands out a stream that already exists (the accept side).
struct ReadyOpener {
    stream: Mutex<Option<DuplexStream>>,
}

#[async_trait]
impl ChannelOpener for ReadyOpener {
    async fn channel_exists(&self, _network_id: &NetworkId) -> bool {
        true
    }

    async fn open_channel(&self, _network_id: &NetworkId) -> Result<BoxedTransport> {
        let stream = self
            .stream
            .lock()
            .expect("stream lock")
            .take()
            .ok_or_else(|| Error::Transport("stream already taken".into()))?;
        Ok(Box::new(stream))
    }
}

struct MemConnections {
    world: World,
    local_ep: SocketAddr,
}

#[async_trait]
impl ConnectionManager for MemConnections {
    async fn make_connection(&self, ep: EndPoint) -> Result<Connection> {
        let tx = self
            .world
            .listeners
            .lock()
            .expect("world lock")
            .get(&ep)
            .cloned()
            .ok_or_else(|| Error::Transport(format!("no listener at {ep}")))?;
        Ok(Connection::new(
            ep,
            None,
            false,
            Box::new(MemOpener {
                tx,
                dialer_ep: self.local_ep,
            }),
        ))
    }

    async fn make_virtual_connection(&self, via: &Connection, ep: EndPoint) -> Result<Connection> {
        let tx = self
            .world
            .listeners
            .lock()
            .expect("world lock")
            .get(&ep)
            .cloned()
            .ok_or_else(|| Error::Transport(format!("no listener at {ep}")))?;
        Ok(Connection::new(
            ep,
            Some(via.remote_peer_ep()),
            true,
            Box::new(MemOpener {
                tx,
                dialer_ep: self.local_ep,
            }),
        ))
    }

    fn local_port(&self) -> u16 {
        self.local_ep.port()
    }

    async fn register_hosted_network(&self, _network_id: &NetworkId) -> Result<()> {
        Ok(())
    }

    async fn unregister_hosted_network(&self, _network_id: &NetworkId) -> Result<()> {
        Ok(())
    }
}

#[derive(Clone, Default)]
struct MemDht {
    masked: Arc<Mutex<HashMap<[u8; 32], Vec<SocketAddr>>>>,
}

#[async_trait]
impl Dht for MemDht {
    async fn find_peers(&self, target: &MaskedUserId, _local_only: bool) -> Result<Vec<EndPoint>> {
        Ok(self
            .masked
            .lock()
            .expect("dht lock")
            .get(target.as_bytes())
            .cloned()
            .unwrap_or_default())
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

/// One simulated node: identity, endpoint, acceptor loop.
struct Harness {
    node: Arc<Node>,
    ep: SocketAddr,
    connections: Arc<dyn ConnectionManager>,
    dht: MemDht,
    networks: Arc<Mutex<Vec<Arc<Network>>>>,
    invitations: Mutex<Option<oneshot::Sender<Arc<Network>>>>,
    _tmp: tempfile::TempDir,
}

impl Harness {
    fn new(world: &World, port: u16) -> Arc<Self> {
        Self::with_identity(world, port, NodeIdentity::generate())
    }

    fn with_identity(world: &World, port: u16, identity: NodeIdentity) -> Arc<Self> {
        let tmp = tempfile::tempdir().expect("tempdir");
        let ep: SocketAddr = format!("127.0.0.1:{port}").parse().expect("endpoint");
        let node = Node::new(identity, tmp.path());
        let connections: Arc<dyn ConnectionManager> = Arc::new(MemConnections {
            world: world.clone(),
            local_ep: ep,
        });

        let (tx, rx) = mpsc::unbounded_channel();
        world
            .listeners
            .lock()
            .expect("world lock")
            .insert(ep, tx);

        let harness = Arc::new(Self {
            node,
            ep,
            connections,
            dht: MemDht::default(),
            networks: Arc::new(Mutex::new(Vec::new())),
            invitations: Mutex::new(None),
            _tmp: tmp,
        });

        tokio::spawn(Self::acceptor(harness.clone(), rx));
        harness
    }

    async fn acceptor(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<Inbound>) {
        while let Some((network_id, stream, dialer_ep)) = rx.recv().await {
            let conn = Connection::new(
                dialer_ep,
                None,
                false,
                Box::new(ReadyOpener {
                    stream: Mutex::new(Some(stream)),
                }),
            );

            let known = {
                let networks = self.networks.lock().expect("network list lock");
                networks
                    .iter()
                    .find(|n| n.network_id() == network_id)
                    .cloned()
            };

            match known {
                Some(network) => {
                    tokio::spawn(async move {
                        let _ = network.accept_connection(conn).await;
                    });
                }
                None => {
                    let harness = self.clone();
                    tokio::spawn(async move {
                        match Network::accept_private_invitation(
                            harness.node.clone(),
                            harness.connections.clone(),
                            Arc::new(harness.dht.clone()),
                            network_id,
                            conn,
                        )
                        .await
                        {
                            Ok(network) => {
                                harness
                                    .networks
                                    .lock()
                                    .expect("network list lock")
                                    .push(network.clone());
                                if let Some(tx) = harness
                                    .invitations
                                    .lock()
                                    .expect("invitation lock")
                                    .take()
                                {
                                    let _ = tx.send(network);
                                }
                            }
                            Err(e) => eprintln!("invitation rejected: {e}"),
                        }
                    });
                }
            }
        }
    }

    fn expect_invitation(&self) -> oneshot::Receiver<Arc<Network>> {
        let (tx, rx) = oneshot::channel();
        *self.invitations.lock().expect("invitation lock") = Some(tx);
        rx
    }

    fn track(&self, network: Arc<Network>) -> Arc<Network> {
        self.networks
            .lock()
            .expect("network list lock")
            .push(network.clone());
        network
    }

    fn new_private(&self, other: UserId) -> Arc<Network> {
        self.track(
            Network::new_private(
                self.node.clone(),
                self.connections.clone(),
                Arc::new(self.dht.clone()),
                other,
                None,
            )
            .expect("private network"),
        )
    }

    fn new_group(&self, name: &str, secret: Option<&str>) -> Arc<Network> {
        self.track(
            Network::new_group(
                self.node.clone(),
                self.connections.clone(),
                Arc::new(self.dht.clone()),
                name,
                secret,
            )
            .expect("group network"),
        )
    }
}

async fn wait_for_event<F>(
    rx: &mut broadcast::Receiver<NetworkEvent>,
    mut predicate: F,
) -> NetworkEvent
where
    F: FnMut(&NetworkEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let event = rx.recv().await.expect("event stream");
            if predicate(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(400)).await;
}

/// `RUST_LOG=weft_core=debug cargo test` shows the fabric at work.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn invitation_happy_path() {
    init_tracing();
    let world = World::default();
    let alice = Harness::new(&world, 4101);
    let bob = Harness::new(&world, 4102);

    let alice_net = alice.new_private(bob.node.user_id());
    let mut alice_events = alice_net.subscribe();

    // The first outbound message of a fresh private network is the
    // invitation payload.
    let number = alice_net.send_text_message("hi").await.expect("compose");
    assert_eq!(number, 0);
    assert!(alice_net.invitation_pending().await);

    let invitation = bob.expect_invitation();
    alice_net.go_online().await;
    alice_net
        .begin_make_connection(bob.ep, None)
        .expect("dial");

    // Bob accepts as an offline private network with the invitation
    // persisted, undelivered from Bob's point of view.
    let bob_net = tokio::time::timeout(Duration::from_secs(10), invitation)
        .await
        .expect("invitation timeout")
        .expect("invitation accepted");
    assert_eq!(bob_net.kind(), NetworkKind::Private);
    assert_eq!(bob_net.other_user_id(), Some(alice.node.user_id()));

    assert_eq!(bob_net.store().message_count().await, 1);
    let entry = bob_net.store().read(0).await.expect("bob log entry");
    assert_eq!(entry.sender, alice.node.user_id());
    assert_eq!(entry.payload, b"hi");
    assert!(!entry.is_delivered_to(&bob.node.user_id()));

    // Alice observes the delivery notification for message 0 and her
    // entry flips to delivered.
    wait_for_event(&mut alice_events, |e| {
        matches!(
            e,
            NetworkEvent::MessageDeliveryNotification {
                message_number: 0,
                ..
            }
        )
    })
    .await;
    let entry = alice_net.store().read(0).await.expect("alice log entry");
    assert!(entry.is_delivered_to(&bob.node.user_id()));
    assert!(!alice_net.invitation_pending().await);

    // Both ends see the other online.
    settle().await;
    assert!(alice_net
        .peer(&bob.node.user_id())
        .expect("bob peer")
        .is_online());
    assert!(bob_net
        .peer(&alice.node.user_id())
        .expect("alice peer")
        .is_online());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn message_round_trip_with_dedupe() {
    let world = World::default();
    let alice = Harness::new(&world, 4111);
    let bob = Harness::new(&world, 4112);

    let alice_net = alice.new_private(bob.node.user_id());
    let bob_net = bob.new_private(alice.node.user_id());
    assert_eq!(alice_net.network_id(), bob_net.network_id());

    let mut bob_events = bob_net.subscribe();
    let mut alice_events = alice_net.subscribe();

    alice_net.go_online().await;
    bob_net.go_online().await;
    alice_net
        .begin_make_connection(bob.ep, None)
        .expect("dial");
    settle().await;

    let number = alice_net.send_text_message("over the fabric").await.expect("send");

    let event = wait_for_event(&mut bob_events, |e| {
        matches!(e, NetworkEvent::MessageReceived { from, .. } if *from == alice.node.user_id())
    })
    .await;
    match event {
        NetworkEvent::MessageReceived { item, .. } => {
            assert_eq!(item.payload, b"over the fabric");
        }
        _ => unreachable!(),
    }

    wait_for_event(&mut alice_events, |e| {
        matches!(
            e,
            NetworkEvent::MessageDeliveryNotification { message_number, recipient }
                if *message_number == number && *recipient == bob.node.user_id()
        )
    })
    .await;

    let entry = alice_net.store().read(number).await.expect("entry");
    assert!(entry.is_delivered_to(&bob.node.user_id()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn redelivery_in_original_order() {
    let world = World::default();
    let alice = Harness::new(&world, 4121);
    let bob = Harness::new(&world, 4122);

    let alice_net = alice.new_private(bob.node.user_id());
    let bob_net = bob.new_private(alice.node.user_id());

    // Bob is offline while Alice composes three messages.
    for text in ["one", "two", "three"] {
        alice_net.send_text_message(text).await.expect("compose");
    }

    let mut bob_events = bob_net.subscribe();
    alice_net.go_online().await;
    bob_net.go_online().await;
    alice_net
        .begin_make_connection(bob.ep, None)
        .expect("dial");

    // Re-delivery arrives in original order.
    let mut received = Vec::new();
    while received.len() < 3 {
        let event = wait_for_event(&mut bob_events, |e| {
            matches!(e, NetworkEvent::MessageReceived { .. })
        })
        .await;
        if let NetworkEvent::MessageReceived { item, .. } = event {
            received.push(String::from_utf8(item.payload).expect("utf-8"));
        }
    }
    assert_eq!(received, vec!["one", "two", "three"]);

    // All three flip to delivered on Alice's side.
    settle().await;
    for number in 0..3 {
        let entry = alice_net.store().read(number).await.expect("entry");
        assert!(entry.is_delivered_to(&bob.node.user_id()), "message {number}");
    }

    // A reconnect does not replay them: at-most-once on the wire.
    assert_eq!(bob_net.store().message_count().await, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn file_transfer_resumes_at_offset() {
    let world = World::default();
    let alice = Harness::new(&world, 4131);
    let bob = Harness::new(&world, 4132);

    let alice_net = alice.new_private(bob.node.user_id());
    let bob_net = bob.new_private(alice.node.user_id());
    let mut bob_events = bob_net.subscribe();

    alice_net.go_online().await;
    bob_net.go_online().await;
    alice_net
        .begin_make_connection(bob.ep, None)
        .expect("dial");
    settle().await;

    // A 96 KiB file with recognizable content.
    let payload: Vec<u8> = (0..98_304u32).map(|i| (i % 251) as u8).collect();
    let src = alice._tmp.path().join("dataset.bin");
    tokio::fs::write(&src, &payload).await.expect("write source");

    alice_net
        .send_file_attachment(Path::new(&src), None)
        .await
        .expect("offer");

    let event = wait_for_event(&mut bob_events, |e| {
        matches!(e, NetworkEvent::MessageReceived { from, .. } if *from == alice.node.user_id())
    })
    .await;
    let (local_number, item) = match event {
        NetworkEvent::MessageReceived {
            message_number,
            item,
            ..
        } => (message_number, item),
        _ => unreachable!(),
    };
    assert_eq!(item.file_size, Some(payload.len() as u64));

    // Bob already holds the first 40 000 bytes; the pull resumes there.
    let dst = bob._tmp.path().join("dataset.bin");
    tokio::fs::write(&dst, &payload[..40_000])
        .await
        .expect("partial file");

    let total = bob_net
        .receive_file_attachment(local_number, &dst)
        .await
        .expect("transfer");
    assert_eq!(total, payload.len() as u64);

    let received = tokio::fs::read(&dst).await.expect("read result");
    assert_eq!(received, payload);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn peer_exchange_converges_to_full_mesh() {
    init_tracing();
    let world = World::default();
    let a = Harness::new(&world, 4141);
    let b = Harness::new(&world, 4142);
    let c = Harness::new(&world, 4143);

    let net_a = a.new_group("mesh", Some("s"));
    let net_b = b.new_group("mesh", Some("s"));
    let net_c = c.new_group("mesh", Some("s"));

    net_a.go_online().await;
    net_b.go_online().await;
    net_c.go_online().await;

    // A knows only B; C dials B out-of-band.
    net_a.begin_make_connection(b.ep, None).expect("a->b");
    net_c.begin_make_connection(b.ep, None).expect("c->b");

    // B's peer exchange advertises C to A (and A to C); the fabric
    // closes the triangle.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    loop {
        settle().await;
        let full = [&net_a, &net_b, &net_c].iter().all(|n| {
            n.self_peer().connectivity_status() == ConnectivityStatus::FullMeshNetwork
        });
        if full {
            break;
        }
        if tokio::time::Instant::now() > deadline {
            panic!(
                "mesh did not converge: a={:?} b={:?} c={:?}",
                net_a.self_peer().connectivity_status(),
                net_b.self_peer().connectivity_status(),
                net_c.self_peer().connectivity_status()
            );
        }
    }

    // Every node holds sessions to both others.
    for (net, others) in [
        (&net_a, [b.node.user_id(), c.node.user_id()]),
        (&net_b, [a.node.user_id(), c.node.user_id()]),
        (&net_c, [a.node.user_id(), b.node.user_id()]),
    ] {
        for other in others {
            assert!(net.peer(&other).expect("peer").is_online());
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn local_network_only_propagates_by_packet() {
    let world = World::default();
    let alice = Harness::new(&world, 4151);
    let bob = Harness::new(&world, 4152);

    let alice_net = alice.new_private(bob.node.user_id());
    let bob_net = bob.new_private(alice.node.user_id());
    let mut bob_events = bob_net.subscribe();

    alice_net.go_online().await;
    bob_net.go_online().await;
    alice_net
        .begin_make_connection(bob.ep, None)
        .expect("dial");
    settle().await;

    assert!(!bob_net.local_network_only());
    alice_net.set_local_network_only(true).await;

    wait_for_event(&mut bob_events, |e| {
        matches!(e, NetworkEvent::LocalNetworkOnlyChanged { enabled: true })
    })
    .await;
    assert!(bob_net.local_network_only());

    // With the flag set, a public endpoint is never dialled.
    let err = bob_net.begin_make_connection("203.0.113.10:4970".parse().unwrap(), None);
    assert!(err.is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn masked_lookup_drives_invitation_search() {
    let world = World::default();
    let alice = Harness::new(&world, 4161);
    let bob = Harness::new(&world, 4162);

    let alice_net = alice.new_private(bob.node.user_id());
    alice_net.send_text_message("knock knock").await.expect("compose");

    // Publish Bob's masked id in Alice's DHT view; the peer-search timer
    // must find and dial it without an explicit dial call.
    alice
        .dht
        .masked
        .lock()
        .expect("dht lock")
        .insert(*bob.node.user_id().masked().as_bytes(), vec![bob.ep]);

    let invitation = bob.expect_invitation();
    alice_net.go_online().await;

    let bob_net = tokio::time::timeout(Duration::from_secs(10), invitation)
        .await
        .expect("search timeout")
        .expect("invitation accepted");
    assert_eq!(bob_net.other_user_id(), Some(alice.node.user_id()));
}
