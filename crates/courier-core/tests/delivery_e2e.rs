//! End-to-End Delivery Tests
//!
//! Whole transports sharing one in-memory DHT and talking over loopback TCP.
//!
//! ## What These Tests Verify
//!
//! - Direct delivery to a peer with fresh presence
//! - Fallback to the offline outbox, collection, watermark and pruning
//! - Presence freshness against a simulated clock
//! - The 10 MiB frame boundary on a real socket

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use courier_core::dht::DhtKey;
use courier_core::tcp::MAX_FRAME_SIZE;
use courier_core::transport::inbound_channel;
use courier_core::{
    DeliveryOutcome, DeliveryPath, DilithiumIdentity, DilithiumVerifier, ErrorKind, InboundMessage,
    ManualClock, MemoryDht, MessageHandler, Signer, Storage, TcpTransport, Transport,
    TransportConfig, TransportDeps,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

// ============================================================================
// Test Utilities
// ============================================================================

struct Collect(mpsc::UnboundedSender<InboundMessage>);

impl MessageHandler for Collect {
    fn on_message(&self, message: InboundMessage) {
        let _ = self.0.send(message);
    }
}

struct Node {
    identity: Arc<DilithiumIdentity>,
    transport: Arc<Transport>,
    inbox: mpsc::UnboundedReceiver<InboundMessage>,
}

impl Node {
    async fn next_message(&mut self) -> InboundMessage {
        tokio::time::timeout(Duration::from_secs(5), self.inbox.recv())
            .await
            .expect("delivery within 5s")
            .expect("dispatcher running")
    }
}

struct Network {
    dht: Arc<MemoryDht>,
    clock: ManualClock,
}

impl Network {
    fn new() -> Self {
        let clock = ManualClock::new(1_700_000_000);
        Self {
            dht: Arc::new(MemoryDht::new(Arc::new(clock.clone()))),
            clock,
        }
    }

    fn node(&self) -> Node {
        let identity = Arc::new(DilithiumIdentity::generate());
        let (tx, inbox) = mpsc::unbounded_channel();
        let config = TransportConfig {
            listen_port: 0,
            enable_ice: false,
            advertise_addresses: vec!["127.0.0.1".to_string()],
            ..Default::default()
        };
        let transport = Transport::new(
            config,
            TransportDeps {
                dht: self.dht.clone(),
                signer: identity.clone(),
                verifier: Arc::new(DilithiumVerifier),
                storage: Storage::in_memory().unwrap(),
                clock: Arc::new(self.clock.clone()),
            },
            Arc::new(Collect(tx)),
        )
        .unwrap();
        Node {
            identity,
            transport,
            inbox,
        }
    }
}

// ============================================================================
// Delivery
// ============================================================================

#[tokio::test]
async fn test_direct_delivery_between_online_peers() {
    let net = Network::new();
    let alice = net.node();
    let mut bob = net.node();
    alice.transport.start().await.unwrap();
    bob.transport.start().await.unwrap();

    let message = Bytes::from_static(b"\x00\x01ciphertext\xff");
    let outcome = alice
        .transport
        .send(&bob.transport.local_fingerprint(), message.clone())
        .await
        .unwrap();
    assert_eq!(outcome, DeliveryOutcome::Direct);

    let got = bob.next_message().await;
    assert_eq!(got.ciphertext, message);
    assert_eq!(got.via, DeliveryPath::Tcp);
    // Anonymous at this layer
    assert!(got.sender_fingerprint.is_none());

    alice.transport.shutdown().await;
    bob.transport.shutdown().await;
}

#[tokio::test]
async fn test_offline_delivery_watermark_and_prune() {
    let net = Network::new();
    let alice = net.node();
    let mut bob = net.node();
    let alice_fp = alice.transport.local_fingerprint();
    let bob_fp = bob.transport.local_fingerprint();

    // Bob was seen once, long enough ago to count as offline
    bob.transport.start().await.unwrap();
    net.clock.advance(601);

    let outcome = alice
        .transport
        .send(&bob_fp, Bytes::from_static(b"M"))
        .await
        .unwrap();
    assert_eq!(outcome, DeliveryOutcome::QueuedOffline { seq: 1 });
    assert_eq!(alice.transport.spillway().pending(&bob_fp).unwrap().len(), 1);

    let collected = bob.transport.check_offline_messages(&[alice_fp]).await.unwrap();
    assert_eq!(collected, 1);
    let got = bob.next_message().await;
    assert_eq!(got.ciphertext, Bytes::from_static(b"M"));
    assert_eq!(got.seq_num, Some(1));
    assert_eq!(got.sender_fingerprint, Some(alice_fp));
    assert_eq!(got.peer_pubkey.as_deref(), Some(alice.identity.public_key().as_slice()));

    bob.transport.tasks().wait_idle().await;
    assert_eq!(
        alice.transport.spillway().fetch_watermark(&bob_fp).await.unwrap(),
        1
    );

    assert_eq!(alice.transport.spillway().maintain().await.unwrap(), 1);
    assert!(alice.transport.spillway().pending(&bob_fp).unwrap().is_empty());

    // Nothing left to collect
    assert_eq!(bob.transport.check_offline_messages(&[alice_fp]).await.unwrap(), 0);

    alice.transport.shutdown().await;
    bob.transport.shutdown().await;
    assert_eq!(bob.transport.stats().received_offline, 1);
}

#[tokio::test]
async fn test_offline_sequence_continues_per_recipient() {
    let net = Network::new();
    let alice = net.node();
    let bob = net.node();
    let carol = net.node();
    let bob_fp = bob.transport.local_fingerprint();
    let carol_fp = carol.transport.local_fingerprint();

    let mut seqs = Vec::new();
    for (peer, body) in [(bob_fp, "b1"), (carol_fp, "c1"), (bob_fp, "b2"), (bob_fp, "b3")] {
        match alice.transport.send(&peer, Bytes::from(body)).await.unwrap() {
            DeliveryOutcome::QueuedOffline { seq } => seqs.push((peer, seq)),
            other => panic!("expected queueing, got {:?}", other),
        }
    }
    assert_eq!(
        seqs,
        vec![(bob_fp, 1), (carol_fp, 1), (bob_fp, 2), (bob_fp, 3)]
    );
}

#[tokio::test]
async fn test_partial_outbox_failure_still_delivers_rest() {
    let net = Network::new();
    let alice = net.node();
    let carol = net.node();
    let mut bob = net.node();
    let alice_fp = alice.transport.local_fingerprint();
    let carol_fp = carol.transport.local_fingerprint();
    let bob_fp = bob.transport.local_fingerprint();

    alice.transport.send(&bob_fp, Bytes::from_static(b"from alice")).await.unwrap();
    carol.transport.send(&bob_fp, Bytes::from_static(b"from carol")).await.unwrap();
    net.dht.fail_key(DhtKey::outbox(&carol_fp, &bob_fp));

    let collected = bob
        .transport
        .check_offline_messages(&[alice_fp, carol_fp])
        .await
        .unwrap();
    assert_eq!(collected, 1);
    assert_eq!(bob.next_message().await.ciphertext, Bytes::from_static(b"from alice"));

    net.dht.heal_key(&DhtKey::outbox(&carol_fp, &bob_fp));
    assert_eq!(
        bob.transport
            .check_offline_messages(&[alice_fp, carol_fp])
            .await
            .unwrap(),
        1
    );
    assert_eq!(bob.next_message().await.ciphertext, Bytes::from_static(b"from carol"));
}

// ============================================================================
// Presence
// ============================================================================

#[tokio::test]
async fn test_presence_freshness_window() {
    let net = Network::new();
    let alice = net.node();
    let bob = net.node();
    bob.transport.start().await.unwrap();

    let bob_pubkey = bob.identity.public_key();
    let info = alice.transport.presence().lookup_peer(&bob_pubkey).await.unwrap();
    assert!(info.is_online);
    assert_eq!(info.addresses, vec!["127.0.0.1".to_string()]);

    // Past the freshness window; the record itself is still within its TTL
    net.clock.advance(601);
    let info = alice.transport.presence().lookup_peer(&bob_pubkey).await.unwrap();
    assert!(!info.is_online);

    // A republish brings the peer back
    bob.transport.announce().await.unwrap();
    assert!(alice.transport.is_peer_online(&bob.transport.local_fingerprint()).await.unwrap());

    bob.transport.shutdown().await;
}

#[tokio::test]
async fn test_unknown_peer_is_not_found_not_network() {
    let net = Network::new();
    let alice = net.node();
    let stranger = DilithiumIdentity::generate();

    let err = alice
        .transport
        .presence()
        .lookup_peer(&stranger.public_key())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    net.dht.set_online(false);
    let err = alice
        .transport
        .presence()
        .lookup_peer(&stranger.public_key())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Network);
}

// ============================================================================
// Frame boundary
// ============================================================================

#[tokio::test]
async fn test_max_frame_accepted_intact() {
    let (tx, mut rx) = inbound_channel();
    let config = TransportConfig {
        ack_timeout_ms: 10_000,
        ..Default::default()
    };
    let server = TcpTransport::new(&config, courier_core::system_clock(), tx);
    let addr = server.start_listener(0).await.unwrap();

    let (client_tx, _client_rx) = inbound_channel();
    let client = TcpTransport::new(&config, courier_core::system_clock(), client_tx);

    let payload: Bytes = (0..MAX_FRAME_SIZE).map(|i| (i % 251) as u8).collect::<Vec<_>>().into();
    client
        .send_direct("127.0.0.1", addr.port(), payload.clone())
        .await
        .unwrap();

    let got = rx.recv().await.unwrap();
    assert_eq!(got.ciphertext.len(), MAX_FRAME_SIZE);
    assert_eq!(got.ciphertext, payload);
    server.stop_listener().await;
}

#[tokio::test]
async fn test_oversized_frame_closes_connection() {
    let (tx, mut rx) = inbound_channel();
    let server = TcpTransport::new(&TransportConfig::default(), courier_core::system_clock(), tx);
    let addr = server.start_listener(0).await.unwrap();

    let mut stream = TcpStream::connect(("127.0.0.1", addr.port())).await.unwrap();
    stream
        .write_all(&((MAX_FRAME_SIZE as u32) + 1).to_be_bytes())
        .await
        .unwrap();

    let mut ack = [0u8; 1];
    let read = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut ack))
        .await
        .expect("server reacts to the header alone");
    assert_eq!(read.unwrap_or(0), 0, "no ack, connection closed");
    assert!(rx.try_recv().is_err());

    // The listener keeps serving other connections
    let (client_tx, _client_rx) = inbound_channel();
    let client = TcpTransport::new(&TransportConfig::default(), courier_core::system_clock(), client_tx);
    client
        .send_direct("127.0.0.1", addr.port(), Bytes::from_static(b"still fine"))
        .await
        .unwrap();
    assert_eq!(rx.recv().await.unwrap().ciphertext, Bytes::from_static(b"still fine"));
    server.stop_listener().await;
}
