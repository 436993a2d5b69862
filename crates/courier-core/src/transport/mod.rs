//! Transport Coordinator
//!
//! Ties presence, the three delivery tiers and inbound dispatch together.
//!
//! ## Send path
//!
//! Tiers are tried in order and the first success wins:
//!
//! ```text
//! send(peer, ciphertext)
//!   │
//!   ├─ presence online? ──▶ TCP direct to each advertised address ──▶ Direct
//!   │
//!   ├─ online or ICE already up? ──▶ ICE (STUN, then TURN) ──────────▶ NatTraversal
//!   │
//!   └─ offline queue on? ──▶ Spillway enqueue(next seq) ─────────────▶ QueuedOffline
//! ```
//!
//! Intermediate tier failures are logged at debug level and never surfaced;
//! the caller only sees the final outcome.
//!
//! ## Receive path
//!
//! TCP handlers, ICE pumps and outbox polling all feed one channel drained
//! by a single dispatcher task, which calls the [`MessageHandler`].

mod dispatcher;
mod message;
mod stats;

pub use dispatcher::{FnHandler, MessageHandler, PeerStateChange};
pub use message::{
    inbound_channel, DeliveryPath, InboundMessage, InboundReceiver, InboundSender,
    INBOUND_CHANNEL_CAPACITY,
};
pub use stats::{StatsSnapshot, TransportStats};

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use futures::future::join_all;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::clock::SharedClock;
use crate::config::TransportConfig;
use crate::dht::{Dht, RecordStore};
use crate::error::{CourierError, CourierResult, ErrorKind};
use crate::ice::{
    IceManager, IceSignaling, TurnClient, TurnIssuer, MAX_ICE_MESSAGE, TURN_REQUEST_MAX_AGE_SECS,
};
use crate::identity::{Fingerprint, Signer, Verifier};
use crate::outbox::Spillway;
use crate::presence::{PeerInfo, PresenceService};
use crate::storage::Storage;
use crate::tasks::BackgroundTasks;
use crate::tcp::{TcpTransport, MAX_FRAME_SIZE};
use dispatcher::{Dispatcher, StateSender};

/// Final result of [`Transport::send`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Acknowledged over a direct TCP connection
    Direct,
    /// Sent over an ICE session
    NatTraversal,
    /// Placed in our outbox for the peer to collect
    QueuedOffline { seq: u64 },
}

/// What one heartbeat pass did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeartbeatSummary {
    pub presence_published: bool,
    pub state_changes: usize,
    pub offline_delivered: usize,
    pub outbox_pruned: usize,
}

/// What one signaling pass did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SignalingSummary {
    pub offers_answered: usize,
    pub turn_issued: usize,
}

/// Services a transport is built on.
pub struct TransportDeps {
    pub dht: Arc<dyn Dht>,
    pub signer: Arc<dyn Signer>,
    pub verifier: Arc<dyn Verifier>,
    pub storage: Storage,
    pub clock: SharedClock,
}

/// One node's delivery stack.
pub struct Transport {
    config: TransportConfig,
    records: RecordStore,
    presence: PresenceService,
    tcp: TcpTransport,
    ice: Option<IceManager>,
    issuer: Mutex<Option<Arc<TurnIssuer>>>,
    spillway: Spillway,
    stats: Arc<TransportStats>,
    tasks: BackgroundTasks,
    dispatcher: Dispatcher,
    state_tx: StateSender,
    peer_states: Mutex<HashMap<Fingerprint, bool>>,
    listen_addr: Mutex<Option<SocketAddr>>,
}

impl Transport {
    /// Build a transport and start its dispatcher.
    ///
    /// Must be called from within a tokio runtime. Nothing touches the
    /// network until [`Transport::start`].
    pub fn new(
        config: TransportConfig,
        deps: TransportDeps,
        handler: Arc<dyn MessageHandler>,
    ) -> CourierResult<Arc<Self>> {
        config.validate()?;

        let TransportDeps {
            dht,
            signer,
            verifier,
            storage,
            clock,
        } = deps;
        let records = RecordStore::new(dht, signer, verifier);
        let stats = Arc::new(TransportStats::default());
        let tasks = BackgroundTasks::new();
        let (inbound_tx, inbound_rx) = inbound_channel();
        let (dispatcher, state_tx) = Dispatcher::spawn(inbound_rx, handler, stats.clone());

        let presence = PresenceService::new(records.clone(), clock.clone(), &config);
        let tcp = TcpTransport::new(&config, clock.clone(), inbound_tx.clone());
        let spillway = Spillway::new(
            records.clone(),
            storage,
            clock.clone(),
            &config,
            inbound_tx.clone(),
            tasks.clone(),
        );

        let ice = config.enable_ice.then(|| {
            let signaling =
                IceSignaling::new(records.clone(), clock.clone(), config.candidate_ttl());
            let turn = (!config.turn_bootstrap.is_empty()).then(|| {
                Arc::new(TurnClient::new(
                    records.clone(),
                    clock.clone(),
                    config.turn_bootstrap.clone(),
                    Duration::from_secs(TURN_REQUEST_MAX_AGE_SECS),
                    config.ice_connect_timeout(),
                ))
            });
            IceManager::new(signaling, &config, turn, inbound_tx.clone(), tasks.clone())
        });

        info!(
            fp = %records.local_fingerprint().short(),
            ice = config.enable_ice,
            offline_queue = config.enable_offline_queue,
            "Transport created"
        );

        Ok(Arc::new(Self {
            config,
            records,
            presence,
            tcp,
            ice,
            issuer: Mutex::new(None),
            spillway,
            stats,
            tasks,
            dispatcher,
            state_tx,
            peer_states: Mutex::new(HashMap::new()),
            listen_addr: Mutex::new(None),
        }))
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Accessors
    // ═══════════════════════════════════════════════════════════════════════

    /// Fingerprint of the local identity
    pub fn local_fingerprint(&self) -> Fingerprint {
        self.records.local_fingerprint()
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn presence(&self) -> &PresenceService {
        &self.presence
    }

    pub fn spillway(&self) -> &Spillway {
        &self.spillway
    }

    pub fn tcp(&self) -> &TcpTransport {
        &self.tcp
    }

    /// The NAT traversal tier, if enabled
    pub fn ice(&self) -> Option<&IceManager> {
        self.ice.as_ref()
    }

    /// Background jobs owned by this transport
    pub fn tasks(&self) -> &BackgroundTasks {
        &self.tasks
    }

    /// Address the TCP listener is bound to
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        *self.listen_addr.lock()
    }

    /// Current counters
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Serve TURN credential requests from this node on every signaling pass.
    pub fn set_turn_issuer(&self, issuer: TurnIssuer) {
        *self.issuer.lock() = Some(Arc::new(issuer));
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Lifecycle
    // ═══════════════════════════════════════════════════════════════════════

    /// Start listening and announce ourselves.
    ///
    /// A DHT failure while announcing is logged; the next heartbeat
    /// retries it.
    pub async fn start(&self) -> CourierResult<SocketAddr> {
        let addr = self.tcp.start_listener(self.config.listen_port).await?;
        *self.listen_addr.lock() = Some(addr);

        if let Err(e) = self.announce().await {
            warn!(error = %e, "Initial presence publish failed");
        }
        if let Err(e) = self.presence.publish_public_key().await {
            warn!(error = %e, "Public key publish failed");
        }
        info!(%addr, fp = %self.local_fingerprint().short(), "Transport started");
        Ok(addr)
    }

    /// Publish a fresh presence record for the running listener.
    pub async fn announce(&self) -> CourierResult<()> {
        let addr = self
            .listen_addr()
            .ok_or_else(|| CourierError::InvalidState("listener is not running".to_string()))?;
        let addresses = if self.config.advertise_addresses.is_empty() {
            vec![guess_local_ip(addr.ip()).to_string()]
        } else {
            self.config.advertise_addresses.clone()
        };
        self.presence.register_presence(&addresses, addr.port()).await
    }

    /// Run [`Transport::heartbeat`] every `heartbeat_interval` and
    /// [`Transport::signaling_pass`] every `signaling_interval` until
    /// shutdown.
    ///
    /// Signaling runs on its own short cadence so that an offerer, which
    /// waits at most `ice_connect_timeout` for an answer, gets one.
    pub fn start_heartbeat(self: &Arc<Self>, contacts: Vec<Fingerprint>) {
        let contacts: Arc<[Fingerprint]> = contacts.into();

        let weak: Weak<Self> = Arc::downgrade(self);
        let period = self.config.heartbeat_interval();
        let heartbeat_contacts = contacts.clone();
        self.tasks.spawn_loop("heartbeat", move |cancel| async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(transport) = weak.upgrade() else {
                    break;
                };
                let summary = transport.heartbeat(&heartbeat_contacts).await;
                debug!(?summary, "Heartbeat");
            }
        });

        let weak: Weak<Self> = Arc::downgrade(self);
        let period = self.config.signaling_interval();
        self.tasks.spawn_loop("signaling", move |cancel| async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(transport) = weak.upgrade() else {
                    break;
                };
                let summary = transport.signaling_pass(&contacts).await;
                if summary != SignalingSummary::default() {
                    debug!(?summary, "Signaling");
                }
            }
        });
    }

    /// One maintenance pass: republish presence, track contact state,
    /// refresh TURN credentials in the background, collect offline
    /// messages and prune our outboxes. Every step is independent;
    /// failures are logged.
    pub async fn heartbeat(&self, contacts: &[Fingerprint]) -> HeartbeatSummary {
        let mut summary = HeartbeatSummary::default();

        match self.announce().await {
            Ok(()) => summary.presence_published = true,
            Err(e) => debug!(error = %e, "Presence republish failed"),
        }
        summary.state_changes = self.refresh_peer_states(contacts).await;

        if let Some(turn) = self.ice.as_ref().and_then(|ice| ice.turn()).cloned() {
            if turn.is_configured() {
                self.tasks.spawn_detached("turn-refresh", async move {
                    turn.refresh().await;
                    Ok(())
                });
            }
        }

        match self.check_offline_messages(contacts).await {
            Ok(n) => summary.offline_delivered = n,
            Err(e) => debug!(error = %e, "Offline poll failed"),
        }
        match self.spillway.maintain().await {
            Ok(n) => summary.outbox_pruned = n,
            Err(e) => debug!(error = %e, "Outbox maintenance failed"),
        }
        self.tcp.pool().prune_idle();
        summary
    }

    /// Answer ICE offers from `contacts` and serve pending TURN requests.
    pub async fn signaling_pass(&self, contacts: &[Fingerprint]) -> SignalingSummary {
        let mut summary = SignalingSummary::default();
        if let Some(ice) = &self.ice {
            summary.offers_answered = ice.answer_offers(contacts).await;
        }

        let issuer = self.issuer.lock().clone();
        if let Some(issuer) = issuer {
            match issuer.process_requests().await {
                Ok(n) => summary.turn_issued = n,
                Err(e) => debug!(error = %e, "TURN request processing failed"),
            }
        }
        summary
    }

    /// Stop every task, close sockets and sessions, then drain the
    /// dispatcher.
    pub async fn shutdown(&self) {
        self.tasks.shutdown().await;
        self.tcp.shutdown().await;
        if let Some(ice) = &self.ice {
            ice.shutdown().await;
        }
        self.dispatcher.stop().await;
        *self.listen_addr.lock() = None;
        info!(fp = %self.local_fingerprint().short(), "Transport shut down");
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Sending
    // ═══════════════════════════════════════════════════════════════════════

    /// Deliver `ciphertext` to `recipient` over the best available tier.
    pub async fn send(&self, recipient: &Fingerprint, ciphertext: Bytes) -> CourierResult<DeliveryOutcome> {
        let me = self.local_fingerprint();
        if ciphertext.is_empty() {
            return Err(CourierError::Param("ciphertext is empty".to_string()));
        }
        if ciphertext.len() > MAX_FRAME_SIZE {
            return Err(CourierError::Param(format!(
                "ciphertext of {} bytes exceeds {}",
                ciphertext.len(),
                MAX_FRAME_SIZE
            )));
        }
        if *recipient == me {
            return Err(CourierError::Param("cannot send to ourselves".to_string()));
        }

        let peer = match self.presence.lookup_by_fingerprint(recipient).await {
            Ok(info) => Some(info),
            Err(e) => {
                debug!(peer = %recipient.short(), error = %e, "No usable presence");
                None
            }
        };
        let online = peer.as_ref().is_some_and(|p| p.is_online);

        if let Some(info) = peer.as_ref().filter(|p| p.is_online) {
            match self.try_direct(info, &ciphertext).await {
                Ok(()) => {
                    self.stats.record_direct();
                    debug!(peer = %recipient.short(), "Delivered directly");
                    return Ok(DeliveryOutcome::Direct);
                }
                Err(e) => debug!(peer = %recipient.short(), error = %e, "Direct delivery failed"),
            }
        }

        if let Some(ice) = &self.ice {
            if ciphertext.len() <= MAX_ICE_MESSAGE && (online || ice.is_connected(recipient)) {
                match self.try_ice(ice, recipient, &ciphertext).await {
                    Ok(()) => {
                        self.stats.record_ice();
                        debug!(peer = %recipient.short(), "Delivered over ICE");
                        return Ok(DeliveryOutcome::NatTraversal);
                    }
                    Err(e) => debug!(peer = %recipient.short(), error = %e, "ICE delivery failed"),
                }
            }
        }

        if !self.spillway.is_enabled() {
            self.stats.record_failure();
            return Err(CourierError::Network(format!(
                "{} is unreachable and offline queueing is disabled",
                recipient.short()
            )));
        }

        let seq = self.spillway.next_seq(recipient).await?;
        let queued = self
            .spillway
            .enqueue(&me, recipient, &ciphertext, seq, self.spillway.default_ttl())
            .await;
        match queued {
            Ok(()) => {}
            // Persisted locally; maintenance republishes it
            Err(e) if e.kind() == ErrorKind::Network => {
                warn!(peer = %recipient.short(), seq, error = %e, "Outbox publish deferred");
            }
            Err(e) => {
                self.stats.record_failure();
                return Err(e);
            }
        }
        self.stats.record_queued();
        debug!(peer = %recipient.short(), seq, "Queued offline");
        Ok(DeliveryOutcome::QueuedOffline { seq })
    }

    async fn try_direct(&self, info: &PeerInfo, ciphertext: &Bytes) -> CourierResult<()> {
        let mut last_error = None;
        for ip in info.ip_addresses() {
            match self
                .tcp
                .send_direct(&ip.to_string(), info.port, ciphertext.clone())
                .await
            {
                Ok(_) => return Ok(()),
                Err(e) => {
                    debug!(%ip, port = info.port, error = %e, "Address unreachable");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| {
            CourierError::NotFound(format!("{} advertises no usable address", info.fingerprint.short()))
        }))
    }

    async fn try_ice(&self, ice: &IceManager, peer: &Fingerprint, data: &[u8]) -> CourierResult<()> {
        if ice.is_connected(peer) {
            match ice.send(peer, data).await {
                Ok(_) => return Ok(()),
                Err(e) => debug!(peer = %peer.short(), error = %e, "Existing ICE session failed"),
            }
        }

        let direct = match ice.connect(*peer, false).await {
            Ok(session) => session.send(data).await.map(|_| ()),
            Err(e) => Err(e),
        };
        match direct {
            Ok(()) => Ok(()),
            Err(e) if ice.has_turn() => {
                debug!(peer = %peer.short(), error = %e, "Retrying ICE through TURN");
                let session = ice.connect(*peer, true).await?;
                session.send(data).await.map(|_| ())
            }
            Err(e) => Err(e),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Receiving and peer state
    // ═══════════════════════════════════════════════════════════════════════

    /// Collect messages `contacts` queued for us while we were away.
    pub async fn check_offline_messages(&self, contacts: &[Fingerprint]) -> CourierResult<usize> {
        self.spillway
            .check_offline_messages(&self.local_fingerprint(), contacts)
            .await
    }

    /// Whether `peer` has a fresh presence record.
    ///
    /// A peer with no record is offline; a DHT failure is an error.
    pub async fn is_peer_online(&self, peer: &Fingerprint) -> CourierResult<bool> {
        match self.presence.lookup_by_fingerprint(peer).await {
            Ok(info) => Ok(info.is_online),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Re-check every contact and report online/offline transitions to the
    /// handler. Contacts whose lookup fails keep their last known state.
    /// Returns the number of transitions.
    pub async fn refresh_peer_states(&self, contacts: &[Fingerprint]) -> usize {
        let lookups = join_all(contacts.iter().map(|c| self.is_peer_online(c))).await;

        let mut changes = Vec::new();
        {
            let mut states = self.peer_states.lock();
            for (peer, result) in contacts.iter().zip(lookups) {
                let online = match result {
                    Ok(online) => online,
                    Err(e) => {
                        debug!(peer = %peer.short(), error = %e, "Presence check failed");
                        continue;
                    }
                };
                let previous = states.insert(*peer, online).unwrap_or(false);
                if previous != online {
                    changes.push(PeerStateChange { peer: *peer, online });
                }
            }
        }

        for change in &changes {
            info!(peer = %change.peer.short(), online = change.online, "Peer state changed");
            if self.state_tx.send(*change).is_err() {
                debug!("Dispatcher gone, dropping state change");
            }
        }
        changes.len()
    }

    /// Last known online flag for `peer` from [`Transport::refresh_peer_states`]
    pub fn known_state(&self, peer: &Fingerprint) -> Option<bool> {
        self.peer_states.lock().get(peer).copied()
    }
}

/// Best guess at the address peers can reach us on.
///
/// A concrete bind address is used as is. For a wildcard bind, the source
/// address of a route to a public IP is used (no packet is sent), falling
/// back to loopback.
fn guess_local_ip(bound: IpAddr) -> IpAddr {
    if !bound.is_unspecified() {
        return bound;
    }
    UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        .and_then(|socket| {
            socket.connect((Ipv4Addr::new(192, 0, 2, 1), 9))?;
            socket.local_addr()
        })
        .map(|addr| addr.ip())
        .ok()
        .filter(|ip| !ip.is_unspecified())
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}
