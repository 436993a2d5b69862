//! Per-peer ICE session management
//!
//! Holds at most one session per peer. Outgoing handshakes run inline in
//! [`IceManager::connect`]; incoming offers are discovered by polling
//! contacts in [`IceManager::answer_offers`] and completed in the
//! background. The transport polls on the signaling cadence, well inside
//! the offerer's answer wait. Every connected session gets a pump that
//! moves its inbound queue into the transport's dispatcher.
//!
//! Answered session ids are remembered only while their offer could still
//! be fetched, so the set stays bounded by the candidate TTL.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

use super::candidates::{IceSignaling, SetKind};
use super::session::{IceRole, IceSession, IceState};
use super::turn::TurnClient;
use crate::config::TransportConfig;
use crate::error::{CourierError, CourierResult};
use crate::identity::Fingerprint;
use crate::tasks::BackgroundTasks;
use crate::transport::{InboundMessage, InboundSender};

/// How often the offerer polls for an answer
const ANSWER_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Bound on each blocking wait of a session pump
const PUMP_POLL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone)]
struct IceSettings {
    stun_server: String,
    stun_port: u16,
    gather_timeout: Duration,
    connect_timeout: Duration,
    include_loopback: bool,
}

/// Owns every ICE session of one transport instance.
#[derive(Clone)]
pub struct IceManager {
    signaling: IceSignaling,
    settings: IceSettings,
    turn: Option<Arc<TurnClient>>,
    sessions: Arc<Mutex<HashMap<Fingerprint, Arc<IceSession>>>>,
    /// Session id to the offer's creation time
    answered: Arc<Mutex<HashMap<String, u64>>>,
    inbound: InboundSender,
    tasks: BackgroundTasks,
}

impl IceManager {
    /// Create a manager delivering inbound datagrams to `inbound`.
    pub fn new(
        signaling: IceSignaling,
        config: &TransportConfig,
        turn: Option<Arc<TurnClient>>,
        inbound: InboundSender,
        tasks: BackgroundTasks,
    ) -> Self {
        Self {
            signaling,
            settings: IceSettings {
                stun_server: config.stun_server.clone(),
                stun_port: config.stun_port,
                gather_timeout: config.ice_gather_timeout(),
                connect_timeout: config.ice_connect_timeout(),
                include_loopback: config.ice_include_loopback,
            },
            turn,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            answered: Arc::new(Mutex::new(HashMap::new())),
            inbound,
            tasks,
        }
    }

    /// Whether a TURN issuer is configured
    pub fn has_turn(&self) -> bool {
        self.turn.as_ref().is_some_and(|t| t.is_configured())
    }

    /// The TURN client, if configured
    pub fn turn(&self) -> Option<&Arc<TurnClient>> {
        self.turn.as_ref()
    }

    /// Current session with `peer`, in whatever state.
    pub fn session(&self, peer: &Fingerprint) -> Option<Arc<IceSession>> {
        self.sessions.lock().get(peer).cloned()
    }

    /// Whether a connected session with `peer` exists.
    pub fn is_connected(&self, peer: &Fingerprint) -> bool {
        self.session(peer).is_some_and(|s| s.is_connected())
    }

    /// Number of sessions held
    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Send over an existing connected session.
    pub async fn send(&self, peer: &Fingerprint, data: &[u8]) -> CourierResult<usize> {
        match self.session(peer) {
            Some(session) if session.is_connected() => session.send(data).await,
            _ => Err(CourierError::NotFound(format!(
                "no connected ICE session with {}",
                peer.short()
            ))),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Offering
    // ═══════════════════════════════════════════════════════════════════════

    /// Negotiate a session with `peer` as the controlling side, reusing a
    /// connected one if present.
    pub async fn connect(&self, peer: Fingerprint, use_turn: bool) -> CourierResult<Arc<IceSession>> {
        if let Some(existing) = self.session(&peer) {
            if existing.is_connected() {
                return Ok(existing);
            }
        }

        let mut session = IceSession::new(peer, IceRole::Controlling, None)
            .with_loopback(self.settings.include_loopback);
        if use_turn {
            let turn = self
                .turn
                .as_ref()
                .ok_or_else(|| CourierError::NotFound("TURN is not configured".to_string()))?;
            session = session.with_turn(turn.credential().await?);
        }
        let session = Arc::new(session);
        self.install(session.clone()).await;

        match self.offer(&session).await {
            Ok(()) => {
                self.spawn_pump(session.clone());
                Ok(session)
            }
            Err(e) => {
                debug!(peer = %peer.short(), turn = use_turn, error = %e, "ICE handshake failed");
                self.discard(&session).await;
                Err(e)
            }
        }
    }

    async fn offer(&self, session: &IceSession) -> CourierResult<()> {
        session
            .gather_candidates(
                &self.settings.stun_server,
                self.settings.stun_port,
                self.settings.gather_timeout,
            )
            .await?;
        session.publish_to_dht(&self.signaling).await?;
        self.await_answer(session).await?;
        session.connect(self.settings.connect_timeout).await
    }

    async fn await_answer(&self, session: &IceSession) -> CourierResult<()> {
        let deadline = Instant::now() + self.settings.connect_timeout;
        loop {
            match session.fetch_from_dht(&self.signaling).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
            if Instant::now() + ANSWER_POLL_INTERVAL > deadline {
                return Err(CourierError::Timeout(format!(
                    "no ICE answer from {}",
                    session.peer().short()
                )));
            }
            tokio::time::sleep(ANSWER_POLL_INTERVAL).await;
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Answering
    // ═══════════════════════════════════════════════════════════════════════

    /// Answer fresh offers that `contacts` published for us.
    ///
    /// Connectivity checks for answered offers continue in the background.
    /// Returns the number of offers answered.
    pub async fn answer_offers(&self, contacts: &[Fingerprint]) -> usize {
        self.forget_expired_answers();
        let attempts = contacts.iter().map(|peer| self.answer_one(*peer));
        join_all(attempts)
            .await
            .into_iter()
            .filter(|answered| *answered)
            .count()
    }

    async fn answer_one(&self, peer: Fingerprint) -> bool {
        let offer = match self.signaling.fetch(&peer, SetKind::Offer, None).await {
            Ok(offer) => offer,
            Err(e) => {
                if !e.is_not_found() {
                    debug!(peer = %peer.short(), error = %e, "Offer lookup failed");
                }
                return false;
            }
        };
        if self.answered.lock().contains_key(&offer.session_id) {
            return false;
        }
        if let Some(existing) = self.session(&peer) {
            if existing.is_connected() {
                return false;
            }
            // Both sides offered at once: the lower fingerprint keeps its offer.
            let handshaking = existing.role() == IceRole::Controlling
                && matches!(
                    existing.state(),
                    IceState::Gathering | IceState::CandidatesReady | IceState::Connecting
                );
            if handshaking && self.signaling.local_fingerprint() < peer {
                return false;
            }
        }
        let created_at = offer.created_at.min(self.signaling.now_secs());
        self.answered.lock().insert(offer.session_id.clone(), created_at);

        let session = Arc::new(
            IceSession::new(peer, IceRole::Controlled, Some(offer.session_id.clone()))
                .with_loopback(self.settings.include_loopback),
        );
        let prepared = async {
            session.set_remote(&offer)?;
            session
                .gather_candidates(
                    &self.settings.stun_server,
                    self.settings.stun_port,
                    self.settings.gather_timeout,
                )
                .await?;
            session.publish_to_dht(&self.signaling).await
        };
        if let Err(e) = prepared.await {
            debug!(peer = %peer.short(), error = %e, "Could not answer ICE offer");
            session.free().await;
            return false;
        }

        self.install(session.clone()).await;
        let manager = self.clone();
        let timeout = self.settings.connect_timeout;
        self.tasks.spawn_detached("ice-accept", async move {
            match session.connect(timeout).await {
                Ok(()) => {
                    manager.spawn_pump(session);
                    Ok(())
                }
                Err(e) => {
                    manager.discard(&session).await;
                    Err(e)
                }
            }
        });
        info!(peer = %peer.short(), "Answered ICE offer");
        true
    }

    /// Drop ids of offers that have outlived the candidate TTL; fetch no
    /// longer returns them, so they cannot be answered twice.
    fn forget_expired_answers(&self) {
        let now = self.signaling.now_secs();
        let ttl = self.signaling.ttl().as_secs();
        self.answered
            .lock()
            .retain(|_, created_at| now.saturating_sub(*created_at) < ttl);
    }

    /// Number of answered offers still remembered
    pub fn answered_count(&self) -> usize {
        self.answered.lock().len()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Session table
    // ═══════════════════════════════════════════════════════════════════════

    /// Make `session` the only session for its peer, freeing any previous one.
    async fn install(&self, session: Arc<IceSession>) {
        let previous = self.sessions.lock().insert(session.peer(), session);
        if let Some(previous) = previous {
            previous.free().await;
        }
    }

    /// Remove `session` if it is still the current one for its peer, then free it.
    async fn discard(&self, session: &Arc<IceSession>) {
        {
            let mut sessions = self.sessions.lock();
            if sessions
                .get(&session.peer())
                .is_some_and(|current| Arc::ptr_eq(current, session))
            {
                sessions.remove(&session.peer());
            }
        }
        session.free().await;
    }

    /// Tear down the session with `peer`, if any.
    pub async fn close(&self, peer: &Fingerprint) {
        let session = self.sessions.lock().remove(peer);
        if let Some(session) = session {
            session.free().await;
        }
    }

    /// Tear down every session.
    pub async fn shutdown(&self) {
        let sessions: Vec<_> = self.sessions.lock().drain().map(|(_, s)| s).collect();
        for session in sessions {
            session.free().await;
        }
    }

    fn spawn_pump(&self, session: Arc<IceSession>) {
        let inbound = self.inbound.clone();
        self.tasks.spawn_loop("ice-pump", move |cancel| async move {
            let peer = session.peer();
            while !cancel.is_cancelled() {
                let waiting = session.clone();
                let next =
                    match tokio::task::spawn_blocking(move || waiting.recv_timeout(Some(PUMP_POLL)))
                        .await
                    {
                        Ok(next) => next,
                        Err(_) => break,
                    };
                match next {
                    Some(payload) => {
                        if inbound.send(InboundMessage::from_ice(peer, payload)).await.is_err() {
                            break;
                        }
                    }
                    None if !session.is_connected() && session.queue().is_empty() => break,
                    None => {}
                }
            }
            debug!(peer = %peer.short(), "ICE pump stopped");
        });
    }
}
