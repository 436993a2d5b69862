//! ICE session: one NAT-traversal attempt with one peer.
//!
//! ```text
//! NEW ──▶ GATHERING ──▶ CANDIDATES_READY ──▶ CONNECTING ──▶ CONNECTED
//!              │                                  │
//!              └──────────▶ FAILED ◀──────────────┘
//!
//! any state ──shutdown()──▶ CLOSED
//! ```
//!
//! No transition skips a state. Once connected, a reader task copies every
//! datagram into the session's bounded [`InboundQueue`], which consumers
//! drain with [`IceSession::recv_timeout`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use webrtc_ice::agent::agent_config::AgentConfig;
use webrtc_ice::agent::Agent;
use webrtc_ice::candidate::candidate_base::unmarshal_candidate;
use webrtc_ice::candidate::Candidate;
use webrtc_ice::network_type::NetworkType;
use webrtc_ice::state::ConnectionState;
use webrtc_ice::url::Url;
use webrtc_util::Conn;

use super::candidates::{CandidateSet, IceSignaling, SetKind, MAX_CANDIDATES, MAX_CANDIDATE_LEN};
use super::queue::InboundQueue;
use super::turn::TurnCredential;
use super::MAX_ICE_MESSAGE;
use crate::error::{CourierError, CourierResult};
use crate::identity::Fingerprint;

/// Receive buffer; one datagram never exceeds this.
const RECV_BUFFER_SIZE: usize = 65_536;

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IceState {
    /// Created, nothing done yet
    New,
    /// STUN binding in progress
    Gathering,
    /// Local candidates known, ready to exchange
    CandidatesReady,
    /// Connectivity checks running
    Connecting,
    /// A path was selected; `send` is allowed
    Connected,
    /// Gathering or connecting failed
    Failed,
    /// Shut down
    Closed,
}

/// Which side drives the connectivity checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceRole {
    /// Offerer; dials
    Controlling,
    /// Answerer; accepts
    Controlled,
}

#[derive(Debug, Clone)]
struct Credentials {
    ufrag: String,
    pwd: String,
    candidates: Vec<String>,
}

/// One NAT-traversal session with one peer.
pub struct IceSession {
    peer: Fingerprint,
    role: IceRole,
    session_id: String,
    turn: Option<TurnCredential>,
    include_loopback: bool,
    state: Mutex<IceState>,
    agent: Mutex<Option<Arc<Agent>>>,
    local: Mutex<Option<Credentials>>,
    remote: Mutex<Option<Credentials>>,
    conn: Mutex<Option<Arc<dyn Conn + Send + Sync>>>,
    cancel_tx: Mutex<Option<mpsc::Sender<()>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    link_lost: Arc<AtomicBool>,
    queue: Arc<InboundQueue>,
}

impl IceSession {
    /// Create a session in [`IceState::New`].
    ///
    /// The controlling side picks a fresh session id; the controlled side
    /// adopts the id of the offer it answers.
    pub fn new(peer: Fingerprint, role: IceRole, session_id: Option<String>) -> Self {
        Self {
            peer,
            role,
            session_id: session_id.unwrap_or_else(|| hex::encode(rand::random::<[u8; 12]>())),
            turn: None,
            include_loopback: false,
            state: Mutex::new(IceState::New),
            agent: Mutex::new(None),
            local: Mutex::new(None),
            remote: Mutex::new(None),
            conn: Mutex::new(None),
            cancel_tx: Mutex::new(None),
            reader: Mutex::new(None),
            link_lost: Arc::new(AtomicBool::new(false)),
            queue: Arc::new(InboundQueue::default()),
        }
    }

    /// Relay through TURN using `credential` in addition to STUN.
    pub fn with_turn(mut self, credential: TurnCredential) -> Self {
        self.turn = Some(credential);
        self
    }

    /// Also gather loopback host candidates, for peers on the same host.
    pub fn with_loopback(mut self, include: bool) -> Self {
        self.include_loopback = include;
        self
    }

    /// Peer this session talks to
    pub fn peer(&self) -> Fingerprint {
        self.peer
    }

    /// Handshake identifier
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Controlling or controlled
    pub fn role(&self) -> IceRole {
        self.role
    }

    /// Whether this session relays through TURN
    pub fn uses_turn(&self) -> bool {
        self.turn.is_some()
    }

    /// Current state
    pub fn state(&self) -> IceState {
        *self.state.lock()
    }

    /// Connected and the path has not dropped since.
    pub fn is_connected(&self) -> bool {
        self.state() == IceState::Connected && !self.link_lost.load(Ordering::SeqCst)
    }

    /// The inbound queue
    pub fn queue(&self) -> &Arc<InboundQueue> {
        &self.queue
    }

    fn transition(&self, from: IceState, to: IceState) -> CourierResult<()> {
        let mut state = self.state.lock();
        if *state != from {
            return Err(CourierError::InvalidState(format!(
                "expected {:?} to enter {:?}, session is {:?}",
                from, to, *state
            )));
        }
        *state = to;
        Ok(())
    }

    fn fail(&self, from: IceState) {
        let mut state = self.state.lock();
        if *state == from {
            *state = IceState::Failed;
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Gathering
    // ═══════════════════════════════════════════════════════════════════════

    /// Discover host and server-reflexive (and relay, with TURN) candidates.
    ///
    /// Bounded by `timeout`. Succeeds if at least one candidate was found
    /// by the time gathering completes or the bound elapses.
    pub async fn gather_candidates(
        &self,
        stun_server: &str,
        stun_port: u16,
        timeout: Duration,
    ) -> CourierResult<()> {
        if stun_server.trim().is_empty() || stun_port == 0 {
            return Err(CourierError::Param("STUN server host/port required".to_string()));
        }
        self.transition(IceState::New, IceState::Gathering)?;

        match self.run_gathering(stun_server, stun_port, timeout).await {
            Ok(credentials) => {
                debug!(
                    peer = %self.peer.short(),
                    candidates = credentials.candidates.len(),
                    "Gathered candidates"
                );
                *self.local.lock() = Some(credentials);
                self.transition(IceState::Gathering, IceState::CandidatesReady)
            }
            Err(e) => {
                self.fail(IceState::Gathering);
                Err(e)
            }
        }
    }

    async fn run_gathering(
        &self,
        stun_server: &str,
        stun_port: u16,
        timeout: Duration,
    ) -> CourierResult<Credentials> {
        let mut urls = vec![Url::parse_url(&format!("stun:{}:{}", stun_server, stun_port))
            .map_err(|e| CourierError::Param(format!("bad STUN server: {}", e)))?];
        if let Some(turn) = &self.turn {
            let mut url = Url::parse_url(&turn.url())
                .map_err(|e| CourierError::Param(format!("bad TURN server: {}", e)))?;
            url.username = turn.username.clone();
            url.password = turn.password.clone();
            urls.push(url);
        }

        let config = AgentConfig {
            urls,
            network_types: vec![NetworkType::Udp4, NetworkType::Udp6],
            is_controlling: self.role == IceRole::Controlling,
            include_loopback: self.include_loopback,
            ..Default::default()
        };
        let agent = Arc::new(
            Agent::new(config)
                .await
                .map_err(|e| CourierError::Network(format!("ICE agent: {}", e)))?,
        );

        let (candidate_tx, mut candidate_rx) = mpsc::unbounded_channel::<Option<String>>();
        agent.on_candidate(Box::new(move |c: Option<Arc<dyn Candidate + Send + Sync>>| {
            let _ = candidate_tx.send(c.map(|c| c.marshal()));
            Box::pin(async {})
        }));

        let link_lost = self.link_lost.clone();
        let peer = self.peer;
        agent.on_connection_state_change(Box::new(move |state: ConnectionState| {
            if matches!(
                state,
                ConnectionState::Failed | ConnectionState::Disconnected | ConnectionState::Closed
            ) {
                debug!(peer = %peer.short(), ?state, "ICE path lost");
                link_lost.store(true, Ordering::SeqCst);
            }
            Box::pin(async {})
        }));

        *self.agent.lock() = Some(agent.clone());

        agent
            .gather_candidates()
            .map_err(|e| CourierError::Network(format!("gather: {}", e)))?;

        let mut candidates = Vec::new();
        let collect = async {
            while let Some(Some(candidate)) = candidate_rx.recv().await {
                if candidate.len() <= MAX_CANDIDATE_LEN && candidates.len() < MAX_CANDIDATES {
                    candidates.push(candidate);
                }
            }
        };
        let timed_out = tokio::time::timeout(timeout, collect).await.is_err();
        if timed_out {
            debug!(peer = %self.peer.short(), found = candidates.len(), "Gathering bound elapsed");
        }
        if candidates.is_empty() {
            return Err(CourierError::Timeout(
                "no ICE candidates gathered".to_string(),
            ));
        }

        let (ufrag, pwd) = agent.get_local_user_credentials().await;
        Ok(Credentials {
            ufrag,
            pwd,
            candidates,
        })
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Signaling
    // ═══════════════════════════════════════════════════════════════════════

    /// Local candidate set for publication, once gathered.
    pub fn local_candidates(&self, from: Fingerprint, created_at: u64) -> CourierResult<CandidateSet> {
        let local = self.local.lock().clone().ok_or_else(|| {
            CourierError::InvalidState("candidates have not been gathered".to_string())
        })?;
        Ok(CandidateSet {
            session_id: self.session_id.clone(),
            kind: match self.role {
                IceRole::Controlling => SetKind::Offer,
                IceRole::Controlled => SetKind::Answer,
            },
            from,
            target: self.peer,
            ufrag: local.ufrag,
            pwd: local.pwd,
            candidates: local.candidates,
            created_at,
        })
    }

    /// Publish the local candidate set for the peer.
    pub async fn publish_to_dht(&self, signaling: &IceSignaling) -> CourierResult<()> {
        let set = self.local_candidates(signaling.local_fingerprint(), signaling.now_secs())?;
        signaling.publish(&set).await
    }

    /// Fetch the peer's matching candidate set: the answer to our offer
    /// when controlling, the newest offer when controlled.
    pub async fn fetch_from_dht(&self, signaling: &IceSignaling) -> CourierResult<()> {
        let set = match self.role {
            IceRole::Controlling => {
                signaling
                    .fetch(&self.peer, SetKind::Answer, Some(&self.session_id))
                    .await?
            }
            IceRole::Controlled => {
                signaling
                    .fetch(&self.peer, SetKind::Offer, Some(&self.session_id))
                    .await?
            }
        };
        self.set_remote(&set)
    }

    /// Install the peer's candidate set directly.
    pub fn set_remote(&self, set: &CandidateSet) -> CourierResult<()> {
        set.validate()?;
        if set.from != self.peer || set.session_id != self.session_id {
            return Err(CourierError::Param(
                "candidate set belongs to another session".to_string(),
            ));
        }
        *self.remote.lock() = Some(Credentials {
            ufrag: set.ufrag.clone(),
            pwd: set.pwd.clone(),
            candidates: set.candidates.clone(),
        });
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Connectivity
    // ═══════════════════════════════════════════════════════════════════════

    /// Add the remote candidates, run connectivity checks and wait up to
    /// `timeout` for a selected path.
    pub async fn connect(&self, timeout: Duration) -> CourierResult<()> {
        let remote = self.remote.lock().clone().ok_or_else(|| {
            CourierError::InvalidState("no remote candidates fetched".to_string())
        })?;
        let agent = self
            .agent
            .lock()
            .clone()
            .ok_or_else(|| CourierError::InvalidState("no ICE agent".to_string()))?;
        self.transition(IceState::CandidatesReady, IceState::Connecting)?;

        let mut added = 0;
        for raw in &remote.candidates {
            match unmarshal_candidate(raw) {
                Ok(candidate) => {
                    let candidate: Arc<dyn Candidate + Send + Sync> = Arc::new(candidate);
                    match agent.add_remote_candidate(&candidate) {
                        Ok(()) => added += 1,
                        Err(e) => debug!(error = %e, "Remote candidate rejected by agent"),
                    }
                }
                Err(e) => debug!(error = %e, "Discarding unparseable remote candidate"),
            }
        }
        if added == 0 {
            self.fail(IceState::Connecting);
            return Err(CourierError::Protocol(
                "no usable remote candidates".to_string(),
            ));
        }

        let (cancel_tx, cancel_rx) = mpsc::channel(1);
        *self.cancel_tx.lock() = Some(cancel_tx);

        let role = self.role;
        let attempt = async move {
            match role {
                IceRole::Controlling => agent
                    .dial(cancel_rx, remote.ufrag, remote.pwd)
                    .await
                    .map(|c| c as Arc<dyn Conn + Send + Sync>),
                IceRole::Controlled => agent
                    .accept(cancel_rx, remote.ufrag, remote.pwd)
                    .await
                    .map(|c| c as Arc<dyn Conn + Send + Sync>),
            }
        };

        let conn: Arc<dyn Conn + Send + Sync> = match tokio::time::timeout(timeout, attempt).await {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => {
                self.fail(IceState::Connecting);
                return Err(CourierError::Network(format!("ICE connectivity: {}", e)));
            }
            Err(_) => {
                self.fail(IceState::Connecting);
                return Err(CourierError::Timeout(format!(
                    "ICE connect to {} after {:?}",
                    self.peer.short(),
                    timeout
                )));
            }
        };

        self.link_lost.store(false, Ordering::SeqCst);
        *self.conn.lock() = Some(conn.clone());
        *self.reader.lock() = Some(self.spawn_reader(conn));
        self.transition(IceState::Connecting, IceState::Connected)?;
        info!(peer = %self.peer.short(), role = ?self.role, turn = self.uses_turn(), "ICE connected");
        Ok(())
    }

    fn spawn_reader(&self, conn: Arc<dyn Conn + Send + Sync>) -> JoinHandle<()> {
        let queue = self.queue.clone();
        let link_lost = self.link_lost.clone();
        let peer = self.peer;
        tokio::spawn(async move {
            let mut buf = vec![0u8; RECV_BUFFER_SIZE];
            loop {
                match conn.recv(&mut buf).await {
                    Ok(0) => continue,
                    Ok(n) => {
                        if queue.push(Bytes::copy_from_slice(&buf[..n])).is_some() {
                            debug!(peer = %peer.short(), "Inbound queue full, dropped oldest");
                        }
                    }
                    Err(e) => {
                        debug!(peer = %peer.short(), error = %e, "ICE reader stopped");
                        link_lost.store(true, Ordering::SeqCst);
                        break;
                    }
                }
            }
        })
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Data
    // ═══════════════════════════════════════════════════════════════════════

    /// Send one datagram. Valid only while connected.
    pub async fn send(&self, data: &[u8]) -> CourierResult<usize> {
        if data.is_empty() {
            return Err(CourierError::Param("empty ICE message".to_string()));
        }
        if data.len() > MAX_ICE_MESSAGE {
            return Err(CourierError::Param(format!(
                "ICE message of {} bytes exceeds {}",
                data.len(),
                MAX_ICE_MESSAGE
            )));
        }
        if !self.is_connected() {
            return Err(CourierError::InvalidState(format!(
                "cannot send in state {:?}",
                self.state()
            )));
        }
        let conn = self
            .conn
            .lock()
            .clone()
            .ok_or_else(|| CourierError::InvalidState("no ICE connection".to_string()))?;
        conn.send(data)
            .await
            .map_err(|e| CourierError::Network(format!("ICE send: {}", e)))
    }

    /// Wait for an inbound message. `Some(Duration::ZERO)` polls, `None`
    /// waits until one arrives or the session is freed.
    pub fn recv_timeout(&self, timeout: Option<Duration>) -> Option<Bytes> {
        self.queue.recv_timeout(timeout)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Teardown
    // ═══════════════════════════════════════════════════════════════════════

    /// Stop connectivity checks and I/O. The session stays inspectable and
    /// already queued messages can still be drained.
    pub async fn shutdown(&self) {
        *self.state.lock() = IceState::Closed;
        self.link_lost.store(true, Ordering::SeqCst);

        if let Some(cancel) = self.cancel_tx.lock().take() {
            let _ = cancel.try_send(());
        }
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        let conn = self.conn.lock().take();
        if let Some(conn) = conn {
            if let Err(e) = conn.close().await {
                debug!(error = %e, "Closing ICE connection");
            }
        }
        let agent = self.agent.lock().take();
        if let Some(agent) = agent {
            if let Err(e) = agent.close().await {
                warn!(peer = %self.peer.short(), error = %e, "Closing ICE agent");
            }
        }
    }

    /// Shut down and release everything, including queued messages.
    pub async fn free(&self) {
        self.shutdown().await;
        self.local.lock().take();
        self.remote.lock().take();
        self.queue.clear();
        self.queue.close();
    }
}

impl std::fmt::Debug for IceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IceSession")
            .field("peer", &self.peer)
            .field("role", &self.role)
            .field("session_id", &self.session_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
