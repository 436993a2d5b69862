//! TURN credential exchange over the DHT
//!
//! When every peer-to-peer path fails, traffic is relayed through a TURN
//! server run by a bootstrap node. Credentials are obtained without any
//! side channel:
//!
//! ```text
//! requester                                     bootstrap (issuer)
//!   put TurnRequest{nonce} ──▶ H(bootstrap + ":turn_request")
//!                                         scan, verify signer == requester
//!   H(requester + ":turn_credentials") ◀── put TurnCredential{nonce}
//!   poll, verify signer == bootstrap, nonce matches
//! ```
//!
//! Issued credentials follow the TURN REST convention: the username is
//! `"<expiry>:<fingerprint>"` and the password is a keyed hash of the
//! username under a secret shared with the relay, so the relay can check
//! them statelessly.

use std::collections::HashMap;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::clock::SharedClock;
use crate::dht::{slot_for, DhtKey, RecordStore};
use crate::error::{CourierError, CourierResult};
use crate::identity::Fingerprint;

/// Requests older than this are ignored by issuers
pub const TURN_REQUEST_MAX_AGE_SECS: u64 = 300;

/// A cached credential is refreshed this long before it expires
const EXPIRY_MARGIN_SECS: u64 = 30;

const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Signed request for relay credentials
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnRequest {
    /// Identity asking for credentials
    pub requester: Fingerprint,
    /// Random value echoed by the issuer
    pub nonce: String,
    /// Unix seconds at publication
    pub created_at: u64,
}

/// Relay credentials issued by a bootstrap node
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnCredential {
    /// Relay host
    pub host: String,
    /// Relay port
    pub port: u16,
    /// TURN username
    pub username: String,
    /// TURN password
    pub password: String,
    /// Unix seconds after which the relay rejects the credential
    pub expiry: u64,
    /// Nonce of the request this answers
    pub nonce: String,
}

impl TurnCredential {
    /// Whether the credential is still usable at `now`.
    pub fn is_valid_at(&self, now: u64) -> bool {
        now.saturating_add(EXPIRY_MARGIN_SECS) < self.expiry
    }

    /// `turn:` URL for the relay
    pub fn url(&self) -> String {
        format!("turn:{}:{}?transport=udp", self.host, self.port)
    }
}

impl std::fmt::Debug for TurnCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TurnCredential")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("expiry", &self.expiry)
            .finish_non_exhaustive()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Requester
// ═══════════════════════════════════════════════════════════════════════════

/// Obtains and caches TURN credentials from bootstrap nodes.
pub struct TurnClient {
    records: RecordStore,
    clock: SharedClock,
    bootstrap: Vec<Fingerprint>,
    ttl: Duration,
    wait: Duration,
    cache: Mutex<Option<TurnCredential>>,
}

impl TurnClient {
    /// Create a client that asks `bootstrap` nodes in order, waiting up to
    /// `wait` for each to answer.
    pub fn new(
        records: RecordStore,
        clock: SharedClock,
        bootstrap: Vec<Fingerprint>,
        ttl: Duration,
        wait: Duration,
    ) -> Self {
        Self {
            records,
            clock,
            bootstrap,
            ttl,
            wait,
            cache: Mutex::new(None),
        }
    }

    /// Whether any issuer is configured
    pub fn is_configured(&self) -> bool {
        !self.bootstrap.is_empty()
    }

    /// The cached credential if it is still valid.
    pub fn cached(&self) -> Option<TurnCredential> {
        let now = self.clock.now_secs();
        self.cache
            .lock()
            .as_ref()
            .filter(|c| c.is_valid_at(now))
            .cloned()
    }

    /// A valid credential, from cache or from a fresh exchange.
    pub async fn credential(&self) -> CourierResult<TurnCredential> {
        if let Some(credential) = self.cached() {
            return Ok(credential);
        }
        if self.bootstrap.is_empty() {
            return Err(CourierError::NotFound(
                "no TURN bootstrap nodes configured".to_string(),
            ));
        }

        let mut last_error = None;
        for bootstrap in &self.bootstrap {
            match self.request_from(bootstrap).await {
                Ok(credential) => {
                    info!(
                        bootstrap = %bootstrap.short(),
                        relay = %credential.host,
                        expiry = credential.expiry,
                        "Obtained TURN credential"
                    );
                    *self.cache.lock() = Some(credential.clone());
                    return Ok(credential);
                }
                Err(e) => {
                    debug!(bootstrap = %bootstrap.short(), error = %e, "TURN request failed");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| CourierError::NotFound("no TURN credential".to_string())))
    }

    /// Refresh the cache ahead of need; failures are logged and dropped.
    pub async fn refresh(&self) {
        if !self.is_configured() {
            return;
        }
        if let Err(e) = self.credential().await {
            debug!(error = %e, "TURN credential refresh failed");
        }
    }

    async fn request_from(&self, bootstrap: &Fingerprint) -> CourierResult<TurnCredential> {
        let me = self.records.local_fingerprint();
        let request = TurnRequest {
            requester: me,
            nonce: hex::encode(rand::random::<[u8; 16]>()),
            created_at: self.clock.now_secs(),
        };
        self.records
            .put_json(&DhtKey::turn_request(bootstrap), &request, self.ttl, slot_for(&me))
            .await?;

        let key = DhtKey::turn_credentials(&me);
        let deadline = tokio::time::Instant::now() + self.wait;
        loop {
            let now = self.clock.now_secs();
            let credentials: Vec<TurnCredential> = self.records.get_json(&key, bootstrap).await?;
            if let Some(credential) = credentials
                .into_iter()
                .find(|c| c.nonce == request.nonce && c.is_valid_at(now))
            {
                return Ok(credential);
            }
            if tokio::time::Instant::now() + POLL_INTERVAL > deadline {
                return Err(CourierError::Timeout(format!(
                    "no TURN credential from {}",
                    bootstrap.short()
                )));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Issuer
// ═══════════════════════════════════════════════════════════════════════════

/// Answers TURN requests addressed to this bootstrap node.
pub struct TurnIssuer {
    records: RecordStore,
    clock: SharedClock,
    secret: [u8; 32],
    relay_host: String,
    relay_port: u16,
    lifetime: Duration,
    /// Nonce to the time after which its request is stale
    answered: Mutex<HashMap<String, u64>>,
}

impl TurnIssuer {
    /// Create an issuer for the relay at `relay_host:relay_port`, sharing
    /// `secret` with it.
    pub fn new(
        records: RecordStore,
        clock: SharedClock,
        secret: [u8; 32],
        relay_host: impl Into<String>,
        relay_port: u16,
        lifetime: Duration,
    ) -> Self {
        Self {
            records,
            clock,
            secret,
            relay_host: relay_host.into(),
            relay_port,
            lifetime,
            answered: Mutex::new(HashMap::new()),
        }
    }

    /// Mint a credential for `requester`.
    pub fn issue(&self, requester: &Fingerprint, nonce: &str) -> TurnCredential {
        let expiry = self.clock.now_secs() + self.lifetime.as_secs();
        let username = format!("{}:{}", expiry, requester);
        TurnCredential {
            host: self.relay_host.clone(),
            port: self.relay_port,
            password: self.password_for(&username),
            username,
            expiry,
            nonce: nonce.to_string(),
        }
    }

    /// Relay-side check of a username/password pair.
    pub fn verify(&self, username: &str, password: &str) -> bool {
        let Some((expiry, _fingerprint)) = username.split_once(':') else {
            return false;
        };
        let Ok(expiry) = expiry.parse::<u64>() else {
            return false;
        };
        expiry > self.clock.now_secs() && self.password_for(username) == password
    }

    /// Answer every fresh, verified request not answered before.
    ///
    /// Nonces are remembered until their request is too old to be served,
    /// so replay protection stays bounded. Returns the number of
    /// credentials issued.
    pub async fn process_requests(&self) -> CourierResult<usize> {
        let me = self.records.local_fingerprint();
        let key = DhtKey::turn_request(&me);
        let now = self.clock.now_secs();
        self.answered
            .lock()
            .retain(|_, dated| now.saturating_sub(*dated) <= TURN_REQUEST_MAX_AGE_SECS);
        let records = self.records.get_verified(&key, None).await?;

        let mut issued = 0;
        for record in records {
            let request: TurnRequest = match record.parse() {
                Ok(request) => request,
                Err(e) => {
                    debug!(error = %e, "Discarding malformed TURN request");
                    continue;
                }
            };
            if request.requester != record.signer {
                warn!(signer = %record.signer.short(), "TURN request signed by someone else");
                continue;
            }
            if now.saturating_sub(request.created_at) > TURN_REQUEST_MAX_AGE_SECS
                || request.created_at > now + TURN_REQUEST_MAX_AGE_SECS
            {
                continue;
            }
            {
                let mut answered = self.answered.lock();
                if answered.contains_key(&request.nonce) {
                    continue;
                }
                answered.insert(request.nonce.clone(), request.created_at.max(now));
            }

            let credential = self.issue(&request.requester, &request.nonce);
            let response_key = DhtKey::turn_credentials(&request.requester);
            if let Err(e) = self
                .records
                .put_json(&response_key, &credential, self.lifetime, slot_for(&me))
                .await
            {
                self.answered.lock().remove(&request.nonce);
                return Err(e);
            }
            debug!(requester = %request.requester.short(), "Issued TURN credential");
            issued += 1;
        }
        Ok(issued)
    }

    /// Number of nonces still remembered
    pub fn answered_count(&self) -> usize {
        self.answered.lock().len()
    }

    fn password_for(&self, username: &str) -> String {
        BASE64.encode(blake3::keyed_hash(&self.secret, username.as_bytes()).as_bytes())
    }
}
