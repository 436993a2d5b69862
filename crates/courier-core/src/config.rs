//! Transport configuration
//!
//! Every field has a default, so a config file only needs the values it
//! changes:
//!
//! ```json
//! { "listen_port": 0, "enable_offline_queue": false }
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CourierError, CourierResult};
use crate::identity::Fingerprint;

/// Seven days, the lifetime of every refreshable DHT record
pub const WEEK_SECS: u64 = 7 * 24 * 60 * 60;

/// Configuration for a transport instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// TCP listener port (0 = ephemeral)
    pub listen_port: u16,
    /// Spillway on/off
    pub enable_offline_queue: bool,
    /// TTL of outbox records and entries
    pub offline_ttl_secs: u64,
    /// TTL of presence records
    pub presence_ttl_secs: u64,
    /// A presence record older than this counts as offline
    pub presence_freshness_secs: u64,
    /// TTL of ICE candidate sets
    pub candidate_ttl_secs: u64,
    /// STUN server host
    pub stun_server: String,
    /// STUN server port
    pub stun_port: u16,
    /// Fingerprints of nodes that issue TURN credentials
    pub turn_bootstrap: Vec<Fingerprint>,
    /// NAT traversal tier on/off
    pub enable_ice: bool,
    /// Bound on candidate gathering
    pub ice_gather_timeout_ms: u64,
    /// Bound on connectivity checks and on waiting for an answer
    pub ice_connect_timeout_ms: u64,
    /// Gather loopback host candidates (same-host peers and tests)
    pub ice_include_loopback: bool,
    /// Cadence of answering ICE offers and serving TURN requests
    pub signaling_interval_ms: u64,
    /// Bound on waiting for a TCP acknowledgment byte
    pub ack_timeout_ms: u64,
    /// Bound on establishing a TCP connection
    pub connect_timeout_ms: u64,
    /// Idle pooled TCP connections older than this are closed
    pub pool_idle_secs: u64,
    /// Connection cache size
    pub max_pooled_connections: usize,
    /// Inbound TCP connections served at once; further accepts wait
    pub max_inbound_connections: usize,
    /// An inbound connection with no complete frame for this long is closed
    pub inbound_idle_secs: u64,
    /// Presence / polling / maintenance cadence
    pub heartbeat_interval_secs: u64,
    /// Addresses placed in presence records (empty = guess)
    pub advertise_addresses: Vec<String>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            listen_port: 4001,
            enable_offline_queue: true,
            offline_ttl_secs: WEEK_SECS,
            presence_ttl_secs: WEEK_SECS,
            presence_freshness_secs: 600,
            candidate_ttl_secs: WEEK_SECS,
            stun_server: "stun.l.google.com".to_string(),
            stun_port: 19302,
            turn_bootstrap: Vec::new(),
            enable_ice: true,
            ice_gather_timeout_ms: 5_000,
            ice_connect_timeout_ms: 10_000,
            ice_include_loopback: false,
            signaling_interval_ms: 1_000,
            ack_timeout_ms: 5_000,
            connect_timeout_ms: 3_000,
            pool_idle_secs: 60,
            max_pooled_connections: 32,
            max_inbound_connections: 128,
            inbound_idle_secs: 60,
            heartbeat_interval_secs: 60,
            advertise_addresses: Vec::new(),
        }
    }
}

impl TransportConfig {
    /// Load configuration from a JSON file and validate it.
    pub fn load(path: impl AsRef<Path>) -> CourierResult<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path)?;
        let config: Self = serde_json::from_slice(&data).map_err(|e| {
            CourierError::Param(format!("invalid config {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make a tier unusable.
    pub fn validate(&self) -> CourierResult<()> {
        let nonzero = [
            ("offline_ttl_secs", self.offline_ttl_secs),
            ("presence_ttl_secs", self.presence_ttl_secs),
            ("presence_freshness_secs", self.presence_freshness_secs),
            ("candidate_ttl_secs", self.candidate_ttl_secs),
            ("ice_gather_timeout_ms", self.ice_gather_timeout_ms),
            ("ice_connect_timeout_ms", self.ice_connect_timeout_ms),
            ("ack_timeout_ms", self.ack_timeout_ms),
            ("connect_timeout_ms", self.connect_timeout_ms),
            ("heartbeat_interval_secs", self.heartbeat_interval_secs),
            ("signaling_interval_ms", self.signaling_interval_ms),
            ("inbound_idle_secs", self.inbound_idle_secs),
            ("max_inbound_connections", self.max_inbound_connections as u64),
        ];
        for (name, value) in nonzero {
            if value == 0 {
                return Err(CourierError::Param(format!("{} must be non-zero", name)));
            }
        }
        if self.enable_ice && self.stun_server.trim().is_empty() {
            return Err(CourierError::Param(
                "stun_server is required when ICE is enabled".to_string(),
            ));
        }
        if self.signaling_interval_ms >= self.ice_connect_timeout_ms {
            return Err(CourierError::Param(
                "signaling_interval_ms must be shorter than ice_connect_timeout_ms".to_string(),
            ));
        }
        if self.presence_freshness_secs > self.presence_ttl_secs {
            return Err(CourierError::Param(
                "presence_freshness_secs exceeds presence_ttl_secs".to_string(),
            ));
        }
        Ok(())
    }

    /// TTL of outbox records
    pub fn offline_ttl(&self) -> Duration {
        Duration::from_secs(self.offline_ttl_secs)
    }

    /// TTL of presence records
    pub fn presence_ttl(&self) -> Duration {
        Duration::from_secs(self.presence_ttl_secs)
    }

    /// TTL of ICE candidate sets
    pub fn candidate_ttl(&self) -> Duration {
        Duration::from_secs(self.candidate_ttl_secs)
    }

    /// Candidate gathering bound
    pub fn ice_gather_timeout(&self) -> Duration {
        Duration::from_millis(self.ice_gather_timeout_ms)
    }

    /// Connectivity check bound
    pub fn ice_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.ice_connect_timeout_ms)
    }

    /// TCP ack wait bound
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    /// TCP connect bound
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Idle expiry of pooled connections
    pub fn pool_idle(&self) -> Duration {
        Duration::from_secs(self.pool_idle_secs)
    }

    /// Heartbeat cadence
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// Offer answering and TURN issuing cadence
    pub fn signaling_interval(&self) -> Duration {
        Duration::from_millis(self.signaling_interval_ms)
    }

    /// Per-frame read bound on inbound connections
    pub fn inbound_idle(&self) -> Duration {
        Duration::from_secs(self.inbound_idle_secs)
    }
}
