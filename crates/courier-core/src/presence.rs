//! Presence Service
//!
//! Publishes and looks up signed presence records: which addresses an
//! identity can be reached at, and when it last said so.
//!
//! ## Record lifecycle
//!
//! ```text
//! heartbeat ──▶ register_presence ──▶ put_signed(H(fp), PRESENCE_SLOT, 7d)
//!                                             │
//! peer ──▶ lookup_peer(pubkey) ──▶ get_verified(H(fp), owner = fp)
//!                                             │
//!                                  is_online = now - last_seen < 600s
//! ```
//!
//! The record is replaceable, so republishing overwrites the previous one.
//! A record that is still within its TTL but older than the freshness
//! window reports the peer as offline.
//!
//! DHT failures surface as network errors and are never retried here; the
//! heartbeat is the retry loop.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::clock::SharedClock;
use crate::config::TransportConfig;
use crate::dht::{DhtKey, RecordStore, PRESENCE_SLOT, PUBLIC_KEY_SUFFIX};
use crate::error::{CourierError, CourierResult};
use crate::identity::Fingerprint;

/// Signed presence payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceRecord {
    /// Owner of the record
    pub fingerprint: Fingerprint,
    /// Addresses the owner listens on
    pub addresses: Vec<String>,
    /// TCP listener port
    pub port: u16,
    /// Unix seconds at publication
    pub last_seen: u64,
}

/// Result of a presence lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    /// The peer's fingerprint
    pub fingerprint: Fingerprint,
    /// Advertised addresses
    pub addresses: Vec<String>,
    /// Advertised TCP port
    pub port: u16,
    /// Unix seconds of the latest record
    pub last_seen: u64,
    /// Record is younger than the freshness window
    pub is_online: bool,
}

impl PeerInfo {
    /// Advertised addresses that parse as IP addresses.
    pub fn ip_addresses(&self) -> Vec<IpAddr> {
        self.addresses
            .iter()
            .filter_map(|a| a.parse().ok())
            .collect()
    }
}

/// Publishes and resolves presence records.
#[derive(Clone)]
pub struct PresenceService {
    records: RecordStore,
    clock: SharedClock,
    ttl: std::time::Duration,
    freshness_secs: u64,
}

impl PresenceService {
    /// Create a presence service using the TTL and freshness window from
    /// `config`.
    pub fn new(records: RecordStore, clock: SharedClock, config: &TransportConfig) -> Self {
        Self {
            records,
            clock,
            ttl: config.presence_ttl(),
            freshness_secs: config.presence_freshness_secs,
        }
    }

    /// Publish this identity's reachable addresses.
    pub async fn register_presence(&self, addresses: &[String], port: u16) -> CourierResult<()> {
        if addresses.is_empty() {
            return Err(CourierError::Param("address list is empty".to_string()));
        }
        if let Some(bad) = addresses.iter().find(|a| a.parse::<IpAddr>().is_err()) {
            return Err(CourierError::Param(format!("not an IP address: {:?}", bad)));
        }
        if port == 0 {
            return Err(CourierError::Param("presence port must be non-zero".to_string()));
        }

        let fingerprint = self.records.local_fingerprint();
        let record = PresenceRecord {
            fingerprint,
            addresses: addresses.to_vec(),
            port,
            last_seen: self.clock.now_secs(),
        };
        let key = DhtKey::presence(&fingerprint);
        self.records
            .put_json(&key, &record, self.ttl, PRESENCE_SLOT)
            .await?;

        debug!(fp = %fingerprint.short(), port, addresses = ?record.addresses, "Registered presence");
        Ok(())
    }

    /// Look up a peer by public key.
    pub async fn lookup_peer(&self, peer_pubkey: &[u8]) -> CourierResult<PeerInfo> {
        if peer_pubkey.is_empty() {
            return Err(CourierError::Param("peer public key is empty".to_string()));
        }
        self.lookup_by_fingerprint(&Fingerprint::from_public_key(peer_pubkey))
            .await
    }

    /// Look up a peer by fingerprint.
    pub async fn lookup_by_fingerprint(&self, fingerprint: &Fingerprint) -> CourierResult<PeerInfo> {
        let record = self.latest_record(fingerprint).await?;
        let is_online = self.is_fresh(record.last_seen);
        Ok(PeerInfo {
            fingerprint: *fingerprint,
            addresses: record.addresses,
            port: record.port,
            last_seen: record.last_seen,
            is_online,
        })
    }

    /// Raw last-seen timestamp of a peer, NotFound if it never published.
    pub async fn lookup_presence_by_fingerprint(
        &self,
        fingerprint: &Fingerprint,
    ) -> CourierResult<u64> {
        Ok(self.latest_record(fingerprint).await?.last_seen)
    }

    /// Whether a record stamped `last_seen` is inside the freshness window.
    pub fn is_fresh(&self, last_seen: u64) -> bool {
        self.clock.now_secs().saturating_sub(last_seen) < self.freshness_secs
    }

    async fn latest_record(&self, fingerprint: &Fingerprint) -> CourierResult<PresenceRecord> {
        let key = DhtKey::presence(fingerprint);
        let records: Vec<PresenceRecord> = self.records.get_json(&key, fingerprint).await?;

        records
            .into_iter()
            .filter(|r| r.fingerprint == *fingerprint)
            .max_by_key(|r| r.last_seen)
            .ok_or_else(|| {
                CourierError::NotFound(format!("no presence record for {}", fingerprint.short()))
            })
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Public-key Directory
    // ═══════════════════════════════════════════════════════════════════════

    /// Publish this identity's public key under a permanent record.
    pub async fn publish_public_key(&self) -> CourierResult<()> {
        let fingerprint = self.records.local_fingerprint();
        let key = DhtKey::public_key(&fingerprint);
        let public_key = self.records.signer().public_key();
        self.records
            .put_signed_permanent(&key, public_key, PUBLIC_KEY_SUFFIX)
            .await?;
        info!(fp = %fingerprint.short(), "Published public key");
        Ok(())
    }

    /// Resolve a fingerprint to the public key it was derived from.
    pub async fn lookup_public_key(&self, fingerprint: &Fingerprint) -> CourierResult<Vec<u8>> {
        let key = DhtKey::public_key(fingerprint);
        let records = self.records.get_verified(&key, Some(fingerprint)).await?;

        records
            .into_iter()
            .find(|r| r.payload == r.signer_pubkey && fingerprint.matches(&r.payload))
            .map(|r| r.payload)
            .ok_or_else(|| {
                CourierError::NotFound(format!("no public key for {}", fingerprint.short()))
            })
    }
}
