//! Candidate exchange over the DHT
//!
//! The DHT is the signaling channel. Each identity publishes its candidate
//! sets under `H(fp + ":ice_candidates")`, one replaceable slot per target
//! peer, so an offer to Bob and an offer to Carol coexist.
//!
//! ```text
//! Alice (controlling)                        Bob (controlled)
//!   gather ──▶ put Offer{sid, target=Bob}
//!                                   poll ──▶ get Offer for me
//!                                   gather ──▶ put Answer{sid, target=Alice}
//!   poll ──▶ get Answer{sid}
//!   dial ◀════════ connectivity checks ════════▶ accept
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::clock::SharedClock;
use crate::dht::{slot_for, DhtKey, RecordStore};
use crate::error::{CourierError, CourierResult};
use crate::identity::Fingerprint;

/// Maximum number of candidates in one set
pub const MAX_CANDIDATES: usize = 32;

/// Maximum length of one marshalled candidate
pub const MAX_CANDIDATE_LEN: usize = 512;

/// Maximum length of ICE credentials and session ids
const MAX_CREDENTIAL_LEN: usize = 256;

/// Which side of the handshake a set belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SetKind {
    /// Published by the controlling side
    Offer,
    /// Published by the controlled side, echoing the offer's session id
    Answer,
}

/// A published set of candidates plus the credentials that pair with them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateSet {
    /// Handshake identifier chosen by the offerer
    pub session_id: String,
    /// Offer or answer
    pub kind: SetKind,
    /// Publisher
    pub from: Fingerprint,
    /// Peer the set is meant for
    pub target: Fingerprint,
    /// ICE username fragment
    pub ufrag: String,
    /// ICE password
    pub pwd: String,
    /// Marshalled candidates
    pub candidates: Vec<String>,
    /// Unix seconds at publication
    pub created_at: u64,
}

impl CandidateSet {
    /// Check every length bound before the set is used.
    pub fn validate(&self) -> CourierResult<()> {
        if self.candidates.is_empty() {
            return Err(CourierError::Protocol("candidate set is empty".to_string()));
        }
        if self.candidates.len() > MAX_CANDIDATES {
            return Err(CourierError::Protocol(format!(
                "{} candidates exceeds limit of {}",
                self.candidates.len(),
                MAX_CANDIDATES
            )));
        }
        if let Some(c) = self.candidates.iter().find(|c| c.is_empty() || c.len() > MAX_CANDIDATE_LEN) {
            return Err(CourierError::Protocol(format!(
                "candidate of {} bytes outside bounds",
                c.len()
            )));
        }
        for (name, value) in [
            ("session_id", &self.session_id),
            ("ufrag", &self.ufrag),
            ("pwd", &self.pwd),
        ] {
            if value.is_empty() || value.len() > MAX_CREDENTIAL_LEN {
                return Err(CourierError::Protocol(format!("{} length out of bounds", name)));
            }
        }
        Ok(())
    }
}

/// Publishes and fetches candidate sets for the local identity.
#[derive(Clone)]
pub struct IceSignaling {
    records: RecordStore,
    clock: SharedClock,
    ttl: Duration,
}

impl IceSignaling {
    /// Create a signaling handle; sets older than `ttl` are never used.
    pub fn new(records: RecordStore, clock: SharedClock, ttl: Duration) -> Self {
        Self { records, clock, ttl }
    }

    /// The local identity's fingerprint
    pub fn local_fingerprint(&self) -> Fingerprint {
        self.records.local_fingerprint()
    }

    /// Current Unix time from the injected clock
    pub fn now_secs(&self) -> u64 {
        self.clock.now_secs()
    }

    /// Lifetime of published sets
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// The record store used for signaling
    pub fn records(&self) -> &RecordStore {
        &self.records
    }

    /// Publish `set` in the slot reserved for its target.
    pub async fn publish(&self, set: &CandidateSet) -> CourierResult<()> {
        set.validate()?;
        let me = self.records.local_fingerprint();
        if set.from != me {
            return Err(CourierError::Param(
                "candidate set must be published by its owner".to_string(),
            ));
        }
        let key = DhtKey::ice_candidates(&me);
        self.records
            .put_json(&key, set, self.ttl, slot_for(&set.target))
            .await?;
        debug!(
            target_fp = %set.target.short(),
            kind = ?set.kind,
            candidates = set.candidates.len(),
            "Published candidate set"
        );
        Ok(())
    }

    /// Newest live set of `kind` that `peer` published for us.
    ///
    /// With `session_id`, only a set for that handshake matches.
    pub async fn fetch(
        &self,
        peer: &Fingerprint,
        kind: SetKind,
        session_id: Option<&str>,
    ) -> CourierResult<CandidateSet> {
        let me = self.records.local_fingerprint();
        let now = self.clock.now_secs();
        let key = DhtKey::ice_candidates(peer);
        let sets: Vec<CandidateSet> = self.records.get_json(&key, peer).await?;

        sets.into_iter()
            .filter(|set| set.from == *peer && set.target == me && set.kind == kind)
            .filter(|set| session_id.map_or(true, |sid| set.session_id == sid))
            .filter(|set| now.saturating_sub(set.created_at) < self.ttl.as_secs())
            .filter(|set| match set.validate() {
                Ok(()) => true,
                Err(e) => {
                    debug!(peer = %peer.short(), error = %e, "Discarding malformed candidate set");
                    false
                }
            })
            .max_by_key(|set| set.created_at)
            .ok_or_else(|| {
                CourierError::NotFound(format!("no {:?} from {} for us", kind, peer.short()))
            })
    }
}
