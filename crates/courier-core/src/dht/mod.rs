//! DHT facade
//!
//! The DHT storage/routing engine is an external collaborator. This module
//! pins down the small contract the transport consumes and everything it
//! layers on top:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  Presence / ICE / Spillway / TURN                               │
//! │        │ typed JSON payloads                                    │
//! │        ▼                                                        │
//! │  RecordStore: sign on write, verify + owner check on read       │
//! │        │ SignedRecord (postcard)                                │
//! │        ▼                                                        │
//! │  dyn Dht: put(key, value, ttl, slot) / put_permanent / get      │
//! │        │                                                        │
//! │        ▼                                                        │
//! │  MemoryDht (in-process) or an adapter over a real DHT node      │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Keys
//!
//! Every key is a keyed BLAKE3 derivation of `fingerprint [+ suffix]`, so
//! record locations are unlinkable to anyone who does not already know the
//! fingerprint.

mod memory;
mod record;

pub use memory::MemoryDht;
pub use record::{RecordStore, SignedRecord, VerifiedRecord};

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::CourierResult;
use crate::identity::Fingerprint;

/// Key derivation context for all DHT keys
const DHT_KEY_CONTEXT: &str = "courier 2024-06 dht record key";

/// Upper bound on a single stored value
pub const MAX_VALUE_SIZE: usize = 16 * 1024 * 1024;

/// Replaceable slot holding an identity's presence record
pub const PRESENCE_SLOT: u64 = 1;

/// Replaceable slot holding an outbox record
pub const OUTBOX_SLOT: u64 = 2;

/// Replaceable slot holding a watermark record
pub const WATERMARK_SLOT: u64 = 3;

/// Suffix for ICE candidate sets
pub const ICE_CANDIDATES_SUFFIX: &str = ":ice_candidates";

/// Suffix for TURN credential requests
pub const TURN_REQUEST_SUFFIX: &str = ":turn_request";

/// Suffix for TURN credential responses
pub const TURN_CREDENTIALS_SUFFIX: &str = ":turn_credentials";

/// Suffix for the permanent public-key record
pub const PUBLIC_KEY_SUFFIX: &str = ":pubkey";

/// A 32-byte DHT key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DhtKey([u8; 32]);

impl DhtKey {
    /// Derive `H(fingerprint + suffix)`.
    pub fn derive(fingerprint: &Fingerprint, suffix: &str) -> Self {
        let mut material = fingerprint.to_hex();
        material.push_str(suffix);
        Self(blake3::derive_key(DHT_KEY_CONTEXT, material.as_bytes()))
    }

    /// Presence record location: `H(fingerprint)`.
    pub fn presence(owner: &Fingerprint) -> Self {
        Self::derive(owner, "")
    }

    /// Outbox written by `sender` for `recipient`.
    pub fn outbox(sender: &Fingerprint, recipient: &Fingerprint) -> Self {
        Self::derive(sender, &format!(":outbox:{}", recipient))
    }

    /// Watermark written by `recipient` about `sender`'s outbox.
    pub fn watermark(recipient: &Fingerprint, sender: &Fingerprint) -> Self {
        Self::derive(recipient, &format!(":watermark:{}", sender))
    }

    /// ICE candidate sets published by `owner`.
    pub fn ice_candidates(owner: &Fingerprint) -> Self {
        Self::derive(owner, ICE_CANDIDATES_SUFFIX)
    }

    /// TURN requests addressed to a bootstrap node.
    pub fn turn_request(bootstrap: &Fingerprint) -> Self {
        Self::derive(bootstrap, TURN_REQUEST_SUFFIX)
    }

    /// TURN credentials issued to `requester`.
    pub fn turn_credentials(requester: &Fingerprint) -> Self {
        Self::derive(requester, TURN_CREDENTIALS_SUFFIX)
    }

    /// Permanent public-key record of `owner`.
    pub fn public_key(owner: &Fingerprint) -> Self {
        Self::derive(owner, PUBLIC_KEY_SUFFIX)
    }

    /// Raw key bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for DhtKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DhtKey({})", hex::encode(&self.0[..6]))
    }
}

impl fmt::Display for DhtKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Slot id scoped to one peer, e.g. one ICE offer per target.
pub fn slot_for(peer: &Fingerprint) -> u64 {
    let mut head = [0u8; 8];
    head.copy_from_slice(&peer.as_bytes()[..8]);
    // Keep clear of the small fixed slots.
    u64::from_be_bytes(head) | (1 << 63)
}

/// Contract consumed from the DHT engine.
///
/// Implementations must be safe for concurrent use; callers add no global
/// lock around the handle.
#[async_trait]
pub trait Dht: Send + Sync {
    /// Store `value` under `key`, replacing any value previously stored in
    /// the same `slot`. The value expires after `ttl`.
    async fn put(&self, key: &DhtKey, value: Vec<u8>, ttl: Duration, slot: u64)
        -> CourierResult<()>;

    /// Store a non-expiring [`SignedRecord`]. The first value a signer
    /// writes for a given `(key, tag)` wins; that signer's later writes are
    /// accepted and ignored. Values from other signers never displace it.
    /// Values that fail verification are rejected.
    async fn put_permanent(&self, key: &DhtKey, value: Vec<u8>, tag: &str) -> CourierResult<()>;

    /// All live values stored under `key` (empty if none).
    async fn get(&self, key: &DhtKey) -> CourierResult<Vec<Vec<u8>>>;

    /// Whether the node is bootstrapped and able to serve requests.
    fn is_ready(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp(seed: &[u8]) -> Fingerprint {
        Fingerprint::from_public_key(seed)
    }

    #[test]
    fn test_keys_are_purpose_separated() {
        let alice = fp(b"alice");
        let bob = fp(b"bob");

        let keys = [
            DhtKey::presence(&alice),
            DhtKey::outbox(&alice, &bob),
            DhtKey::outbox(&bob, &alice),
            DhtKey::watermark(&bob, &alice),
            DhtKey::ice_candidates(&alice),
            DhtKey::turn_request(&alice),
            DhtKey::turn_credentials(&alice),
            DhtKey::public_key(&alice),
        ];
        let unique: std::collections::HashSet<_> = keys.iter().collect();
        assert_eq!(unique.len(), keys.len());
    }

    #[test]
    fn test_key_derivation_is_deterministic() {
        let alice = fp(b"alice");
        assert_eq!(DhtKey::presence(&alice), DhtKey::derive(&alice, ""));
        assert_eq!(
            DhtKey::ice_candidates(&alice),
            DhtKey::derive(&alice, ":ice_candidates")
        );
    }

    #[test]
    fn test_peer_slots_avoid_fixed_slots() {
        for seed in [b"a".as_slice(), b"b", b"c"] {
            let slot = slot_for(&fp(seed));
            assert!(slot > WATERMARK_SLOT);
        }
        assert_ne!(slot_for(&fp(b"a")), slot_for(&fp(b"b")));
    }
}
