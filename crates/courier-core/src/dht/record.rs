//! Signed DHT records
//!
//! Anyone can write to any DHT key, so every value this crate reads is
//! treated as untrusted until its signature verifies and its signer matches
//! the identity the key belongs to.
//!
//! ## Wire Format
//!
//! ```text
//! SignedRecord (postcard):
//! ┌──────────────────────────────────────────────┐
//! │  signer_pubkey: Vec<u8>                      │
//! │  payload: Vec<u8>      (purpose-specific JSON)│
//! │  signature: Vec<u8>    over                  │
//! │     "courier-record-v1" || key || payload    │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! Binding the key into the signed data stops a valid record from being
//! replayed under another key.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{Dht, DhtKey, MAX_VALUE_SIZE};
use crate::error::{CourierError, CourierResult};
use crate::identity::{Fingerprint, Signer, Verifier};

/// Domain separation tag for record signatures
const RECORD_SIGNING_TAG: &[u8] = b"courier-record-v1";

/// A payload plus the identity that vouches for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedRecord {
    /// Serialized public key of the signer
    pub signer_pubkey: Vec<u8>,
    /// Purpose-specific payload
    pub payload: Vec<u8>,
    /// Signature over (tag || key || payload)
    pub signature: Vec<u8>,
}

impl SignedRecord {
    /// Sign `payload` for storage under `key`.
    pub fn seal(key: &DhtKey, payload: Vec<u8>, signer: &dyn Signer) -> Self {
        let signature = signer.sign(&Self::signed_data(key, &payload));
        Self {
            signer_pubkey: signer.public_key(),
            payload,
            signature,
        }
    }

    /// Verify the signature and return the signer's fingerprint.
    pub fn open(&self, key: &DhtKey, verifier: &dyn Verifier) -> CourierResult<Fingerprint> {
        let data = Self::signed_data(key, &self.payload);
        if !verifier.verify(&self.signer_pubkey, &data, &self.signature) {
            return Err(CourierError::SignatureInvalid(format!(
                "record under {:?} failed verification",
                key
            )));
        }
        Ok(Fingerprint::from_public_key(&self.signer_pubkey))
    }

    /// Encode to bytes using postcard
    pub fn encode(&self) -> CourierResult<Vec<u8>> {
        Ok(postcard::to_allocvec(self)?)
    }

    /// Decode from bytes, rejecting oversized input before parsing.
    pub fn decode(bytes: &[u8]) -> CourierResult<Self> {
        if bytes.len() > MAX_VALUE_SIZE {
            return Err(CourierError::Protocol(format!(
                "record of {} bytes exceeds limit",
                bytes.len()
            )));
        }
        postcard::from_bytes(bytes).map_err(|e| CourierError::Protocol(e.to_string()))
    }

    fn signed_data(key: &DhtKey, payload: &[u8]) -> Vec<u8> {
        let mut data = Vec::with_capacity(RECORD_SIGNING_TAG.len() + 32 + payload.len());
        data.extend_from_slice(RECORD_SIGNING_TAG);
        data.extend_from_slice(key.as_bytes());
        data.extend_from_slice(payload);
        data
    }
}

/// A record that passed signature verification.
#[derive(Debug, Clone)]
pub struct VerifiedRecord {
    /// Fingerprint of the signer
    pub signer: Fingerprint,
    /// Serialized public key of the signer
    pub signer_pubkey: Vec<u8>,
    /// The verified payload
    pub payload: Vec<u8>,
}

impl VerifiedRecord {
    /// Parse the payload as JSON.
    pub fn parse<T: DeserializeOwned>(&self) -> CourierResult<T> {
        serde_json::from_slice(&self.payload).map_err(|e| CourierError::Protocol(e.to_string()))
    }
}

/// Signing/verifying view over a shared [`Dht`] handle.
#[derive(Clone)]
pub struct RecordStore {
    dht: Arc<dyn Dht>,
    signer: Arc<dyn Signer>,
    verifier: Arc<dyn Verifier>,
}

impl RecordStore {
    /// Create a record store for the identity behind `signer`.
    pub fn new(dht: Arc<dyn Dht>, signer: Arc<dyn Signer>, verifier: Arc<dyn Verifier>) -> Self {
        Self {
            dht,
            signer,
            verifier,
        }
    }

    /// The underlying DHT handle
    pub fn dht(&self) -> &Arc<dyn Dht> {
        &self.dht
    }

    /// The local identity
    pub fn signer(&self) -> &Arc<dyn Signer> {
        &self.signer
    }

    /// Fingerprint of the local identity
    pub fn local_fingerprint(&self) -> Fingerprint {
        self.signer.fingerprint()
    }

    /// Whether the DHT can currently serve requests
    pub fn is_ready(&self) -> bool {
        self.dht.is_ready()
    }

    /// Sign and store a replaceable record.
    pub async fn put_signed(
        &self,
        key: &DhtKey,
        payload: Vec<u8>,
        ttl: Duration,
        slot: u64,
    ) -> CourierResult<()> {
        let record = SignedRecord::seal(key, payload, self.signer.as_ref());
        self.dht.put(key, record.encode()?, ttl, slot).await
    }

    /// Serialize `value` as JSON, sign and store it.
    pub async fn put_json<T: Serialize>(
        &self,
        key: &DhtKey,
        value: &T,
        ttl: Duration,
        slot: u64,
    ) -> CourierResult<()> {
        self.put_signed(key, serde_json::to_vec(value)?, ttl, slot)
            .await
    }

    /// Sign and store a first-writer-wins permanent record.
    pub async fn put_signed_permanent(
        &self,
        key: &DhtKey,
        payload: Vec<u8>,
        tag: &str,
    ) -> CourierResult<()> {
        let record = SignedRecord::seal(key, payload, self.signer.as_ref());
        self.dht.put_permanent(key, record.encode()?, tag).await
    }

    /// Fetch every value under `key` that verifies, optionally restricted to
    /// values signed by `owner`. Forged or garbled values are dropped.
    pub async fn get_verified(
        &self,
        key: &DhtKey,
        owner: Option<&Fingerprint>,
    ) -> CourierResult<Vec<VerifiedRecord>> {
        let values = self.dht.get(key).await?;
        let mut verified = Vec::with_capacity(values.len());

        for value in values {
            let record = match SignedRecord::decode(&value) {
                Ok(record) => record,
                Err(e) => {
                    debug!(?key, error = %e, "Discarding undecodable DHT value");
                    continue;
                }
            };
            let signer = match record.open(key, self.verifier.as_ref()) {
                Ok(signer) => signer,
                Err(e) => {
                    debug!(?key, error = %e, "Discarding unverifiable DHT value");
                    continue;
                }
            };
            if let Some(owner) = owner {
                if signer != *owner {
                    debug!(?key, signer = %signer.short(), owner = %owner.short(), "Discarding value from foreign signer");
                    continue;
                }
            }
            verified.push(VerifiedRecord {
                signer,
                signer_pubkey: record.signer_pubkey,
                payload: record.payload,
            });
        }

        Ok(verified)
    }

    /// Fetch and parse every verified JSON value signed by `owner`.
    ///
    /// Values that verify but fail to parse are dropped the same way forged
    /// values are.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        key: &DhtKey,
        owner: &Fingerprint,
    ) -> CourierResult<Vec<T>> {
        let records = self.get_verified(key, Some(owner)).await?;
        Ok(records
            .iter()
            .filter_map(|record| match record.parse::<T>() {
                Ok(value) => Some(value),
                Err(e) => {
                    debug!(?key, error = %e, "Discarding unparseable record payload");
                    None
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::dht::{MemoryDht, PRESENCE_SLOT};
    use crate::identity::{DilithiumIdentity, DilithiumVerifier};

    fn store_for(dht: &Arc<MemoryDht>) -> RecordStore {
        RecordStore::new(
            dht.clone(),
            Arc::new(DilithiumIdentity::generate()),
            Arc::new(DilithiumVerifier),
        )
    }

    #[tokio::test]
    async fn test_put_and_get_verified() {
        let dht = Arc::new(MemoryDht::new(Arc::new(ManualClock::new(1_000))));
        let store = store_for(&dht);
        let me = store.local_fingerprint();
        let key = DhtKey::presence(&me);

        store
            .put_signed(&key, b"payload".to_vec(), Duration::from_secs(60), PRESENCE_SLOT)
            .await
            .unwrap();

        let records = store.get_verified(&key, Some(&me)).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].payload, b"payload");
        assert_eq!(records[0].signer, me);
    }

    #[tokio::test]
    async fn test_foreign_signer_is_filtered() {
        let dht = Arc::new(MemoryDht::new(Arc::new(ManualClock::new(1_000))));
        let owner = store_for(&dht);
        let intruder = store_for(&dht);
        let owner_fp = owner.local_fingerprint();
        let key = DhtKey::presence(&owner_fp);

        // Intruder writes into the owner's key under a different slot
        intruder
            .put_signed(&key, b"forged".to_vec(), Duration::from_secs(60), 99)
            .await
            .unwrap();

        assert!(owner.get_verified(&key, Some(&owner_fp)).await.unwrap().is_empty());
        assert_eq!(owner.get_verified(&key, None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_tampered_and_garbage_values_dropped() {
        let dht = Arc::new(MemoryDht::new(Arc::new(ManualClock::new(1_000))));
        let store = store_for(&dht);
        let me = store.local_fingerprint();
        let key = DhtKey::presence(&me);

        let mut record = SignedRecord::seal(&key, b"honest".to_vec(), store.signer().as_ref());
        record.payload = b"tampered".to_vec();
        dht.put(&key, record.encode().unwrap(), Duration::from_secs(60), 7)
            .await
            .unwrap();
        dht.put(&key, vec![0xFF; 3], Duration::from_secs(60), 8)
            .await
            .unwrap();

        assert!(store.get_verified(&key, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_record_not_replayable_under_other_key() {
        let dht = Arc::new(MemoryDht::new(Arc::new(ManualClock::new(1_000))));
        let store = store_for(&dht);
        let me = store.local_fingerprint();
        let key = DhtKey::presence(&me);
        let other = DhtKey::ice_candidates(&me);

        let record = SignedRecord::seal(&key, b"presence".to_vec(), store.signer().as_ref());
        dht.put(&other, record.encode().unwrap(), Duration::from_secs(60), 1)
            .await
            .unwrap();

        assert!(store.get_verified(&other, Some(&me)).await.unwrap().is_empty());
    }
}
