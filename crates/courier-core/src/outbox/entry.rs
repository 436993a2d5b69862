//! Outbox and watermark payloads
//!
//! Both are stored as signed JSON records. Ciphertext travels base64
//! encoded inside the JSON.

use serde::{Deserialize, Serialize};

use crate::error::{CourierError, CourierResult};
use crate::identity::Fingerprint;

/// Most pending entries one outbox record may hold
pub const MAX_OUTBOX_ENTRIES: usize = 512;

/// One undelivered ciphertext
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxMessage {
    pub sender: Fingerprint,
    pub recipient: Fingerprint,
    #[serde(with = "base64_bytes")]
    pub ciphertext: Vec<u8>,
    pub seq_num: u64,
    /// Unix seconds at enqueue
    pub created_at: u64,
    pub ttl_secs: u64,
}

impl OutboxMessage {
    /// Whether the entry outlived its own TTL at `now`
    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.created_at.saturating_add(self.ttl_secs)
    }
}

/// The sender's whole outbox for one recipient.
///
/// `last_seq` is the highest sequence number ever enqueued, kept even after
/// every entry has been pruned so a later enqueue can be checked against it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxRecord {
    pub sender: Fingerprint,
    pub recipient: Fingerprint,
    pub last_seq: u64,
    pub updated_at: u64,
    pub messages: Vec<OutboxMessage>,
}

impl OutboxRecord {
    /// Empty outbox
    pub fn new(sender: Fingerprint, recipient: Fingerprint) -> Self {
        Self {
            sender,
            recipient,
            last_seq: 0,
            updated_at: 0,
            messages: Vec::new(),
        }
    }

    /// Append an entry whose sequence number must exceed every earlier one.
    pub fn push(&mut self, message: OutboxMessage) -> CourierResult<()> {
        if message.seq_num <= self.last_seq {
            return Err(CourierError::Param(format!(
                "seq {} is not above last enqueued seq {}",
                message.seq_num, self.last_seq
            )));
        }
        if self.messages.len() >= MAX_OUTBOX_ENTRIES {
            return Err(CourierError::Param(format!(
                "outbox for {} is full ({} entries)",
                self.recipient.short(),
                MAX_OUTBOX_ENTRIES
            )));
        }
        self.last_seq = message.seq_num;
        self.messages.push(message);
        Ok(())
    }

    /// Drop entries covered by `watermark` or past their TTL.
    /// Returns how many were removed.
    pub fn prune(&mut self, watermark: u64, now: u64) -> usize {
        let before = self.messages.len();
        self.messages
            .retain(|m| m.seq_num > watermark && !m.is_expired(now));
        before - self.messages.len()
    }

    /// Whether the record is addressed from `sender` to `recipient`
    pub fn is_between(&self, sender: &Fingerprint, recipient: &Fingerprint) -> bool {
        self.sender == *sender && self.recipient == *recipient
    }
}

/// Highest sequence number `recipient` collected from `sender`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermark {
    pub recipient: Fingerprint,
    pub sender: Fingerprint,
    pub max_seq: u64,
    pub updated_at: u64,
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64.decode(encoded).map_err(serde::de::Error::custom)
    }
}
