//! Spillway: sender-owned offline outboxes
//!
//! Each sender keeps one outbox record per recipient under a key only the
//! sender writes to, so no write access ever has to be negotiated:
//!
//! ```text
//! sender A                       DHT                          recipient B
//! ────────                       ───                          ───────────
//! enqueue(seq) ──put──▶ H(A:outbox:B)   = [seq 1, seq 2, ...]
//!                                          ◀──get── check_offline_messages
//!                       H(B:watermark:A) = max seq ◀──put── (background)
//! maintain() ──get──▶ watermark, prune seq <= watermark, republish
//! ```
//!
//! ## Guarantees
//!
//! - Sequence numbers per (sender, recipient) strictly increase and are
//!   never reused, across restarts and after pruning.
//! - Watermarks only move forward; a stale publish is merged with `max`.
//! - Delivery is at least once. The recipient skips entries at or below
//!   its own delivered mark, so duplicates only appear after local state
//!   is lost.

mod entry;

pub use entry::{OutboxMessage, OutboxRecord, Watermark, MAX_OUTBOX_ENTRIES};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::clock::SharedClock;
use crate::config::TransportConfig;
use crate::dht::{DhtKey, RecordStore, MAX_VALUE_SIZE, OUTBOX_SLOT, WATERMARK_SLOT};
use crate::error::{CourierError, CourierResult};
use crate::identity::Fingerprint;
use crate::storage::Storage;
use crate::tasks::BackgroundTasks;
use crate::transport::{InboundMessage, InboundSender};

/// Room left in a DHT value for the signature envelope
const RECORD_ENVELOPE_RESERVE: usize = 64 * 1024;

/// The offline delivery tier.
#[derive(Clone)]
pub struct Spillway {
    records: RecordStore,
    storage: Storage,
    clock: SharedClock,
    tasks: BackgroundTasks,
    inbound: InboundSender,
    enabled: bool,
    ttl: Duration,
    /// Serializes every read-modify-write of the local outboxes
    writes: Arc<tokio::sync::Mutex<()>>,
    /// Watermarks this node has published, per sender
    published: Arc<tokio::sync::Mutex<HashMap<Fingerprint, u64>>>,
    reconciled: Arc<parking_lot::Mutex<HashSet<Fingerprint>>>,
}

impl Spillway {
    pub fn new(
        records: RecordStore,
        storage: Storage,
        clock: SharedClock,
        config: &TransportConfig,
        inbound: InboundSender,
        tasks: BackgroundTasks,
    ) -> Self {
        Self {
            records,
            storage,
            clock,
            tasks,
            inbound,
            enabled: config.enable_offline_queue,
            ttl: config.offline_ttl(),
            writes: Arc::new(tokio::sync::Mutex::new(())),
            published: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
            reconciled: Arc::new(parking_lot::Mutex::new(HashSet::new())),
        }
    }

    /// Whether offline queueing is switched on
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Default TTL given to queued entries
    pub fn default_ttl(&self) -> Duration {
        self.ttl
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Sending side
    // ═══════════════════════════════════════════════════════════════════════

    /// Allocate the next sequence number for `recipient`.
    ///
    /// The first call per recipient after start-up also raises the local
    /// counter to the highest seq found in our own outbox record, so a node
    /// restored without its database never reuses a number.
    pub async fn next_seq(&self, recipient: &Fingerprint) -> CourierResult<u64> {
        if !self.reconciled.lock().contains(recipient) {
            match self.reconcile(recipient).await {
                Ok(()) => {
                    self.reconciled.lock().insert(*recipient);
                }
                Err(e) => debug!(recipient = %recipient.short(), error = %e, "Outbox reconcile deferred"),
            }
        }
        self.storage.next_seq(recipient)
    }

    async fn reconcile(&self, recipient: &Fingerprint) -> CourierResult<()> {
        let me = self.records.local_fingerprint();
        let key = DhtKey::outbox(&me, recipient);
        let remote = self
            .records
            .get_json::<OutboxRecord>(&key, &me)
            .await?
            .into_iter()
            .filter(|r| r.is_between(&me, recipient))
            .max_by_key(|r| (r.last_seq, r.updated_at));

        let local = self.load_record(recipient)?;
        let local_last = local.as_ref().map_or(0, |r| r.last_seq);
        if let Some(remote) = remote {
            self.storage
                .raise_seq(recipient, remote.last_seq.max(local_last))?;
            if remote.last_seq > local_last {
                info!(
                    recipient = %recipient.short(),
                    last_seq = remote.last_seq,
                    pending = remote.messages.len(),
                    "Adopted outbox record from the DHT"
                );
                let _guard = self.writes.lock().await;
                self.save_record(&remote)?;
            }
        } else {
            self.storage.raise_seq(recipient, local_last)?;
        }
        Ok(())
    }

    /// Append one ciphertext to our outbox for `recipient` and republish it.
    ///
    /// `seq_num` must exceed every seq previously enqueued for the
    /// recipient. The entry is persisted locally before the DHT write, so a
    /// failed publish is retried by the next [`Spillway::maintain`] pass.
    /// Does nothing when offline queueing is disabled.
    pub async fn enqueue(
        &self,
        sender: &Fingerprint,
        recipient: &Fingerprint,
        ciphertext: &[u8],
        seq_num: u64,
        ttl: Duration,
    ) -> CourierResult<()> {
        let me = self.records.local_fingerprint();
        if *sender != me {
            return Err(CourierError::Param(format!(
                "sender {} is not the local identity",
                sender.short()
            )));
        }
        if *recipient == me {
            return Err(CourierError::Param("cannot queue a message to ourselves".to_string()));
        }
        if ciphertext.is_empty() {
            return Err(CourierError::Param("ciphertext is empty".to_string()));
        }
        if seq_num == 0 {
            return Err(CourierError::Param("seq numbers start at 1".to_string()));
        }
        if ttl.is_zero() {
            return Err(CourierError::Param("ttl must be non-zero".to_string()));
        }
        if !self.enabled {
            debug!(recipient = %recipient.short(), seq_num, "Offline queue disabled, dropping");
            return Ok(());
        }

        let _guard = self.writes.lock().await;
        let now = self.clock.now_secs();
        let mut record = self
            .load_record(recipient)?
            .unwrap_or_else(|| OutboxRecord::new(me, *recipient));
        record.prune(self.storage.watermark(recipient)?, now);
        record.push(OutboxMessage {
            sender: me,
            recipient: *recipient,
            ciphertext: ciphertext.to_vec(),
            seq_num,
            created_at: now,
            ttl_secs: ttl.as_secs().max(1),
        })?;
        record.updated_at = now;

        let encoded = serde_json::to_vec(&record)?;
        if encoded.len() + RECORD_ENVELOPE_RESERVE > MAX_VALUE_SIZE {
            return Err(CourierError::Param(format!(
                "outbox for {} would exceed the DHT value limit",
                recipient.short()
            )));
        }
        self.storage.raise_seq(recipient, seq_num)?;
        self.storage.save_outbox(recipient, &encoded)?;

        self.publish_record(&record, encoded).await?;
        debug!(recipient = %recipient.short(), seq_num, pending = record.messages.len(), "Enqueued offline message");
        Ok(())
    }

    /// Entries still waiting in our outbox for `recipient`.
    pub fn pending(&self, recipient: &Fingerprint) -> CourierResult<Vec<OutboxMessage>> {
        Ok(self
            .load_record(recipient)?
            .map(|r| r.messages)
            .unwrap_or_default())
    }

    /// Sender maintenance pass.
    ///
    /// Fetches every recipient's watermark, drops entries it covers or that
    /// expired, and republishes each outbox that changed or still holds
    /// entries. Returns the number of entries pruned. One recipient's
    /// failure does not stop the others.
    pub async fn maintain(&self) -> CourierResult<usize> {
        if !self.enabled {
            return Ok(0);
        }
        if !self.records.is_ready() {
            return Err(CourierError::Network("DHT is not ready".to_string()));
        }

        let _guard = self.writes.lock().await;
        let recipients = self.storage.outbox_recipients()?;
        let marks = join_all(recipients.iter().map(|r| self.fetch_watermark(r))).await;

        let mut pruned = 0;
        for (recipient, mark) in recipients.iter().zip(marks) {
            match self.maintain_one(recipient, mark).await {
                Ok(n) => pruned += n,
                Err(e) => warn!(recipient = %recipient.short(), error = %e, "Outbox maintenance failed"),
            }
        }
        if pruned > 0 {
            info!(pruned, "Pruned delivered outbox entries");
        }
        Ok(pruned)
    }

    async fn maintain_one(
        &self,
        recipient: &Fingerprint,
        mark: CourierResult<u64>,
    ) -> CourierResult<usize> {
        match mark {
            Ok(seen) => {
                self.storage.record_watermark(recipient, seen)?;
            }
            Err(e) => debug!(recipient = %recipient.short(), error = %e, "Watermark lookup failed"),
        }
        let watermark = self.storage.watermark(recipient)?;
        let Some(mut record) = self.load_record(recipient)? else {
            return Ok(0);
        };

        let now = self.clock.now_secs();
        let removed = record.prune(watermark, now);
        if removed == 0 && record.messages.is_empty() {
            return Ok(0);
        }
        if removed > 0 {
            record.updated_at = now;
        }
        let encoded = serde_json::to_vec(&record)?;
        self.storage.save_outbox(recipient, &encoded)?;
        self.publish_record(&record, encoded).await?;
        debug!(recipient = %recipient.short(), watermark, removed, remaining = record.messages.len(), "Outbox maintained");
        Ok(removed)
    }

    /// Watermark `recipient` published for us (0 if none).
    pub async fn fetch_watermark(&self, recipient: &Fingerprint) -> CourierResult<u64> {
        let me = self.records.local_fingerprint();
        let key = DhtKey::watermark(recipient, &me);
        Ok(self
            .records
            .get_json::<Watermark>(&key, recipient)
            .await?
            .iter()
            .filter(|w| w.recipient == *recipient && w.sender == me)
            .map(|w| w.max_seq)
            .max()
            .unwrap_or(0))
    }

    async fn publish_record(&self, record: &OutboxRecord, encoded: Vec<u8>) -> CourierResult<()> {
        let key = DhtKey::outbox(&record.sender, &record.recipient);
        let ttl = record
            .messages
            .iter()
            .map(|m| Duration::from_secs(m.ttl_secs))
            .max()
            .map_or(self.ttl, |longest| longest.max(self.ttl));
        self.records
            .put_signed(&key, encoded, ttl, OUTBOX_SLOT)
            .await
    }

    fn load_record(&self, recipient: &Fingerprint) -> CourierResult<Option<OutboxRecord>> {
        match self.storage.load_outbox(recipient)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn save_record(&self, record: &OutboxRecord) -> CourierResult<()> {
        self.storage
            .save_outbox(&record.recipient, &serde_json::to_vec(record)?)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Receiving side
    // ═══════════════════════════════════════════════════════════════════════

    /// Collect everything `contacts` queued for us.
    ///
    /// All outboxes are fetched concurrently. New entries go to the
    /// dispatcher in seq order per sender, and a watermark for each sender
    /// is published in the background. A contact whose lookup or delivery
    /// fails is skipped; only an unavailable DHT, or every lookup failing,
    /// aborts with a network error. Returns the number of newly delivered
    /// messages.
    pub async fn check_offline_messages(
        &self,
        my_fingerprint: &Fingerprint,
        contacts: &[Fingerprint],
    ) -> CourierResult<usize> {
        let me = self.records.local_fingerprint();
        if *my_fingerprint != me {
            return Err(CourierError::Param(format!(
                "{} is not the local identity",
                my_fingerprint.short()
            )));
        }
        if !self.records.is_ready() {
            return Err(CourierError::Network("DHT is not ready".to_string()));
        }

        let mut seen = HashSet::new();
        let contacts: Vec<Fingerprint> = contacts
            .iter()
            .copied()
            .filter(|c| *c != me && seen.insert(*c))
            .collect();
        if contacts.is_empty() {
            return Ok(0);
        }

        let results = join_all(contacts.iter().map(|c| self.fetch_outbox(c, &me))).await;

        let mut delivered = 0;
        let mut failed = 0;
        for (contact, result) in contacts.iter().zip(results) {
            match result {
                Ok(Some((record, pubkey))) => {
                    match self.deliver_from(contact, &me, record, pubkey).await {
                        Ok(count) => delivered += count,
                        Err(e) => {
                            warn!(contact = %contact.short(), error = %e, "Delivering offline messages failed");
                        }
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    failed += 1;
                    debug!(contact = %contact.short(), error = %e, "Outbox lookup failed");
                }
            }
        }

        if failed == contacts.len() {
            return Err(CourierError::Network(format!(
                "all {} outbox lookups failed",
                failed
            )));
        }
        if delivered > 0 {
            info!(delivered, contacts = contacts.len(), "Collected offline messages");
        }
        Ok(delivered)
    }

    async fn fetch_outbox(
        &self,
        contact: &Fingerprint,
        me: &Fingerprint,
    ) -> CourierResult<Option<(OutboxRecord, Bytes)>> {
        let key = DhtKey::outbox(contact, me);
        let verified = self.records.get_verified(&key, Some(contact)).await?;
        Ok(verified
            .into_iter()
            .filter_map(|v| match v.parse::<OutboxRecord>() {
                Ok(record) if record.is_between(contact, me) => Some((record, Bytes::from(v.signer_pubkey))),
                Ok(_) => {
                    debug!(contact = %contact.short(), "Discarding outbox record with wrong endpoints");
                    None
                }
                Err(e) => {
                    debug!(contact = %contact.short(), error = %e, "Discarding unparseable outbox record");
                    None
                }
            })
            .max_by_key(|(record, _)| (record.updated_at, record.last_seq)))
    }

    async fn deliver_from(
        &self,
        contact: &Fingerprint,
        me: &Fingerprint,
        record: OutboxRecord,
        pubkey: Bytes,
    ) -> CourierResult<usize> {
        let mark = self.storage.delivered(contact)?;
        let now = self.clock.now_secs();

        let mut fresh: Vec<OutboxMessage> = record
            .messages
            .into_iter()
            .filter(|m| m.sender == *contact && m.recipient == *me)
            .filter(|m| m.seq_num > mark && !m.is_expired(now))
            .collect();
        fresh.sort_by_key(|m| m.seq_num);
        fresh.dedup_by_key(|m| m.seq_num);

        let mut delivered = 0;
        let mut max_seq = mark;
        let mut stopped = false;
        for message in fresh {
            let seq = message.seq_num;
            let inbound = InboundMessage::from_outbox(
                *contact,
                Some(pubkey.clone()),
                Bytes::from(message.ciphertext),
                seq,
            );
            if self.inbound.send(inbound).await.is_err() {
                stopped = true;
                break;
            }
            delivered += 1;
            max_seq = max_seq.max(seq);
        }

        if delivered > 0 {
            let merged = self.storage.record_delivered(contact, max_seq)?;
            debug!(contact = %contact.short(), delivered, watermark = merged, "Delivered offline messages");
            let spillway = self.clone();
            let sender = *contact;
            self.tasks.spawn_detached("watermark-publish", async move {
                spillway.publish_watermark(&sender, merged).await.map(|_| ())
            });
        }
        if stopped {
            return Err(CourierError::InvalidState(format!(
                "dispatcher stopped after {} messages",
                delivered
            )));
        }
        Ok(delivered)
    }

    /// Tell `sender` we hold everything up to `max_seq`.
    ///
    /// Merges with both the value this node published before and the
    /// value currently in the DHT, so the stored watermark never drops.
    /// The DHT is always consulted, so a record that expired or was lost is
    /// written again. Returns the watermark now in effect.
    pub async fn publish_watermark(&self, sender: &Fingerprint, max_seq: u64) -> CourierResult<u64> {
        if max_seq == 0 {
            return Err(CourierError::Param("watermark must be at least 1".to_string()));
        }
        let me = self.records.local_fingerprint();
        let mut published = self.published.lock().await;
        let local = published.get(sender).copied().unwrap_or(0);

        let key = DhtKey::watermark(&me, sender);
        let remote = self
            .records
            .get_json::<Watermark>(&key, &me)
            .await?
            .iter()
            .filter(|w| w.recipient == me && w.sender == *sender)
            .map(|w| w.max_seq)
            .max()
            .unwrap_or(0);

        let merged = local.max(remote).max(max_seq);
        if merged > remote {
            let watermark = Watermark {
                recipient: me,
                sender: *sender,
                max_seq: merged,
                updated_at: self.clock.now_secs(),
            };
            self.records
                .put_json(&key, &watermark, self.ttl, WATERMARK_SLOT)
                .await?;
            debug!(sender = %sender.short(), max_seq = merged, "Published watermark");
        }
        published.insert(*sender, merged);
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::dht::MemoryDht;
    use crate::identity::{DilithiumIdentity, DilithiumVerifier, Signer};
    use crate::transport::{inbound_channel, InboundReceiver};

    const DAY: Duration = Duration::from_secs(24 * 60 * 60);

    struct Node {
        fp: Fingerprint,
        spillway: Spillway,
        inbox: InboundReceiver,
        tasks: BackgroundTasks,
    }

    fn node_with(
        dht: &Arc<MemoryDht>,
        clock: &ManualClock,
        identity: Arc<DilithiumIdentity>,
        storage: Storage,
        config: &TransportConfig,
    ) -> Node {
        let fp = identity.fingerprint();
        let records = RecordStore::new(dht.clone(), identity, Arc::new(DilithiumVerifier));
        let (tx, inbox) = inbound_channel();
        let tasks = BackgroundTasks::new();
        let spillway = Spillway::new(
            records,
            storage,
            Arc::new(clock.clone()),
            config,
            tx,
            tasks.clone(),
        );
        Node {
            fp,
            spillway,
            inbox,
            tasks,
        }
    }

    fn node(dht: &Arc<MemoryDht>, clock: &ManualClock) -> Node {
        node_with(
            dht,
            clock,
            Arc::new(DilithiumIdentity::generate()),
            Storage::in_memory().unwrap(),
            &TransportConfig::default(),
        )
    }

    fn setup() -> (Arc<MemoryDht>, ManualClock) {
        let clock = ManualClock::new(1_700_000_000);
        (Arc::new(MemoryDht::new(Arc::new(clock.clone()))), clock)
    }

    async fn queue(from: &Node, to: &Node, body: &[u8]) -> u64 {
        let seq = from.spillway.next_seq(&to.fp).await.unwrap();
        from.spillway
            .enqueue(&from.fp, &to.fp, body, seq, DAY)
            .await
            .unwrap();
        seq
    }

    #[tokio::test]
    async fn test_enqueue_check_watermark_prune() {
        let (dht, clock) = setup();
        let alice = node(&dht, &clock);
        let mut bob = node(&dht, &clock);

        assert_eq!(queue(&alice, &bob, b"first").await, 1);
        assert_eq!(queue(&alice, &bob, b"second").await, 2);
        assert_eq!(alice.spillway.pending(&bob.fp).unwrap().len(), 2);

        let delivered = bob
            .spillway
            .check_offline_messages(&bob.fp, &[alice.fp])
            .await
            .unwrap();
        assert_eq!(delivered, 2);

        let first = bob.inbox.recv().await.unwrap();
        assert_eq!(first.ciphertext, Bytes::from_static(b"first"));
        assert_eq!(first.seq_num, Some(1));
        assert_eq!(first.sender_fingerprint, Some(alice.fp));
        assert_eq!(bob.inbox.recv().await.unwrap().seq_num, Some(2));

        bob.tasks.wait_idle().await;
        assert_eq!(alice.spillway.fetch_watermark(&bob.fp).await.unwrap(), 2);

        assert_eq!(alice.spillway.maintain().await.unwrap(), 2);
        assert!(alice.spillway.pending(&bob.fp).unwrap().is_empty());

        // Pruning never frees a seq for reuse
        assert_eq!(queue(&alice, &bob, b"third").await, 3);
    }

    #[tokio::test]
    async fn test_second_check_skips_delivered() {
        let (dht, clock) = setup();
        let alice = node(&dht, &clock);
        let mut bob = node(&dht, &clock);

        queue(&alice, &bob, b"one").await;
        assert_eq!(bob.spillway.check_offline_messages(&bob.fp, &[alice.fp]).await.unwrap(), 1);
        assert_eq!(bob.spillway.check_offline_messages(&bob.fp, &[alice.fp]).await.unwrap(), 0);

        queue(&alice, &bob, b"two").await;
        assert_eq!(bob.spillway.check_offline_messages(&bob.fp, &[alice.fp]).await.unwrap(), 1);
        bob.inbox.recv().await.unwrap();
        assert_eq!(bob.inbox.recv().await.unwrap().ciphertext, Bytes::from_static(b"two"));
    }

    #[tokio::test]
    async fn test_no_contacts_is_success() {
        let (dht, clock) = setup();
        let bob = node(&dht, &clock);
        assert_eq!(bob.spillway.check_offline_messages(&bob.fp, &[]).await.unwrap(), 0);

        let stranger = Fingerprint::from_public_key(b"stranger");
        assert_eq!(
            bob.spillway
                .check_offline_messages(&bob.fp, &[stranger])
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_unavailable_dht_aborts_check() {
        let (dht, clock) = setup();
        let alice = node(&dht, &clock);
        let bob = node(&dht, &clock);
        dht.set_online(false);

        let err = bob
            .spillway
            .check_offline_messages(&bob.fp, &[alice.fp])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Network);
    }

    #[tokio::test]
    async fn test_failing_contact_does_not_abort_batch() {
        let (dht, clock) = setup();
        let alice = node(&dht, &clock);
        let carol = node(&dht, &clock);
        let mut bob = node(&dht, &clock);

        queue(&alice, &bob, b"from alice").await;
        queue(&carol, &bob, b"from carol").await;
        dht.fail_key(DhtKey::outbox(&alice.fp, &bob.fp));

        let delivered = bob
            .spillway
            .check_offline_messages(&bob.fp, &[alice.fp, carol.fp])
            .await
            .unwrap();
        assert_eq!(delivered, 1);
        assert_eq!(
            bob.inbox.recv().await.unwrap().ciphertext,
            Bytes::from_static(b"from carol")
        );

        // Alone, the failing contact surfaces as a network error
        let err = bob
            .spillway
            .check_offline_messages(&bob.fp, &[alice.fp])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Network);
    }

    #[tokio::test]
    async fn test_enqueue_validation() {
        let (dht, clock) = setup();
        let alice = node(&dht, &clock);
        let bob = node(&dht, &clock);
        dht.set_online(false);

        // Rejected before touching the DHT
        let bad = [
            alice.spillway.enqueue(&bob.fp, &alice.fp, b"x", 1, DAY).await,
            alice.spillway.enqueue(&alice.fp, &bob.fp, b"", 1, DAY).await,
            alice.spillway.enqueue(&alice.fp, &bob.fp, b"x", 0, DAY).await,
            alice.spillway.enqueue(&alice.fp, &bob.fp, b"x", 1, Duration::ZERO).await,
            alice.spillway.enqueue(&alice.fp, &alice.fp, b"x", 1, DAY).await,
        ];
        for result in bad {
            assert!(matches!(result, Err(CourierError::Param(_))));
        }
        assert_eq!(dht.put_count(), 0);

        dht.set_online(true);
        alice.spillway.enqueue(&alice.fp, &bob.fp, b"x", 5, DAY).await.unwrap();
        assert!(matches!(
            alice.spillway.enqueue(&alice.fp, &bob.fp, b"y", 5, DAY).await,
            Err(CourierError::Param(_))
        ));
        assert!(matches!(
            alice.spillway.enqueue(&alice.fp, &bob.fp, b"y", 4, DAY).await,
            Err(CourierError::Param(_))
        ));
        // The local counter moved past the explicit seq
        assert_eq!(alice.spillway.next_seq(&bob.fp).await.unwrap(), 6);
    }

    #[tokio::test]
    async fn test_disabled_queue_is_noop() {
        let (dht, clock) = setup();
        let config = TransportConfig {
            enable_offline_queue: false,
            ..Default::default()
        };
        let alice = node_with(
            &dht,
            &clock,
            Arc::new(DilithiumIdentity::generate()),
            Storage::in_memory().unwrap(),
            &config,
        );
        let bob = node(&dht, &clock);

        alice.spillway.enqueue(&alice.fp, &bob.fp, b"x", 1, DAY).await.unwrap();
        assert_eq!(dht.put_count(), 0);
        assert!(alice.spillway.pending(&bob.fp).unwrap().is_empty());
        assert_eq!(alice.spillway.maintain().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failed_publish_kept_and_retried_by_maintain() {
        let (dht, clock) = setup();
        let alice = node(&dht, &clock);
        let mut bob = node(&dht, &clock);

        dht.set_online(false);
        let err = alice
            .spillway
            .enqueue(&alice.fp, &bob.fp, b"late", 1, DAY)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Network);
        assert_eq!(alice.spillway.pending(&bob.fp).unwrap().len(), 1);

        dht.set_online(true);
        assert_eq!(alice.spillway.maintain().await.unwrap(), 0);
        assert_eq!(bob.spillway.check_offline_messages(&bob.fp, &[alice.fp]).await.unwrap(), 1);
        assert_eq!(bob.inbox.recv().await.unwrap().ciphertext, Bytes::from_static(b"late"));
    }

    #[tokio::test]
    async fn test_expired_entries_not_delivered_and_pruned() {
        let (dht, clock) = setup();
        let alice = node(&dht, &clock);
        let bob = node(&dht, &clock);

        alice
            .spillway
            .enqueue(&alice.fp, &bob.fp, b"short", 1, Duration::from_secs(60))
            .await
            .unwrap();
        clock.advance(61);

        assert_eq!(bob.spillway.check_offline_messages(&bob.fp, &[alice.fp]).await.unwrap(), 0);
        assert_eq!(alice.spillway.maintain().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_watermark_never_regresses() {
        let (dht, clock) = setup();
        let alice = node(&dht, &clock);
        let bob = node(&dht, &clock);

        assert_eq!(bob.spillway.publish_watermark(&alice.fp, 5).await.unwrap(), 5);
        assert_eq!(bob.spillway.publish_watermark(&alice.fp, 3).await.unwrap(), 5);
        assert_eq!(alice.spillway.fetch_watermark(&bob.fp).await.unwrap(), 5);

        // A fresh process for bob merges with what the DHT already holds
        let bob_identity = Arc::new(DilithiumIdentity::generate());
        let bob_again = node_with(
            &dht,
            &clock,
            bob_identity.clone(),
            Storage::in_memory().unwrap(),
            &TransportConfig::default(),
        );
        let restarted = node_with(
            &dht,
            &clock,
            bob_identity,
            Storage::in_memory().unwrap(),
            &TransportConfig::default(),
        );
        bob_again.spillway.publish_watermark(&alice.fp, 9).await.unwrap();
        assert_eq!(restarted.spillway.publish_watermark(&alice.fp, 4).await.unwrap(), 9);

        assert!(matches!(
            bob.spillway.publish_watermark(&alice.fp, 0).await,
            Err(CourierError::Param(_))
        ));
    }

    #[tokio::test]
    async fn test_expired_watermark_republished() {
        let (dht, clock) = setup();
        let alice = node(&dht, &clock);
        let bob = node(&dht, &clock);

        assert_eq!(bob.spillway.publish_watermark(&alice.fp, 3).await.unwrap(), 3);
        clock.advance(7 * DAY.as_secs() + 1);
        assert_eq!(alice.spillway.fetch_watermark(&bob.fp).await.unwrap(), 0);

        // Nothing new to acknowledge, but the lost record is restored
        assert_eq!(bob.spillway.publish_watermark(&alice.fp, 2).await.unwrap(), 3);
        assert_eq!(alice.spillway.fetch_watermark(&bob.fp).await.unwrap(), 3);

        // An intact record is not rewritten
        let puts = dht.put_count();
        bob.spillway.publish_watermark(&alice.fp, 3).await.unwrap();
        assert_eq!(dht.put_count(), puts);
    }

    #[tokio::test]
    async fn test_stopped_dispatcher_does_not_abort_or_lose_messages() {
        let (dht, clock) = setup();
        let alice = node(&dht, &clock);
        let carol = node(&dht, &clock);
        let bob = node(&dht, &clock);

        queue(&alice, &bob, b"from alice").await;
        queue(&carol, &bob, b"from carol").await;
        let Node { fp: bob_fp, spillway: bob_spillway, inbox, .. } = bob;
        drop(inbox);

        let delivered = bob_spillway
            .check_offline_messages(&bob_fp, &[alice.fp, carol.fp])
            .await
            .unwrap();
        assert_eq!(delivered, 0);

        // Neither sender is marked delivered, so both stay collectable
        assert_eq!(bob_spillway.storage.delivered(&alice.fp).unwrap(), 0);
        assert_eq!(bob_spillway.storage.delivered(&carol.fp).unwrap(), 0);
        assert_eq!(alice.spillway.fetch_watermark(&bob_fp).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_forged_outbox_ignored() {
        let (dht, clock) = setup();
        let alice = node(&dht, &clock);
        let bob = node(&dht, &clock);

        // Mallory writes a record claiming to be alice's outbox for bob
        let mallory = Arc::new(DilithiumIdentity::generate());
        let forged_store = RecordStore::new(dht.clone(), mallory, Arc::new(DilithiumVerifier));
        let mut forged = OutboxRecord::new(alice.fp, bob.fp);
        forged
            .push(OutboxMessage {
                sender: alice.fp,
                recipient: bob.fp,
                ciphertext: b"forged".to_vec(),
                seq_num: 1,
                created_at: clock.now_secs(),
                ttl_secs: 3600,
            })
            .unwrap();
        forged_store
            .put_json(&DhtKey::outbox(&alice.fp, &bob.fp), &forged, DAY, OUTBOX_SLOT + 100)
            .await
            .unwrap();

        assert_eq!(bob.spillway.check_offline_messages(&bob.fp, &[alice.fp]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_next_seq_reconciles_with_dht() {
        let (dht, clock) = setup();
        let identity = Arc::new(DilithiumIdentity::generate());
        let bob = node(&dht, &clock);

        let first = node_with(&dht, &clock, identity.clone(), Storage::in_memory().unwrap(), &TransportConfig::default());
        queue(&first, &bob, b"one").await;
        queue(&first, &bob, b"two").await;

        // Same identity, empty database
        let restored = node_with(&dht, &clock, identity, Storage::in_memory().unwrap(), &TransportConfig::default());
        assert_eq!(restored.spillway.next_seq(&bob.fp).await.unwrap(), 3);
        assert_eq!(restored.spillway.pending(&bob.fp).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_check_rejects_foreign_fingerprint() {
        let (dht, clock) = setup();
        let bob = node(&dht, &clock);
        let other = Fingerprint::from_public_key(b"other");
        assert!(matches!(
            bob.spillway.check_offline_messages(&other, &[]).await,
            Err(CourierError::Param(_))
        ));
    }
}
