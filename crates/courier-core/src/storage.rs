//! Local persistence using redb.
//!
//! Holds the small amount of state delivery needs to survive a restart:
//! - Outbound sequence counters, one per recipient
//! - Highest sequence number delivered from each sender (receive side)
//! - Highest watermark seen from each recipient (send side)
//! - The sender's own pending outbox entries, one blob per recipient
//!
//! Every counter is max-merged: a write never moves a stored value
//! backwards.

use crate::error::CourierError;
use crate::identity::Fingerprint;
use parking_lot::RwLock;
use redb::{Database, ReadableTable, TableDefinition};
use std::path::Path;
use std::sync::Arc;

const SEQ_TABLE: TableDefinition<&str, u64> = TableDefinition::new("outbound_seq");
const DELIVERED_TABLE: TableDefinition<&str, u64> = TableDefinition::new("delivered");
const WATERMARKS_TABLE: TableDefinition<&str, u64> = TableDefinition::new("seen_watermarks");
const OUTBOX_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("outbox");

/// Storage layer using redb for ACID-compliant persistence
#[derive(Clone)]
pub struct Storage {
    db: Arc<RwLock<Database>>,
}

impl Storage {
    /// Open (or create) storage at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CourierError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::init(Database::create(path)?)
    }

    /// Storage that lives only as long as the process.
    pub fn in_memory() -> Result<Self, CourierError> {
        let db = Database::builder().create_with_backend(redb::backends::InMemoryBackend::new())?;
        Self::init(db)
    }

    fn init(db: Database) -> Result<Self, CourierError> {
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(SEQ_TABLE)?;
            let _ = write_txn.open_table(DELIVERED_TABLE)?;
            let _ = write_txn.open_table(WATERMARKS_TABLE)?;
            let _ = write_txn.open_table(OUTBOX_TABLE)?;
        }
        write_txn.commit()?;

        Ok(Self {
            db: Arc::new(RwLock::new(db)),
        })
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Sequence Numbers
    // ═══════════════════════════════════════════════════════════════════════

    /// Allocate the next outbound sequence number for `recipient`.
    ///
    /// Numbers start at 1 and strictly increase across restarts.
    pub fn next_seq(&self, recipient: &Fingerprint) -> Result<u64, CourierError> {
        let key = recipient.to_hex();
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        let next = {
            let mut table = write_txn.open_table(SEQ_TABLE)?;
            let current = table.get(key.as_str())?.map(|v| v.value()).unwrap_or(0);
            let next = current + 1;
            table.insert(key.as_str(), next)?;
            next
        };
        write_txn.commit()?;
        Ok(next)
    }

    /// Make sure `seq` is never issued again for `recipient`.
    pub fn raise_seq(&self, recipient: &Fingerprint, seq: u64) -> Result<u64, CourierError> {
        self.merge_max(SEQ_TABLE, &recipient.to_hex(), seq)
    }

    /// Last sequence number issued for `recipient` (0 if none).
    pub fn current_seq(&self, recipient: &Fingerprint) -> Result<u64, CourierError> {
        self.read_counter(SEQ_TABLE, &recipient.to_hex())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Delivery Tracking (receive side)
    // ═══════════════════════════════════════════════════════════════════════

    /// Record that everything up to `seq` from `sender` was delivered.
    /// Returns the stored value after the merge.
    pub fn record_delivered(&self, sender: &Fingerprint, seq: u64) -> Result<u64, CourierError> {
        self.merge_max(DELIVERED_TABLE, &sender.to_hex(), seq)
    }

    /// Highest sequence number delivered from `sender` (0 if none).
    pub fn delivered(&self, sender: &Fingerprint) -> Result<u64, CourierError> {
        self.read_counter(DELIVERED_TABLE, &sender.to_hex())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Watermarks (send side)
    // ═══════════════════════════════════════════════════════════════════════

    /// Remember the highest watermark `recipient` has published.
    pub fn record_watermark(&self, recipient: &Fingerprint, seq: u64) -> Result<u64, CourierError> {
        self.merge_max(WATERMARKS_TABLE, &recipient.to_hex(), seq)
    }

    /// Highest watermark seen from `recipient` (0 if none).
    pub fn watermark(&self, recipient: &Fingerprint) -> Result<u64, CourierError> {
        self.read_counter(WATERMARKS_TABLE, &recipient.to_hex())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Outbox Snapshots
    // ═══════════════════════════════════════════════════════════════════════

    /// Persist the serialized pending outbox for `recipient`.
    pub fn save_outbox(&self, recipient: &Fingerprint, data: &[u8]) -> Result<(), CourierError> {
        let key = recipient.to_hex();
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(OUTBOX_TABLE)?;
            table.insert(key.as_str(), data)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Load the serialized pending outbox for `recipient`, if any.
    pub fn load_outbox(&self, recipient: &Fingerprint) -> Result<Option<Vec<u8>>, CourierError> {
        let key = recipient.to_hex();
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(OUTBOX_TABLE)?;
        Ok(table.get(key.as_str())?.map(|v| v.value().to_vec()))
    }

    /// Fingerprints of every recipient with a persisted outbox.
    pub fn outbox_recipients(&self) -> Result<Vec<Fingerprint>, CourierError> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(OUTBOX_TABLE)?;

        let mut recipients = Vec::new();
        for entry in table.iter()? {
            let (key, _) = entry?;
            match Fingerprint::parse(key.value()) {
                Ok(fp) => recipients.push(fp),
                Err(e) => tracing::warn!(key = key.value(), error = %e, "Skipping malformed outbox key"),
            }
        }
        Ok(recipients)
    }

    /// Drop the persisted outbox for `recipient`.
    pub fn delete_outbox(&self, recipient: &Fingerprint) -> Result<(), CourierError> {
        let key = recipient.to_hex();
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(OUTBOX_TABLE)?;
            table.remove(key.as_str())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Helpers
    // ═══════════════════════════════════════════════════════════════════════

    fn read_counter(
        &self,
        definition: TableDefinition<&str, u64>,
        key: &str,
    ) -> Result<u64, CourierError> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(definition)?;
        Ok(table.get(key)?.map(|v| v.value()).unwrap_or(0))
    }

    fn merge_max(
        &self,
        definition: TableDefinition<&str, u64>,
        key: &str,
        value: u64,
    ) -> Result<u64, CourierError> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        let merged = {
            let mut table = write_txn.open_table(definition)?;
            let current = table.get(key)?.map(|v| v.value()).unwrap_or(0);
            let merged = current.max(value);
            if merged != current {
                table.insert(key, merged)?;
            }
            merged
        };
        write_txn.commit()?;
        Ok(merged)
    }
}
