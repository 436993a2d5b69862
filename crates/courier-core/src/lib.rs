//! Courier Core Library
//!
//! Peer-to-peer delivery of opaque ciphertexts between messenger identities,
//! using a DHT for discovery, signaling and offline storage.
//!
//! ## Overview
//!
//! A [`Transport`] tries three tiers for every message, stopping at the
//! first that works:
//!
//! - **Direct TCP** to the address in the peer's fresh presence record
//! - **ICE** (STUN, then TURN) negotiated entirely through DHT records
//! - **Spillway**, the sender-owned offline outbox the peer collects later
//!
//! Everything received, on any tier, reaches the application through one
//! [`MessageHandler`] called from a single dispatcher task.
//!
//! ## Quick Start
//!
//! ```ignore
//! use courier_core::{Transport, TransportConfig, TransportDeps, FnHandler};
//!
//! let transport = Transport::new(
//!     TransportConfig::default(),
//!     TransportDeps { dht, signer, verifier, storage, clock: system_clock() },
//!     Arc::new(FnHandler(|msg| println!("{} bytes via {:?}", msg.ciphertext.len(), msg.via))),
//! )?;
//! transport.start().await?;
//! transport.start_heartbeat(contacts);
//!
//! match transport.send(&peer, ciphertext).await? {
//!     DeliveryOutcome::Direct | DeliveryOutcome::NatTraversal => {}
//!     DeliveryOutcome::QueuedOffline { seq } => println!("queued as #{seq}"),
//! }
//! ```

pub mod clock;
pub mod config;
pub mod dht;
pub mod error;
pub mod ice;
pub mod identity;
pub mod outbox;
pub mod presence;
pub mod storage;
pub mod tasks;
pub mod tcp;
pub mod transport;

// Re-exports
pub use clock::{system_clock, Clock, ManualClock, SharedClock, SystemClock};
pub use config::TransportConfig;
pub use dht::{Dht, DhtKey, MemoryDht, RecordStore};
pub use error::{CourierError, CourierResult, ErrorKind};
pub use ice::{IceManager, IceRole, IceSession, IceState, TurnCredential, TurnIssuer};
pub use identity::{DilithiumIdentity, DilithiumVerifier, Fingerprint, Signer, Verifier};
pub use outbox::{OutboxMessage, Spillway, Watermark};
pub use presence::{PeerInfo, PresenceRecord, PresenceService};
pub use storage::Storage;
pub use tasks::BackgroundTasks;
pub use tcp::{Ack, TcpTransport};
pub use transport::{
    DeliveryOutcome, DeliveryPath, FnHandler, HeartbeatSummary, InboundMessage, MessageHandler,
    SignalingSummary, StatsSnapshot, Transport, TransportDeps,
};
