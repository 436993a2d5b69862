//! NAT Traversal Engine
//!
//! Negotiates a direct UDP path to a peer behind NAT, using the DHT as the
//! only signaling channel.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │ IceManager (one session per peer)                                 │
//! │                                                                   │
//! │   IceSession ── webrtc-ice Agent ── STUN / TURN                   │
//! │      │                │                                           │
//! │      │          Conn (selected pair)                              │
//! │      │                │ reader task                               │
//! │      ▼                ▼                                           │
//! │   InboundQueue (16, drop-oldest) ──pump──▶ transport dispatcher   │
//! │                                                                   │
//! │   IceSignaling: CandidateSet offer/answer at H(fp:ice_candidates) │
//! │   TurnClient / TurnIssuer: credentials at H(fp:turn_*)            │
//! └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! let session = IceSession::new(peer, IceRole::Controlling, None);
//! session.gather_candidates("stun.l.google.com", 19302, Duration::from_secs(5)).await?;
//! session.publish_to_dht(&signaling).await?;
//! session.fetch_from_dht(&signaling).await?;   // once the peer answered
//! session.connect(Duration::from_secs(10)).await?;
//! session.send(b"ciphertext").await?;
//! ```

mod candidates;
mod manager;
mod queue;
mod session;
mod turn;

pub use candidates::{CandidateSet, IceSignaling, SetKind, MAX_CANDIDATES, MAX_CANDIDATE_LEN};
pub use manager::IceManager;
pub use queue::{InboundQueue, INBOUND_QUEUE_CAPACITY};
pub use session::{IceRole, IceSession, IceState};
pub use turn::{TurnClient, TurnCredential, TurnIssuer, TurnRequest, TURN_REQUEST_MAX_AGE_SECS};

/// Largest payload sent over ICE: one UDP datagram
pub const MAX_ICE_MESSAGE: usize = 60_000;
