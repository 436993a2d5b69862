//! Inbound deliveries as seen by the application

use std::net::SocketAddr;

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::identity::Fingerprint;

/// Bound on deliveries waiting for the dispatcher
pub const INBOUND_CHANNEL_CAPACITY: usize = 256;

/// Sending half of the dispatcher channel, cloned into every receive path.
pub type InboundSender = mpsc::Sender<InboundMessage>;

/// Receiving half of the dispatcher channel
pub type InboundReceiver = mpsc::Receiver<InboundMessage>;

/// Create the dispatcher channel.
pub fn inbound_channel() -> (InboundSender, InboundReceiver) {
    mpsc::channel(INBOUND_CHANNEL_CAPACITY)
}

/// Tier a message arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryPath {
    /// Direct TCP frame
    Tcp,
    /// ICE datagram
    Ice,
    /// Collected from a contact's outbox
    Offline,
}

/// One delivered ciphertext.
///
/// Identity fields are whatever the receive path could vouch for. A TCP
/// frame carries neither, an ICE datagram carries the negotiated peer, and
/// an outbox entry carries the signer of its record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Sender public key, when known
    pub peer_pubkey: Option<Bytes>,
    /// Sender fingerprint, when known
    pub sender_fingerprint: Option<Fingerprint>,
    /// Opaque payload
    pub ciphertext: Bytes,
    /// Outbox sequence number (offline tier only)
    pub seq_num: Option<u64>,
    /// Receive path
    pub via: DeliveryPath,
    /// Remote socket (TCP only)
    pub peer_addr: Option<SocketAddr>,
}

impl InboundMessage {
    /// Anonymous frame read from a TCP connection.
    pub fn from_tcp(ciphertext: Bytes, peer_addr: SocketAddr) -> Self {
        Self {
            peer_pubkey: None,
            sender_fingerprint: None,
            ciphertext,
            seq_num: None,
            via: DeliveryPath::Tcp,
            peer_addr: Some(peer_addr),
        }
    }

    /// Datagram from a negotiated ICE session.
    pub fn from_ice(peer: Fingerprint, ciphertext: Bytes) -> Self {
        Self {
            peer_pubkey: None,
            sender_fingerprint: Some(peer),
            ciphertext,
            seq_num: None,
            via: DeliveryPath::Ice,
            peer_addr: None,
        }
    }

    /// Entry taken from a sender's outbox.
    pub fn from_outbox(
        sender: Fingerprint,
        sender_pubkey: Option<Bytes>,
        ciphertext: Bytes,
        seq_num: u64,
    ) -> Self {
        Self {
            peer_pubkey: sender_pubkey,
            sender_fingerprint: Some(sender),
            ciphertext,
            seq_num: Some(seq_num),
            via: DeliveryPath::Offline,
            peer_addr: None,
        }
    }

    /// Sender fingerprint as a hex string, the form the messenger layer keys on.
    pub fn sender_hex(&self) -> Option<String> {
        self.sender_fingerprint.map(|fp| fp.to_hex())
    }
}
