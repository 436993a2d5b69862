//! Single-task delivery of inbound messages and peer state changes
//!
//! ```text
//! TCP handlers ──┐
//! ICE pumps    ──┼──▶ mpsc (256) ──▶ dispatcher task ──▶ MessageHandler
//! outbox poll  ──┘                         ▲
//! refresh_peer_states ──▶ unbounded ───────┘
//! ```
//!
//! The handler is only ever called from the dispatcher task, one call at a
//! time, so it needs no locking of its own against re-entrant delivery.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::message::{InboundMessage, InboundReceiver};
use super::stats::TransportStats;
use crate::identity::Fingerprint;

/// Application callbacks.
///
/// Calls block the dispatcher; long work should be handed off.
pub trait MessageHandler: Send + Sync {
    /// A ciphertext arrived on some tier.
    fn on_message(&self, message: InboundMessage);

    /// A contact went online or offline.
    fn on_peer_state(&self, _peer: &Fingerprint, _online: bool) {}
}

/// Adapts a closure into a [`MessageHandler`] that ignores state changes.
pub struct FnHandler<F>(pub F);

impl<F> MessageHandler for FnHandler<F>
where
    F: Fn(InboundMessage) + Send + Sync,
{
    fn on_message(&self, message: InboundMessage) {
        (self.0)(message)
    }
}

/// A contact's online flag flipped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerStateChange {
    pub peer: Fingerprint,
    pub online: bool,
}

pub(crate) type StateSender = mpsc::UnboundedSender<PeerStateChange>;

/// Handle to the running dispatcher task.
pub(crate) struct Dispatcher {
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    /// Start dispatching; returns the handle and the state-change sender.
    pub(crate) fn spawn(
        messages: InboundReceiver,
        handler: Arc<dyn MessageHandler>,
        stats: Arc<TransportStats>,
    ) -> (Self, StateSender) {
        let (state_tx, state_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(messages, state_rx, handler, stats, cancel.clone()));
        (
            Self {
                cancel,
                task: Mutex::new(Some(task)),
            },
            state_tx,
        )
    }

    /// Deliver whatever is already queued, then stop.
    pub(crate) async fn stop(&self) {
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "Dispatcher ended abnormally");
            }
        }
    }
}

async fn run(
    mut messages: InboundReceiver,
    mut states: mpsc::UnboundedReceiver<PeerStateChange>,
    handler: Arc<dyn MessageHandler>,
    stats: Arc<TransportStats>,
    cancel: CancellationToken,
) {
    let deliver = |message: InboundMessage| {
        stats.record_received(message.via);
        handler.on_message(message);
    };

    loop {
        tokio::select! {
            biased;
            Some(change) = states.recv() => {
                handler.on_peer_state(&change.peer, change.online);
            }
            message = messages.recv() => match message {
                Some(message) => deliver(message),
                None => break,
            },
            _ = cancel.cancelled() => break,
        }
    }

    messages.close();
    while let Ok(message) = messages.try_recv() {
        deliver(message);
    }
    debug!("Dispatcher stopped");
}
