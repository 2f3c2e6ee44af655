//! Rendezvous hand-off channel between producers and the daemon.
//!
//! `enqueue` returns only once the daemon has taken the message off the
//! channel, so a busy daemon holds producers back. The channel buffer is one
//! slot; the receipt acknowledgement is what makes the hand-off blocking.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info};

use crate::message::OutboundMessage;

/// Slots in the underlying channel.
const CHANNEL_CAPACITY: usize = 1;

/// Errors returned to producers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("dispatch queue is closed")]
    Closed,
}

/// A message waiting for the daemon, plus the producer's receipt slot.
struct Handoff {
    message: OutboundMessage,
    accepted: oneshot::Sender<()>,
}

/// Create a connected sender/receiver pair.
pub fn dispatch_queue() -> (QueueSender, QueueReceiver) {
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (closed_tx, closed_rx) = watch::channel(false);

    let sender = QueueSender {
        tx,
        closed: Arc::new(closed_tx),
    };
    let receiver = QueueReceiver {
        rx,
        closed: closed_rx,
        closing: false,
    };
    (sender, receiver)
}

/// Producer side. Cheap to clone; every clone feeds the same daemon.
#[derive(Clone)]
pub struct QueueSender {
    tx: mpsc::Sender<Handoff>,
    closed: Arc<watch::Sender<bool>>,
}

impl QueueSender {
    /// Hand a message to the daemon.
    ///
    /// Suspends until the daemon has received it. Once this returns `Ok` the
    /// message belongs to the daemon; its delivery outcome is only logged.
    /// Dropping the future before it resolves withdraws the message.
    pub async fn enqueue(&self, message: OutboundMessage) -> Result<(), DispatchError> {
        if self.is_closed() {
            return Err(DispatchError::Closed);
        }

        let (accepted, receipt) = oneshot::channel();
        self.tx
            .send(Handoff { message, accepted })
            .await
            .map_err(|_| DispatchError::Closed)?;

        receipt.await.map_err(|_| DispatchError::Closed)
    }

    /// Signal the daemon to stop after the work already handed over.
    ///
    /// Idempotent. Later `enqueue` calls fail with `DispatchError::Closed`.
    pub fn close(&self) {
        let was_closed = self.closed.send_replace(true);
        if !was_closed {
            info!("dispatch_queue_closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow() || self.tx.is_closed()
    }
}

/// Consumer side, owned by the daemon.
pub struct QueueReceiver {
    rx: mpsc::Receiver<Handoff>,
    closed: watch::Receiver<bool>,
    closing: bool,
}

impl QueueReceiver {
    /// Take the next message, acknowledging receipt to its producer.
    ///
    /// Returns `None` once the queue has been closed (or every sender
    /// dropped) and nothing is left to drain. Cancel-safe: a message is only
    /// taken off the channel by a call that returns it.
    pub async fn recv(&mut self) -> Option<OutboundMessage> {
        loop {
            if !self.closing && *self.closed.borrow_and_update() {
                self.begin_close();
            }

            let handoff = if self.closing {
                self.rx.recv().await?
            } else {
                tokio::select! {
                    handoff = self.rx.recv() => handoff?,
                    changed = self.closed.changed() => {
                        if changed.is_err() {
                            self.begin_close();
                        }
                        continue;
                    }
                }
            };

            if handoff.accepted.send(()).is_err() {
                // Producer stopped waiting before the daemon got here.
                debug!(subject = %handoff.message.subject(), "dispatch_message_withdrawn");
                continue;
            }

            return Some(handoff.message);
        }
    }

    fn begin_close(&mut self) {
        self.closing = true;
        self.rx.close();
    }
}
