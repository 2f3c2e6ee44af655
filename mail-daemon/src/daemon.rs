//! The mail daemon: a single task that owns the transport session.
//!
//! Every iteration races the next queued message against the idle window:
//!
//! - message: dial if no session is open, then send. A failed dial drops the
//!   message and leaves the daemon idle; the next message dials again. A
//!   failed send drops the message and keeps the session.
//! - idle window elapsed: close the open session, if any. A failed close is
//!   logged and the session is discarded anyway.
//!
//! The idle timer restarts on every iteration. The loop ends when the queue
//! is closed and drained.

use std::fmt;
use std::sync::Arc;

use tokio::task::{JoinError, JoinHandle};
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::config::DaemonConfig;
use crate::message::OutboundMessage;
use crate::queue::QueueReceiver;
use crate::transport::{Dialer, Session};

/// Connection state of the daemon loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    /// No open session
    Idle,
    /// A session is open and reused for every message
    Connected,
    /// Queue closed, loop exited
    Terminated,
}

/// Why a session was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Idle,
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Idle => f.write_str("idle"),
            CloseReason::Shutdown => f.write_str("shutdown"),
        }
    }
}

/// Outcome notifications for observers. Purely informational.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryEvent {
    Connected,
    DialFailed { subject: String, error: String },
    Sent { subject: String },
    SendFailed { subject: String, error: String },
    SessionClosed { reason: CloseReason },
    CloseFailed { reason: CloseReason, error: String },
}

/// Hook receiving every `DeliveryEvent`, called from the daemon task.
///
/// Must not block: the daemon waits for it before handling the next event.
pub trait DeliveryObserver: Send + Sync + 'static {
    fn on_event(&self, event: &DeliveryEvent);
}

impl<F> DeliveryObserver for F
where
    F: Fn(&DeliveryEvent) + Send + Sync + 'static,
{
    fn on_event(&self, event: &DeliveryEvent) {
        self(event)
    }
}

/// Counters reported when the daemon exits.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DaemonStats {
    pub received: u64,
    pub sent: u64,
    pub dropped: u64,
    pub dials: u64,
    pub dial_failures: u64,
    pub send_failures: u64,
    pub closes: u64,
    pub close_failures: u64,
}

/// Handle to the spawned daemon task.
#[derive(Debug)]
pub struct DaemonHandle {
    join: JoinHandle<DaemonStats>,
}

impl DaemonHandle {
    /// Wait for the daemon to exit. It exits only after the queue is closed.
    pub async fn join(self) -> Result<DaemonStats, JoinError> {
        self.join.await
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

/// Daemon loop state. Build with `Daemon::new`, then `spawn` or `run`.
pub struct Daemon<D: Dialer> {
    config: DaemonConfig,
    dialer: D,
    queue: QueueReceiver,
    session: Option<D::Session>,
    state: DaemonState,
    stats: DaemonStats,
    observer: Option<Arc<dyn DeliveryObserver>>,
}

enum Wake {
    Message(Option<OutboundMessage>),
    IdleTimeout,
}

impl<D: Dialer> Daemon<D> {
    pub fn new(config: DaemonConfig, dialer: D, queue: QueueReceiver) -> Self {
        Self {
            config,
            dialer,
            queue,
            session: None,
            state: DaemonState::Idle,
            stats: DaemonStats::default(),
            observer: None,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn DeliveryObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Run the loop on its own task.
    pub fn spawn(self) -> DaemonHandle {
        DaemonHandle {
            join: tokio::spawn(self.run()),
        }
    }

    /// Run the loop until the queue is closed and drained.
    pub async fn run(mut self) -> DaemonStats {
        info!(
            idle_timeout_ms = self.config.idle_timeout.as_millis() as u64,
            close_on_exit = self.config.close_on_exit,
            "mail_daemon_started"
        );

        loop {
            let idle_timeout = self.config.idle_timeout;
            let wake = tokio::select! {
                message = self.queue.recv() => Wake::Message(message),
                _ = sleep(idle_timeout) => Wake::IdleTimeout,
            };

            match wake {
                Wake::Message(Some(message)) => self.handle_message(message).await,
                Wake::Message(None) => {
                    info!(state = ?self.state, "mail_daemon_queue_closed");
                    break;
                }
                Wake::IdleTimeout => self.handle_idle().await,
            }
        }

        self.shutdown().await;

        info!(
            received = self.stats.received,
            sent = self.stats.sent,
            dropped = self.stats.dropped,
            dials = self.stats.dials,
            dial_failures = self.stats.dial_failures,
            send_failures = self.stats.send_failures,
            closes = self.stats.closes,
            close_failures = self.stats.close_failures,
            "mail_daemon_stopped"
        );

        self.stats
    }

    async fn handle_message(&mut self, message: OutboundMessage) {
        self.stats.received += 1;
        info!(
            subject = %message.subject(),
            recipients = message.recipient_count(),
            state = ?self.state,
            "mail_daemon_message_received"
        );

        if self.session.is_none() {
            self.stats.dials += 1;
            match self.dialer.dial().await {
                Ok(session) => {
                    self.session = Some(session);
                    self.state = DaemonState::Connected;
                    info!("mail_daemon_connected");
                    self.emit(DeliveryEvent::Connected);
                }
                Err(e) => {
                    self.stats.dial_failures += 1;
                    self.stats.dropped += 1;
                    error!(
                        subject = %message.subject(),
                        error = %e,
                        "mail_daemon_dial_failed"
                    );
                    self.emit(DeliveryEvent::DialFailed {
                        subject: message.subject().to_string(),
                        error: e.to_string(),
                    });
                    return;
                }
            }
        }

        let Some(session) = self.session.as_mut() else {
            return;
        };

        match session.send(&message).await {
            Ok(()) => {
                self.stats.sent += 1;
                info!(
                    subject = %message.subject(),
                    recipients = message.recipient_count(),
                    "mail_send_complete"
                );
                self.emit(DeliveryEvent::Sent {
                    subject: message.subject().to_string(),
                });
            }
            Err(e) => {
                self.stats.send_failures += 1;
                self.stats.dropped += 1;
                error!(
                    subject = %message.subject(),
                    error = %e,
                    "mail_send_failed"
                );
                self.emit(DeliveryEvent::SendFailed {
                    subject: message.subject().to_string(),
                    error: e.to_string(),
                });
            }
        }
    }

    async fn handle_idle(&mut self) {
        if self.session.is_some() {
            self.close_session(CloseReason::Idle).await;
        }
    }

    async fn shutdown(&mut self) {
        if self.session.is_some() {
            if self.config.close_on_exit {
                self.close_session(CloseReason::Shutdown).await;
            } else {
                warn!("mail_daemon_session_left_open");
                // Dropped unclosed.
                self.session = None;
            }
        }
        self.state = DaemonState::Terminated;
    }

    async fn close_session(&mut self, reason: CloseReason) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        self.state = DaemonState::Idle;
        self.stats.closes += 1;

        match session.close().await {
            Ok(()) => {
                info!(reason = %reason, "mail_daemon_session_closed");
                self.emit(DeliveryEvent::SessionClosed { reason });
            }
            Err(e) => {
                self.stats.close_failures += 1;
                warn!(reason = %reason, error = %e, "mail_daemon_close_failed");
                self.emit(DeliveryEvent::CloseFailed {
                    reason,
                    error: e.to_string(),
                });
            }
        }
    }

    fn emit(&self, event: DeliveryEvent) {
        if let Some(observer) = &self.observer {
            observer.on_event(&event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use lettre::address::Envelope;

    use crate::queue::dispatch_queue;
    use crate::transport::TransportError;

    #[derive(Default)]
    struct Counters {
        dials: AtomicUsize,
        sends: AtomicUsize,
        closes: AtomicUsize,
    }

    struct CountingDialer {
        counters: Arc<Counters>,
        fail_dial: bool,
        fail_close: bool,
    }

    struct CountingSession {
        counters: Arc<Counters>,
        fail_close: bool,
    }

    #[async_trait]
    impl Dialer for CountingDialer {
        type Session = CountingSession;

        async fn dial(&self) -> Result<CountingSession, TransportError> {
            self.counters.dials.fetch_add(1, Ordering::SeqCst);
            if self.fail_dial {
                return Err(TransportError::Connect("connection refused".into()));
            }
            Ok(CountingSession {
                counters: Arc::clone(&self.counters),
                fail_close: self.fail_close,
            })
        }
    }

    #[async_trait]
    impl Session for CountingSession {
        async fn send(&mut self, _message: &OutboundMessage) -> Result<(), TransportError> {
            self.counters.sends.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn close(&mut self) -> Result<(), TransportError> {
            self.counters.closes.fetch_add(1, Ordering::SeqCst);
            if self.fail_close {
                return Err(TransportError::Close("broken pipe".into()));
            }
            Ok(())
        }
    }

    fn message(subject: &str) -> OutboundMessage {
        let envelope = Envelope::new(
            Some("from@example.com".parse().unwrap()),
            vec!["to@example.com".parse().unwrap()],
        )
        .unwrap();
        OutboundMessage::new(envelope, subject, b"body".to_vec())
    }

    fn daemon(fail_dial: bool, fail_close: bool) -> (Daemon<CountingDialer>, Arc<Counters>) {
        let counters = Arc::new(Counters::default());
        let (_sender, receiver) = dispatch_queue();
        let dialer = CountingDialer {
            counters: Arc::clone(&counters),
            fail_dial,
            fail_close,
        };
        (Daemon::new(DaemonConfig::default(), dialer, receiver), counters)
    }

    #[tokio::test]
    async fn test_first_message_dials_then_reuses_session() {
        let (mut daemon, counters) = daemon(false, false);
        assert_eq!(daemon.state, DaemonState::Idle);

        daemon.handle_message(message("A")).await;
        assert_eq!(daemon.state, DaemonState::Connected);
        daemon.handle_message(message("B")).await;

        assert_eq!(counters.dials.load(Ordering::SeqCst), 1);
        assert_eq!(counters.sends.load(Ordering::SeqCst), 2);
        assert_eq!(daemon.stats.sent, 2);
    }

    #[tokio::test]
    async fn test_dial_failure_drops_message_and_stays_idle() {
        let (mut daemon, counters) = daemon(true, false);

        daemon.handle_message(message("A")).await;
        daemon.handle_message(message("B")).await;

        assert_eq!(daemon.state, DaemonState::Idle);
        assert_eq!(counters.dials.load(Ordering::SeqCst), 2);
        assert_eq!(counters.sends.load(Ordering::SeqCst), 0);
        assert_eq!(daemon.stats.dropped, 2);
        assert_eq!(daemon.stats.dial_failures, 2);
    }

    #[tokio::test]
    async fn test_idle_closes_open_session_once() {
        let (mut daemon, counters) = daemon(false, false);

        daemon.handle_idle().await;
        assert_eq!(counters.closes.load(Ordering::SeqCst), 0);

        daemon.handle_message(message("A")).await;
        daemon.handle_idle().await;
        daemon.handle_idle().await;

        assert_eq!(daemon.state, DaemonState::Idle);
        assert_eq!(counters.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_close_failure_still_discards_session() {
        let (mut daemon, counters) = daemon(false, true);

        daemon.handle_message(message("A")).await;
        daemon.handle_idle().await;
        assert_eq!(daemon.state, DaemonState::Idle);
        assert_eq!(daemon.stats.close_failures, 1);

        daemon.handle_message(message("B")).await;
        assert_eq!(counters.dials.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_observer_sees_events_in_order() {
        let (daemon, _counters) = daemon(false, false);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let mut daemon = daemon.with_observer(Arc::new(move |event: &DeliveryEvent| {
            sink.lock().unwrap().push(event.clone());
        }));

        daemon.handle_message(message("A")).await;
        daemon.handle_idle().await;

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                DeliveryEvent::Connected,
                DeliveryEvent::Sent {
                    subject: "A".to_string()
                },
                DeliveryEvent::SessionClosed {
                    reason: CloseReason::Idle
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_shutdown_respects_close_on_exit() {
        let (mut daemon, counters) = daemon(false, false);
        daemon.handle_message(message("A")).await;
        daemon.shutdown().await;
        assert_eq!(daemon.state, DaemonState::Terminated);
        assert_eq!(counters.closes.load(Ordering::SeqCst), 1);

        let (mut daemon, counters) = self::daemon(false, false);
        daemon.config.close_on_exit = false;
        daemon.handle_message(message("A")).await;
        daemon.shutdown().await;
        assert_eq!(daemon.state, DaemonState::Terminated);
        assert_eq!(counters.closes.load(Ordering::SeqCst), 0);
    }
}
