//! Producer-facing handle and the one-shot daemon initializer.
//!
//! The application's composition root owns a `MailerCell`. The first `init`
//! spawns the daemon; every later call is a no-op that hands back the same
//! `Mailer`, so there is never more than one daemon or one SMTP session.

use std::sync::{Arc, Mutex, OnceLock};

use thiserror::Error;
use tracing::{info, warn};

use crate::config::DaemonConfig;
use crate::daemon::{Daemon, DaemonHandle, DaemonStats, DeliveryObserver};
use crate::message::{build_message, EmailCtx, MessageError, OutboundMessage};
use crate::queue::{dispatch_queue, DispatchError, QueueSender};
use crate::transport::Dialer;

/// Errors returned by `Mailer::send`.
#[derive(Debug, Error)]
pub enum SendError {
    #[error(transparent)]
    Message(#[from] MessageError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

/// Cloneable handle used by producers to submit mail.
#[derive(Clone)]
pub struct Mailer {
    queue: QueueSender,
}

impl Mailer {
    pub fn new(queue: QueueSender) -> Self {
        Self { queue }
    }

    /// Build the message and hand it to the daemon.
    ///
    /// Returns once the daemon has accepted it. Delivery failures after that
    /// point are only logged (and reported to the observer, if any).
    pub async fn send(&self, ctx: &EmailCtx) -> Result<(), SendError> {
        let message = build_message(ctx)?;
        self.enqueue(message).await?;
        Ok(())
    }

    /// Hand an already built message to the daemon.
    pub async fn enqueue(&self, message: OutboundMessage) -> Result<(), DispatchError> {
        self.queue.enqueue(message).await
    }

    /// Close the queue. The daemon finishes what it holds and exits.
    pub fn shutdown(&self) {
        self.queue.close();
    }

    pub fn is_closed(&self) -> bool {
        self.queue.is_closed()
    }
}

/// Spawn a daemon and return its producer handle. Unguarded: every call
/// starts another daemon with its own queue.
pub fn start<D: Dialer>(
    config: DaemonConfig,
    dialer: D,
    observer: Option<Arc<dyn DeliveryObserver>>,
) -> (Mailer, DaemonHandle) {
    let (sender, receiver) = dispatch_queue();
    let mut daemon = Daemon::new(config, dialer, receiver);
    if let Some(observer) = observer {
        daemon = daemon.with_observer(observer);
    }
    (Mailer::new(sender), daemon.spawn())
}

struct Started {
    mailer: Mailer,
    daemon: Mutex<Option<DaemonHandle>>,
}

/// One-shot guard around daemon startup.
#[derive(Default)]
pub struct MailerCell {
    started: OnceLock<Started>,
}

impl MailerCell {
    pub const fn new() -> Self {
        Self {
            started: OnceLock::new(),
        }
    }

    /// Start the daemon on first call; later calls ignore their arguments.
    ///
    /// Must be called from within a tokio runtime.
    pub fn init<D: Dialer>(&self, config: DaemonConfig, dialer: D) -> Mailer {
        self.init_inner(config, dialer, None)
    }

    /// Like `init`, with an outcome observer attached to the daemon.
    pub fn init_with_observer<D: Dialer>(
        &self,
        config: DaemonConfig,
        dialer: D,
        observer: Arc<dyn DeliveryObserver>,
    ) -> Mailer {
        self.init_inner(config, dialer, Some(observer))
    }

    fn init_inner<D: Dialer>(
        &self,
        config: DaemonConfig,
        dialer: D,
        observer: Option<Arc<dyn DeliveryObserver>>,
    ) -> Mailer {
        let mut spawned = false;
        let started = self.started.get_or_init(|| {
            spawned = true;
            let (mailer, daemon) = start(config, dialer, observer);
            Started {
                mailer,
                daemon: Mutex::new(Some(daemon)),
            }
        });

        if !spawned {
            info!("mailer_init_ignored");
        }
        started.mailer.clone()
    }

    /// The handle, if the daemon was started.
    pub fn get(&self) -> Option<Mailer> {
        self.started.get().map(|s| s.mailer.clone())
    }

    /// Close the queue and wait for the daemon to exit.
    ///
    /// Returns the daemon's final counters on the first call after `init`,
    /// `None` otherwise.
    pub async fn shutdown(&self) -> Option<DaemonStats> {
        let started = self.started.get()?;
        started.mailer.shutdown();

        let handle = started
            .daemon
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()?;

        match handle.join().await {
            Ok(stats) => Some(stats),
            Err(e) => {
                warn!(error = %e, "mail_daemon_join_failed");
                None
            }
        }
    }
}
