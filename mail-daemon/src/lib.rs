//! maild - asynchronous outbound mail dispatch.
//!
//! Producers hand messages to a single background daemon that owns one SMTP
//! session, opens it lazily on the first message and closes it after an idle
//! window so relays with short connection limits never cut it first.
//!
//! ## Architecture
//!
//! ```text
//! EmailCtx → build_message → Mailer ═ dispatch queue ═▶ Daemon → Dialer/Session → relay
//! ```
//!
//! Delivery is best effort: failures are logged and reported to an optional
//! observer, never returned to the producer.

pub mod config;
pub mod daemon;
pub mod mailer;
pub mod message;
pub mod queue;
pub mod transport;

// Re-export commonly used types
pub use config::{Config, DaemonConfig, SmtpConfig, TlsMode};
pub use daemon::{
    CloseReason, Daemon, DaemonHandle, DaemonState, DaemonStats, DeliveryEvent, DeliveryObserver,
};
pub use mailer::{start, Mailer, MailerCell, SendError};
pub use message::{build_message, EmailAddress, EmailCtx, MessageError, OutboundMessage};
pub use queue::{dispatch_queue, DispatchError, QueueReceiver, QueueSender};
pub use transport::{Dialer, Session, SmtpDialer, SmtpSession, TransportError};
