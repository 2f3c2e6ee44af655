//! Outbound transport abstraction.
//!
//! The daemon only knows how to dial a session, send over it and close it.
//! `smtp` provides the real implementation; tests plug in recording fakes.

pub mod smtp;

use async_trait::async_trait;
use thiserror::Error;

use crate::message::OutboundMessage;

pub use smtp::{SmtpDialer, SmtpSession};

/// Boxed error from a transport backend.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Failures of the dial/send/close capability.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to connect: {0}")]
    Connect(#[source] BoxError),

    #[error("authentication failed: {0}")]
    Auth(#[source] BoxError),

    #[error("invalid TLS setup: {0}")]
    Tls(#[source] BoxError),

    #[error("send failed: {0}")]
    Send(#[source] BoxError),

    #[error("close failed: {0}")]
    Close(#[source] BoxError),
}

/// Opens transport sessions.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    type Session: Session;

    /// Open a new session. Called only when no session is open.
    async fn dial(&self) -> Result<Self::Session, TransportError>;
}

/// An open connection able to carry any number of messages.
#[async_trait]
pub trait Session: Send + 'static {
    /// Transmit one message.
    async fn send(&mut self, message: &OutboundMessage) -> Result<(), TransportError>;

    /// End the session. The session is dropped afterwards whatever the result.
    async fn close(&mut self) -> Result<(), TransportError>;
}
