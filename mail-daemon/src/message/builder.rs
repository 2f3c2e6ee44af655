//! Message construction with lettre's builder.
//!
//! Turns an `EmailCtx` into an `OutboundMessage`. Pure and synchronous; the
//! daemon never sees anything but the finished bytes and envelope.

use lettre::address::AddressError;
use lettre::message::header::{ContentType, HeaderName, HeaderValue};
use lettre::message::{Mailbox, MultiPart};
use lettre::Message;
use thiserror::Error;
use tracing::debug;

use super::types::{EmailAddress, EmailCtx, OutboundMessage};

/// Headers owned by the dedicated `EmailCtx` fields or by the MIME body.
const RESERVED_HEADERS: &[&str] = &[
    "from",
    "to",
    "cc",
    "bcc",
    "subject",
    "content-type",
    "content-transfer-encoding",
    "mime-version",
];

/// Errors raised while building a message.
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("invalid address {address:?}: {source}")]
    InvalidAddress {
        address: String,
        #[source]
        source: AddressError,
    },

    #[error("header {0:?} is set from the message fields and cannot be overridden")]
    ReservedHeader(String),

    #[error("invalid header name {0:?}")]
    InvalidHeaderName(String),

    #[error("failed to build message: {0}")]
    Build(#[from] lettre::error::Error),
}

fn mailbox(address: &EmailAddress) -> Result<Mailbox, MessageError> {
    let email = address
        .email
        .trim()
        .parse::<lettre::Address>()
        .map_err(|source| MessageError::InvalidAddress {
            address: address.email.clone(),
            source,
        })?;
    let name = address.name.clone().filter(|n| !n.trim().is_empty());
    Ok(Mailbox::new(name, email))
}

/// Build a transport-ready message from its structured fields.
///
/// The plain body is always present; a non-empty HTML body turns the message
/// into `multipart/alternative`.
pub fn build_message(ctx: &EmailCtx) -> Result<OutboundMessage, MessageError> {
    let mut builder = Message::builder()
        .from(mailbox(&ctx.from)?)
        .subject(ctx.subject.clone());

    for address in &ctx.to {
        builder = builder.to(mailbox(address)?);
    }
    for address in &ctx.cc {
        builder = builder.cc(mailbox(address)?);
    }
    for address in &ctx.bcc {
        builder = builder.bcc(mailbox(address)?);
    }

    for (name, value) in &ctx.headers {
        let lowered = name.trim().to_ascii_lowercase();
        if RESERVED_HEADERS.contains(&lowered.as_str()) {
            return Err(MessageError::ReservedHeader(name.clone()));
        }
        let header_name = HeaderName::new_from_ascii(name.trim().to_string())
            .map_err(|_| MessageError::InvalidHeaderName(name.clone()))?;
        builder = builder.raw_header(HeaderValue::new(header_name, value.clone()));
    }

    let message = match ctx.html_body.as_deref().filter(|html| !html.is_empty()) {
        Some(html) => builder.multipart(MultiPart::alternative_plain_html(
            ctx.plain_body.clone(),
            html.to_string(),
        ))?,
        None => builder
            .header(ContentType::TEXT_PLAIN)
            .body(ctx.plain_body.clone())?,
    };

    let outbound = OutboundMessage::new(
        message.envelope().clone(),
        ctx.subject.clone(),
        message.formatted(),
    );

    debug!(
        subject = %outbound.subject(),
        recipients = outbound.recipient_count(),
        size_bytes = outbound.formatted().len(),
        "message_built"
    );

    Ok(outbound)
}
