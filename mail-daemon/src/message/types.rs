//! Message types handed between producers and the daemon.
//!
//! - `EmailCtx`: structured fields a caller fills in to send an email
//! - `OutboundMessage`: the built, transport-ready message on the queue

use std::collections::BTreeMap;

use lettre::address::Envelope;
use serde::{Deserialize, Serialize};

/// A mailbox: address plus optional display name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailAddress {
    /// Display name, e.g. "Jane Doe"
    #[serde(default)]
    pub name: Option<String>,
    /// Bare address, e.g. "jane@example.com"
    pub email: String,
}

impl EmailAddress {
    /// Address without a display name.
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            name: None,
            email: email.into(),
        }
    }

    /// Address with a display name.
    pub fn named(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            email: email.into(),
        }
    }
}

/// Everything needed to send one email.
///
/// Extra `headers` must not repeat the addressing, subject or body headers;
/// those are set from the dedicated fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailCtx {
    pub from: EmailAddress,
    #[serde(default)]
    pub to: Vec<EmailAddress>,
    #[serde(default)]
    pub cc: Vec<EmailAddress>,
    #[serde(default)]
    pub bcc: Vec<EmailAddress>,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub plain_body: String,
    /// Sent as a `text/html` alternative when present and non-empty
    #[serde(default)]
    pub html_body: Option<String>,
    /// Extra headers, written as given. A name matching a reserved header
    /// (`From`, `To`, `Cc`, `Bcc`, `Subject`, `Content-Type`,
    /// `Content-Transfer-Encoding`, `MIME-Version`, any case) does not
    /// override the field it shadows: building fails with
    /// `MessageError::ReservedHeader` instead.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl EmailCtx {
    /// A plain-text email to a single recipient.
    pub fn new(from: EmailAddress, to: EmailAddress, subject: impl Into<String>) -> Self {
        Self {
            from,
            to: vec![to],
            cc: Vec::new(),
            bcc: Vec::new(),
            subject: subject.into(),
            plain_body: String::new(),
            html_body: None,
            headers: BTreeMap::new(),
        }
    }

    pub fn plain_body(mut self, body: impl Into<String>) -> Self {
        self.plain_body = body.into();
        self
    }

    pub fn html_body(mut self, body: impl Into<String>) -> Self {
        self.html_body = Some(body.into());
        self
    }

    pub fn cc(mut self, address: EmailAddress) -> Self {
        self.cc.push(address);
        self
    }

    pub fn bcc(mut self, address: EmailAddress) -> Self {
        self.bcc.push(address);
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// A fully formatted message ready for transport.
///
/// Immutable once built. The envelope carries every recipient, bcc included;
/// the formatted bytes do not carry a Bcc header.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    envelope: Envelope,
    subject: String,
    formatted: Vec<u8>,
}

impl OutboundMessage {
    /// Wrap a message built elsewhere.
    pub fn new(envelope: Envelope, subject: impl Into<String>, formatted: Vec<u8>) -> Self {
        Self {
            envelope,
            subject: subject.into(),
            formatted,
        }
    }

    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    /// Subject, kept for logging.
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// RFC 5322 bytes, headers and body.
    pub fn formatted(&self) -> &[u8] {
        &self.formatted
    }

    /// Number of envelope recipients.
    pub fn recipient_count(&self) -> usize {
        self.envelope.to().len()
    }
}
