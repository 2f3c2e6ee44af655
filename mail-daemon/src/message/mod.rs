//! Message construction.
//!
//! ```text
//! EmailCtx → build_message() → OutboundMessage → dispatch queue
//! ```

pub mod builder;
pub mod types;

pub use builder::{build_message, MessageError};
pub use types::{EmailAddress, EmailCtx, OutboundMessage};
