//! Dispatch queue between producers and the mail daemon.
//!
//! ## Architecture
//!
//! ```text
//! producers ──enqueue──▶ QueueSender ═▶ QueueReceiver ──▶ daemon loop ──▶ SMTP session
//! ```
//!
//! Many producers, exactly one consumer. Messages are received in arrival
//! order and each producer waits until the daemon has taken its message.

pub mod dispatch;

pub use dispatch::{dispatch_queue, DispatchError, QueueReceiver, QueueSender};
