//! Core retry middleware and peer-selection primitives for a unary RPC
//! outbound client.
//!
//! This crate has no opinion on transport, wire format, or service
//! dispatch — it consumes two small traits ([`retry::Outbound`] and
//! [`peer::Transport`]) and provides the engineering around them: per-attempt
//! deadlines with replayable request bodies ([`retry`]), and two
//! interchangeable peer-selection strategies ([`peer::heap_list`] and
//! [`peer::round_robin`]) built on a shared [`lifecycle`] state machine.

pub mod backoff;
pub mod buffer;
pub mod context;
pub mod error;
pub mod lifecycle;
pub mod peer;
pub mod replay;
pub mod retry;

pub use context::CallContext;
pub use error::{Error, MultiError};
