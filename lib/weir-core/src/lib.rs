//! Core message model for weir.
//!
//! The central type is [`Message`]: one log record as received on the wire,
//! progressively enriched by the parser chain, shared by reference count
//! across action queues, and serializable into the record format the
//! disk-backed queues persist.

#![deny(clippy::all)]
#![allow(clippy::module_name_repetitions)]

#[macro_use]
extern crate tracing;

pub mod message;
pub use message::{Message, MsgError, MsgRef};

pub mod datetime;
pub use datetime::SyslogTime;

pub mod json;

pub mod pri;

pub mod template;
pub use template::TemplateEntry;
