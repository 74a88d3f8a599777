//! The weir buffering layer.
//!
//! This library implements the bounded queue that sits between ingestion and
//! the output actions. Four backings are available: a preallocated ring, a
//! linked list, an on-disk ring of segment files, and a direct pass-through.
//! Memory-backed queues configured with a file prefix transparently promote
//! to a disk-backed child queue under back-pressure and demote once drained.

#![deny(clippy::all)]
#![allow(clippy::module_name_repetitions)]

#[macro_use]
extern crate tracing;

pub mod config;
pub use config::{QueueConfig, QueueKind};

mod internal_events;

pub mod queue;
pub use queue::{Consumer, ConsumerError, EnqueueError, Queue, QueueError, QueueSettings, RunMode};

pub mod serial;
pub use serial::{ObjectId, SerialError, SyslogTime};

pub mod stream;
pub use stream::{StreamError, StreamReader, StreamWriter};

use std::fmt::Debug;

/// An item that can be buffered.
///
/// Queueable items must round-trip through the record framing in [`serial`]
/// so that disk-backed queues can spill and reload them. The severity hook
/// feeds the discard watermark; items without a severity are never discarded.
pub trait Bufferable: Debug + Send + Sized + 'static {
    /// Writes this item as one framed record.
    fn serialize(&self, strm: &mut StreamWriter) -> Result<(), SerialError>;

    /// Reads one framed record back.
    fn deserialize(strm: &mut StreamReader) -> Result<Self, SerialError>;

    /// Syslog severity (0..7), if the item carries one.
    fn severity(&self) -> Option<u8> {
        None
    }
}
