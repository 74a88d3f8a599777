//! Ingestion listeners.
//!
//! Each source runs its own receive loop on a dedicated thread, builds a
//! [`weir_core::Message`] per datagram/record, stamps provenance metadata,
//! and hands it to the router. Sources stop cooperatively through a shared
//! shutdown flag.

pub mod dtls;
pub mod udp;
pub mod unix;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Handle to a running source thread.
pub struct SourceHandle {
    name: String,
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl SourceHandle {
    pub fn new(name: impl Into<String>, shutdown: Arc<AtomicBool>, thread: JoinHandle<()>) -> Self {
        SourceHandle {
            name: name.into(),
            shutdown,
            thread: Some(thread),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Requests the receive loop to stop and joins it. The loops poll the
    /// flag between blocking receives (all sockets run with a short read
    /// timeout).
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!(source = %self.name, "source thread panicked");
            }
        }
    }
}

impl Drop for SourceHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
