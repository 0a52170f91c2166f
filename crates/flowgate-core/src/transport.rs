//! Collaborators provided by the socket layer.

use crate::queue::Chunk;
use flowgate_proto::{Direction, SocketInfo};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use thiserror::Error;

/// Why the transport refused released data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TransportError {
    /// No buffer space right now; retried on the next space notification
    #[error("No buffer space")]
    NoMemory,
    /// The socket can no longer carry data
    #[error("Socket closed")]
    Closed,
}

/// A refused chunk handed back to the engine.
#[derive(Debug)]
pub struct Rejected {
    pub chunk: Chunk,
    pub error: TransportError,
}

/// The socket's own send/receive machinery.
///
/// Called with the socket locked; implementations must not call back into
/// the engine.
pub trait Transport: Send + Sync {
    /// Hand released bytes back to the send path (outbound) or to the
    /// application's receive buffer (inbound).
    fn reinject(&self, direction: Direction, chunk: Chunk) -> Result<(), Rejected>;

    /// Tear the connection down after a drop verdict.
    fn defunct(&self);

    /// Complete a write shutdown that was held back for pending data.
    fn shutdown_write(&self) {}
}

/// Source of filtering policy for sockets.
pub trait PolicyLookup: Send + Sync {
    /// Control unit the socket must be filtered by; 0 when unfiltered.
    fn control_unit(&self, info: &SocketInfo) -> u32;

    /// Changes whenever policy is reloaded.
    fn generation(&self) -> u64;
}

/// Policy that routes every socket to one control unit.
#[derive(Debug, Default)]
pub struct StaticPolicy {
    unit: AtomicU32,
    generation: AtomicU64,
}

impl StaticPolicy {
    pub fn new(unit: u32) -> Self {
        Self {
            unit: AtomicU32::new(unit),
            generation: AtomicU64::new(1),
        }
    }

    /// Switch to another control unit, starting a new policy generation.
    pub fn set_unit(&self, unit: u32) {
        self.unit.store(unit, Ordering::Relaxed);
        self.generation.fetch_add(1, Ordering::Relaxed);
    }
}

impl PolicyLookup for StaticPolicy {
    fn control_unit(&self, _info: &SocketInfo) -> u32 {
        self.unit.load(Ordering::Relaxed)
    }

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::Relaxed)
    }
}
