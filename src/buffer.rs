//! Buffer module for envelopes awaiting transmission.
//!
//! The buffer is a plain ordered container: append at the back, drain
//! everything in insertion order. It enforces no capacity; deciding when to
//! flush is the agent's job.

use tracing::debug;

use crate::protocol::Envelope;

/// Statistics about buffer operations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BufferStats {
    /// Total number of envelopes appended
    pub envelopes_appended: u64,

    /// Total number of envelopes handed out by `drain`
    pub envelopes_drained: u64,

    /// Number of non-empty drains
    pub drains: u64,
}

/// Ordered holding area for formatted envelopes.
///
/// Owned by a single sampling loop, so no internal locking is needed.
#[derive(Debug, Default)]
pub struct EnvelopeBuffer {
    /// Envelopes in append order
    buffer: Vec<Envelope>,

    /// Statistics about buffer operations
    stats: BufferStats,
}

impl EnvelopeBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a buffer pre-sized for `capacity` envelopes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
            stats: BufferStats::default(),
        }
    }

    /// Add an envelope at the back of the buffer.
    pub fn append(&mut self, envelope: Envelope) {
        self.stats.envelopes_appended += 1;
        self.buffer.push(envelope);
    }

    /// Take every buffered envelope, oldest first, leaving the buffer empty.
    ///
    /// Draining an empty buffer returns an empty vector.
    pub fn drain(&mut self) -> Vec<Envelope> {
        let capacity = self.buffer.capacity();
        let envelopes = std::mem::replace(&mut self.buffer, Vec::with_capacity(capacity));

        if !envelopes.is_empty() {
            self.stats.drains += 1;
            self.stats.envelopes_drained += envelopes.len() as u64;
            debug!(count = envelopes.len(), "Buffer drained");
        }

        envelopes
    }

    /// Get the current number of envelopes in the buffer.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Get current buffer statistics.
    pub fn stats(&self) -> &BufferStats {
        &self.stats
    }
}
