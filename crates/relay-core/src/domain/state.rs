//! Message and processor state machines, plus queue counts.

use serde::{Deserialize, Serialize};

/// Delivery state of a message held by a transport.
///
/// State transitions:
/// - Pending -> InFlight -> Acknowledged
/// - Pending -> InFlight -> Pending (lease expired or abandoned; redelivered)
/// - Pending -> InFlight -> Failed (delivery count exhausted; dead-lettered)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageState {
    /// Waiting for delivery.
    Pending,

    /// Delivered to a consumer, lease not yet settled.
    InFlight,

    /// Completed by a consumer and removed from the queue.
    Acknowledged,

    /// Given up on (dead-lettered). Never redelivered.
    Failed,
}

impl MessageState {
    /// Eligible for delivery?
    pub fn is_deliverable(self) -> bool {
        matches!(self, MessageState::Pending)
    }
}

/// Lifecycle of a push consumer.
///
/// Stopped -> Starting -> Running -> Stopping -> Stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProcessorState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl ProcessorState {
    /// Anything but `Stopped` has spawned tasks; `start` is refused then.
    pub fn is_active(self) -> bool {
        !matches!(self, ProcessorState::Stopped)
    }
}

/// Per-queue message counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub pending: usize,
    pub in_flight: usize,
    /// Total messages completed since the queue was created.
    pub acknowledged: u64,
    pub dead_lettered: usize,
}

impl QueueCounts {
    /// Messages still held by the queue (pending or leased).
    pub fn depth(&self) -> usize {
        self.pending + self.in_flight
    }
}
