//! Notifications for RT → host communication.
//!
//! The tick path reports xruns, cancellations and failures through a lock-free SPSC queue.
//! Messages are `Copy` and fixed-size so pushing one never allocates. The host side drains
//! the queue at its own pace; a full queue drops the message rather than block the tick.

use crate::buffer::CompId;
use crate::task::TaskId;
use rtrb::{Consumer, Producer, RingBuffer};

/// Capacity for the notification queue.
pub const NOTIFICATION_QUEUE_CAPACITY: usize = 128;

/// Producer half, owned by the RT side.
pub type NotificationTx = Producer<Notification>;
/// Consumer half, owned by the host side.
pub type NotificationRx = Consumer<Notification>;

/// Identifier of a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PipelineId(pub u32);

/// Creates a new notification queue pair.
///
/// Returns (producer for RT, consumer for host).
pub fn new_notification_queue() -> (NotificationTx, NotificationRx) {
    RingBuffer::new(NOTIFICATION_QUEUE_CAPACITY)
}

/// Messages sent from the RT side to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notification {
    /// A gateway under- or over-ran.
    Xrun {
        pipeline: PipelineId,
        /// Component that saw the xrun.
        comp: CompId,
        /// Bytes missing or dropped.
        bytes: usize,
    },
    /// A task was cancelled by its scheduler.
    TaskCancelled {
        task: TaskId,
    },
    /// A pipeline stopped on an error.
    PipelineError {
        pipeline: PipelineId,
        /// Negative errno.
        errno: i32,
    },
    /// Stream position report.
    PositionUpdate {
        pipeline: PipelineId,
        /// Bytes moved by the host endpoint since start.
        host_bytes: u64,
        /// Clock ticks when sampled.
        timestamp: u64,
    },
}

impl Notification {
    /// Pipeline the message refers to, if any.
    pub fn pipeline(&self) -> Option<PipelineId> {
        match self {
            Notification::Xrun { pipeline, .. }
            | Notification::PipelineError { pipeline, .. }
            | Notification::PositionUpdate { pipeline, .. } => Some(*pipeline),
            Notification::TaskCancelled { .. } => None,
        }
    }

    /// Returns a human-readable description (for debugging).
    pub fn description(&self) -> &'static str {
        match self {
            Notification::Xrun { .. } => "Xrun",
            Notification::TaskCancelled { .. } => "TaskCancelled",
            Notification::PipelineError { .. } => "PipelineError",
            Notification::PositionUpdate { .. } => "PositionUpdate",
        }
    }
}

/// Push without blocking. Returns false if the queue was full.
#[inline]
pub fn notify(tx: &mut NotificationTx, msg: Notification) -> bool {
    tx.push(msg).is_ok()
}

/// Drain all pending notifications.
pub fn drain_notifications(rx: &mut NotificationRx) -> Vec<Notification> {
    let mut out = Vec::with_capacity(rx.slots());
    while let Ok(msg) = rx.pop() {
        out.push(msg);
    }
    out
}
