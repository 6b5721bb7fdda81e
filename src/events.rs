//! Events published by the engine to external observers.
//!
//! The engine depends only on the [`EventSink`] trait passed in at
//! construction; there is no process-wide bus. Emission is fire-and-forget:
//! the executor thread never blocks on an observer and drops events when a
//! channel-backed sink is full.

use crate::task::TaskStatus;
use crossbeam_channel::{Receiver, Sender, bounded};
use tracing::debug;

/// An event emitted by the executor or a task.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// A task's flags changed (enabled/paused/done).
    TaskChanged {
        /// Task name.
        task: String,
        /// Status derived from the flag snapshot at emission time.
        status: TaskStatus,
    },
    /// A frame was acquired for the current cycle.
    FrameAvailable {
        /// Frame width in pixels.
        width: u32,
        /// Frame height in pixels.
        height: u32,
    },
    /// The currently detected scene (`None` = no scene matches).
    SceneChanged {
        /// Name of the active scene, if any.
        scene: Option<String>,
    },
    /// Frame-rate telemetry update.
    FrameTime {
        /// Mean frame interval in milliseconds over the rolling window.
        mean_ms: f64,
        /// Derived frames per second, rounded.
        fps: u32,
    },
    /// The executor-wide pause gate toggled.
    ExecutorPaused(bool),
    /// User-facing notification raised by a task.
    Notification {
        /// Notification body.
        message: String,
        /// Optional title.
        title: Option<String>,
        /// Whether this notification reports an error.
        error: bool,
    },
}

/// Abstract emit capability handed to the engine at construction.
pub trait EventSink: Send + Sync {
    /// Deliver one event. Must not block.
    fn emit(&self, event: EngineEvent);
}

/// Sink backed by a bounded crossbeam channel.
///
/// Events are delivered with `try_send`; when the consumer falls behind the
/// channel fills up and further events are dropped with a debug log.
pub struct ChannelSink {
    tx: Sender<EngineEvent>,
}

impl ChannelSink {
    /// Create a sink and the receiving end for the observer.
    pub fn new(capacity: usize) -> (Self, Receiver<EngineEvent>) {
        let (tx, rx) = bounded(capacity);
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: EngineEvent) {
        if self.tx.try_send(event).is_err() {
            debug!("event channel full, dropping event");
        }
    }
}

/// Sink that discards every event. Useful for headless runs and tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: EngineEvent) {}
}
