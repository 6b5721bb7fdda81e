//! Frame-synchronized automation engine.
//!
//! `vigil` schedules visual-automation tasks against a live frame feed: a
//! single executor thread acquires frames, classifies the active scene, and
//! dispatches enabled tasks in a fixed priority order, one at a time. Tasks
//! suspend only through cancellation-aware wait primitives, so shutdown,
//! pause, and disablement all take effect within milliseconds.
//!
//! The engine owns no capture backend and no UI: frames come in through the
//! [`FrameSource`] trait and observations go out through the [`EventSink`]
//! trait.
//!
//! ```no_run
//! use std::sync::Arc;
//! use vigil::{EngineConfig, NullSink, TaskExecutor};
//!
//! # fn source() -> Box<dyn vigil::FrameSource> { unimplemented!() }
//! # fn main() -> vigil::Result<()> {
//! let mut executor = TaskExecutor::new(source(), EngineConfig::default(), Arc::new(NullSink));
//! // executor.register_scene(...); executor.register_task(...);
//! let handle = executor.spawn()?;
//! handle.resume();
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used)]

pub mod config;
pub mod error;
pub mod events;
pub mod executor;
pub mod frame;
pub mod handler;
pub mod scene;
pub mod stats;
pub mod task;

pub use config::{EngineConfig, SettingsStore, SettingsValidator, TaskSettings};
pub use error::{EngineError, Result};
pub use events::{ChannelSink, EngineEvent, EventSink, NullSink};
pub use executor::{ExecContext, ExecutorHandle, ExecutorStatus, TaskExecutor};
pub use frame::{Frame, FrameSource, FrameSourceFactory, select_frame_source};
pub use handler::Handler;
pub use scene::{Scene, SceneDetector};
pub use stats::FrameStats;
pub use task::{Task, TaskHandle, TaskStatus};
