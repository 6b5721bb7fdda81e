//! Frame data and capture-source interfaces.
//!
//! The engine never owns a capture backend; it pulls frames through the
//! narrow [`FrameSource`] trait. Concrete backends (window capture, screen
//! duplication, emulator bridges) live outside the core and are selected
//! once at startup via [`select_frame_source`].

use crate::error::Result;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// One captured frame: an immutable pixel buffer plus dimensions.
///
/// Frames are replaced wholesale each cycle and never mutated in place.
/// Cloning is cheap (the buffer is shared).
#[derive(Clone)]
pub struct Frame {
    data: Arc<[u8]>,
    width: u32,
    height: u32,
    captured_at: Instant,
}

impl Frame {
    /// Create a frame from a pixel buffer and its dimensions.
    pub fn new(data: impl Into<Arc<[u8]>>, width: u32, height: u32) -> Self {
        Self {
            data: data.into(),
            width,
            height,
            captured_at: Instant::now(),
        }
    }

    /// Raw pixel buffer.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Frame width in pixels.
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Frame height in pixels.
    pub fn height(&self) -> u32 {
        self.height
    }

    /// When this frame was captured.
    pub fn captured_at(&self) -> Instant {
        self.captured_at
    }

    /// A frame with a zero dimension is a capture glitch and is discarded.
    pub(crate) fn is_sized(&self) -> bool {
        self.width > 0 && self.height > 0
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.data.len())
            .finish()
    }
}

/// Source of frames for the executor.
pub trait FrameSource: Send {
    /// Return the latest frame, or `None` if none is available right now.
    /// Absence of a frame is a valid outcome, not a fault.
    fn get_frame(&mut self) -> Option<Frame>;

    /// Whether capture is currently permitted (e.g. the target window is
    /// not minimized). Gates both frame acquisition and timed waits.
    fn should_capture(&self) -> bool {
        true
    }

    /// Short backend name for logs.
    fn name(&self) -> &str;
}

/// A candidate capture backend for the one-time capability probe.
pub struct FrameSourceFactory {
    /// Backend name for logs.
    pub name: &'static str,
    /// Build the backend. Errors mean the backend is unavailable on this
    /// system, not a fatal condition.
    pub build: Box<dyn FnOnce() -> Result<Box<dyn FrameSource>> + Send>,
}

impl FrameSourceFactory {
    /// Convenience constructor.
    pub fn new(
        name: &'static str,
        build: impl FnOnce() -> Result<Box<dyn FrameSource>> + Send + 'static,
    ) -> Self {
        Self {
            name,
            build: Box::new(build),
        }
    }
}

/// Walk candidate backends in preference order and return the first one
/// that builds and delivers a usable probe frame.
///
/// This replaces runtime capability dispatch with a single probe at
/// startup: backends that fail to build or return a blank/zero-sized frame
/// are skipped with a log line.
pub fn select_frame_source(candidates: Vec<FrameSourceFactory>) -> Option<Box<dyn FrameSource>> {
    for candidate in candidates {
        let name = candidate.name;
        match (candidate.build)() {
            Ok(mut source) => match source.get_frame() {
                Some(frame) if frame.is_sized() => {
                    info!("selected capture backend '{name}'");
                    return Some(source);
                }
                Some(frame) => {
                    warn!(
                        "capture backend '{name}' probe frame has bad size {}x{}, skipping",
                        frame.width(),
                        frame.height()
                    );
                }
                None => {
                    info!("capture backend '{name}' produced no probe frame, skipping");
                }
            },
            Err(e) => {
                info!("capture backend '{name}' unavailable: {e}");
            }
        }
    }
    None
}
