//! Scene catalogue and two-phase detection.

use crate::frame::Frame;
use tracing::debug;

/// A named, detectable situation in the visual feed.
///
/// Scenes are stateless with respect to the detector but may keep internal
/// state of their own (template caches, thresholds).
pub trait Scene: Send {
    /// Scene name, used for events and status.
    fn name(&self) -> &str;

    /// Whether this scene is present in the given frame.
    fn detect(&mut self, frame: &Frame) -> bool;

    /// Optional capability tag used to restrict targeted scans.
    fn category(&self) -> Option<&str> {
        None
    }
}

/// Ordered scene catalogue with a current/previous cache.
///
/// Detection is two-phase to keep the common case cheap: the previously
/// active scene is re-checked first ("optimistic" path) and only on a miss
/// is the full catalogue scanned in registration order.
#[derive(Default)]
pub struct SceneDetector {
    scenes: Vec<Box<dyn Scene>>,
    current: Option<usize>,
    last: Option<usize>,
}

impl SceneDetector {
    /// Create an empty detector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a scene to the catalogue. Registration order is the
    /// tie-break order for detection.
    pub fn register(&mut self, scene: Box<dyn Scene>) {
        self.scenes.push(scene);
    }

    /// Start a new cycle: forget the current scene but remember it for the
    /// optimistic re-check.
    pub fn reset(&mut self) {
        self.last = self.current.take();
    }

    /// Run two-phase detection against the frame, returning the index of
    /// the selected scene.
    pub fn detect(&mut self, frame: &Frame) -> Option<usize> {
        self.detect_filtered(frame, None)
    }

    /// Like [`detect`](Self::detect) but the full scan only considers
    /// scenes whose [`Scene::category`] matches `category`. The optimistic
    /// re-check is not filtered: a still-matching active scene stays
    /// current regardless of its tag.
    pub fn detect_filtered(&mut self, frame: &Frame, category: Option<&str>) -> Option<usize> {
        let latest = self.current.or(self.last);
        if let Some(idx) = latest {
            if self.scenes[idx].detect(frame) {
                self.current = Some(idx);
                return self.current;
            }
        }

        for idx in 0..self.scenes.len() {
            if Some(idx) == latest {
                continue;
            }
            if let Some(wanted) = category {
                if self.scenes[idx].category() != Some(wanted) {
                    continue;
                }
            }
            if self.scenes[idx].detect(frame) {
                debug!("scene changed to '{}'", self.scenes[idx].name());
                self.current = Some(idx);
                return self.current;
            }
        }

        if self.current.is_some() {
            debug!("scene changed to none");
            self.current = None;
        }
        None
    }

    /// Index of the currently active scene.
    pub fn current(&self) -> Option<usize> {
        self.current
    }

    /// Name of the currently active scene.
    pub fn current_name(&self) -> Option<&str> {
        self.current.map(|idx| self.scenes[idx].name())
    }

    /// Name of the scene at `idx`.
    pub fn name_of(&self, idx: usize) -> &str {
        self.scenes[idx].name()
    }

    /// Number of registered scenes.
    pub fn len(&self) -> usize {
        self.scenes.len()
    }

    /// Returns `true` when no scenes are registered.
    pub fn is_empty(&self) -> bool {
        self.scenes.is_empty()
    }
}
