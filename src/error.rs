//! Error types for the automation engine.

/// Top-level error type for the engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Frame capture or capture-backend error.
    #[error("capture error: {0}")]
    Capture(String),

    /// Configuration or settings-store error.
    #[error("config error: {0}")]
    Config(String),

    /// Task execution error raised from a per-frame hook.
    #[error("task error: {0}")]
    Task(String),

    /// Cooperative unwind raised when the current task is disabled while
    /// its frame hook is still executing. Not a fault: caught at the
    /// per-task dispatch boundary and logged at info level.
    #[error("task '{task}' disabled during frame processing")]
    TaskDisabled {
        /// Name of the task that was disabled.
        task: String,
    },

    /// Executor thread error (spawn failure, teardown).
    #[error("executor error: {0}")]
    Executor(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Returns `true` for the cooperative disablement signal, which is
    /// expected control flow rather than a fault.
    pub fn is_disablement(&self) -> bool {
        matches!(self, Self::TaskDisabled { .. })
    }
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, EngineError>;
