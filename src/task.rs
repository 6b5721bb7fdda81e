//! Task contract, shared task state, and the derived status machine.

use crate::config::{SettingsValidator, TaskSettings};
use crate::error::Result;
use crate::events::{EngineEvent, EventSink};
use crate::executor::{ExecContext, ExecutorStatus, lock};
use crate::handler::Handler;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// A unit of per-frame work, called by the executor each cycle while
/// enabled.
pub trait Task: Send {
    /// Task name; must be unique within one executor.
    fn name(&self) -> &str;

    /// Human-readable description for status display.
    fn description(&self) -> &str {
        ""
    }

    /// Default values for this task's persisted settings.
    fn default_settings(&self) -> BTreeMap<String, Value> {
        BTreeMap::new()
    }

    /// Optional validation hook applied when a setting is changed.
    fn settings_validator(&self) -> Option<SettingsValidator> {
        None
    }

    /// Called once when the task is registered.
    fn on_create(&mut self, _handle: &Arc<TaskHandle>) {}

    /// Called once at executor teardown.
    fn on_destroy(&mut self) {}

    /// Per-frame hook. May suspend only through the context's wait/sleep
    /// primitives; a `TaskDisabled` error unwinds just this invocation.
    fn run_frame(&mut self, ctx: &mut ExecContext) -> Result<()>;
}

/// Task status derived from the flag tuple; never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// Task is disabled.
    NotStarted,
    /// Task is enabled and waiting for its turn in the cycle.
    InQueue,
    /// Task is enabled but the executor pause gate is closed.
    Paused,
    /// The task's frame hook is executing right now.
    Running,
}

impl TaskStatus {
    /// Pure projection from a flag snapshot.
    pub fn project(enabled: bool, paused: bool, running: bool) -> Self {
        if running {
            Self::Running
        } else if enabled {
            if paused { Self::Paused } else { Self::InQueue }
        } else {
            Self::NotStarted
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::NotStarted => "Not Started",
            Self::InQueue => "In Queue",
            Self::Paused => "Paused",
            Self::Running => "Running",
        };
        f.write_str(label)
    }
}

/// Shared, observer-readable state of one registered task.
///
/// The executor thread mutates the flags; external observers (status
/// reporting, a front-end) read them concurrently. Every field is either a
/// single atomic or a whole value behind a mutex, so reads may be one
/// cycle stale but are never torn.
pub struct TaskHandle {
    name: String,
    description: String,
    enabled: AtomicBool,
    paused: AtomicBool,
    running: AtomicBool,
    done: AtomicBool,
    error_count: AtomicU32,
    /// Epoch millis of the last dispatch; 0 = never ran.
    last_execute_ms: AtomicU64,
    info: Mutex<BTreeMap<String, Value>>,
    settings: Mutex<TaskSettings>,
    handler: OnceLock<Handler>,
    status: Arc<ExecutorStatus>,
    events: Arc<dyn EventSink>,
    cancel: CancellationToken,
}

impl TaskHandle {
    pub(crate) fn new(
        name: String,
        description: String,
        settings: TaskSettings,
        status: Arc<ExecutorStatus>,
        events: Arc<dyn EventSink>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            name,
            description,
            enabled: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            running: AtomicBool::new(false),
            done: AtomicBool::new(false),
            error_count: AtomicU32::new(0),
            last_execute_ms: AtomicU64::new(0),
            info: Mutex::new(BTreeMap::new()),
            settings: Mutex::new(settings),
            handler: OnceLock::new(),
            status,
            events,
            cancel,
        }
    }

    /// Task name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Task description.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Whether the task is eligible for scheduling.
    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// The task's own pause display flag (the gate itself is
    /// executor-wide).
    pub fn paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Whether the task's frame hook is executing right now.
    pub fn running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Whether the task finished and is skipped until re-enabled.
    pub fn done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    /// Number of faults raised from this task's frame hook.
    pub fn error_count(&self) -> u32 {
        self.error_count.load(Ordering::SeqCst)
    }

    /// Wall-clock time of the last dispatch.
    pub fn last_execute_time(&self) -> Option<SystemTime> {
        match self.last_execute_ms.load(Ordering::SeqCst) {
            0 => None,
            ms => Some(UNIX_EPOCH + Duration::from_millis(ms)),
        }
    }

    /// Status derived from an atomically-read flag snapshot.
    pub fn status(&self) -> TaskStatus {
        TaskStatus::project(self.enabled(), self.paused(), self.running())
    }

    /// Whether the executor may dispatch this task.
    pub fn can_run(&self) -> bool {
        self.enabled() && !self.done()
    }

    /// Make the task eligible for scheduling. The first call after a
    /// disable clears accumulated info; repeating it is a no-op beyond
    /// clearing `done`.
    pub fn enable(&self) {
        if !self.enabled.swap(true, Ordering::SeqCst) {
            lock(&self.info).clear();
        }
        self.done.store(false, Ordering::SeqCst);
        self.emit_changed();
    }

    /// Remove the task from scheduling. If it is the executor's current
    /// task, the reference is cleared and the task's frame processing
    /// unwinds at its next wait checkpoint.
    pub fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
        self.status.clear_current_task_if(&self.name);
        self.emit_changed();
    }

    /// Mark the task finished, then disable it. It is skipped until
    /// [`enable`](Self::enable) clears the flag.
    pub fn set_done(&self) {
        self.done.store(true, Ordering::SeqCst);
        self.disable();
    }

    /// Close the executor-wide pause gate. Exposed on the task for
    /// front-end convenience; the gate affects every task.
    pub fn pause(&self) {
        self.status.pause();
        self.paused.store(true, Ordering::SeqCst);
        self.events.emit(EngineEvent::ExecutorPaused(true));
        self.emit_changed();
    }

    /// Reopen the executor-wide pause gate.
    pub fn unpause(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.status.resume();
        self.events.emit(EngineEvent::ExecutorPaused(false));
        self.emit_changed();
    }

    /// Access the task's persisted settings.
    pub fn settings(&self) -> MutexGuard<'_, TaskSettings> {
        lock(&self.settings)
    }

    /// The task's auxiliary delayed-job worker, created on first use and
    /// owned exclusively by this task afterwards. Only the executor thread
    /// (while running this task) should call this.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker thread cannot be spawned.
    pub fn handler(&self) -> Result<&Handler> {
        if let Some(handler) = self.handler.get() {
            return Ok(handler);
        }
        let handler = Handler::new(&self.name, self.cancel.clone())?;
        Ok(self.handler.get_or_init(|| handler))
    }

    /// Set one info entry.
    pub fn info_set(&self, key: impl Into<String>, value: impl Into<Value>) {
        lock(&self.info).insert(key.into(), value.into());
    }

    /// Increment a numeric info entry, creating it at zero.
    pub fn info_incr(&self, key: &str, by: i64) {
        let mut info = lock(&self.info);
        let current = info.get(key).and_then(Value::as_i64).unwrap_or(0);
        info.insert(key.to_owned(), Value::from(current + by));
    }

    /// Read one info entry.
    pub fn info_get(&self, key: &str) -> Option<Value> {
        lock(&self.info).get(key).cloned()
    }

    /// Clear all accumulated info.
    pub fn info_clear(&self) {
        lock(&self.info).clear();
    }

    /// Snapshot of the whole info map.
    pub fn info_snapshot(&self) -> BTreeMap<String, Value> {
        lock(&self.info).clone()
    }

    /// Log at info level and mirror the message into the info map.
    pub fn log_info(&self, message: impl Into<String>, notify: bool) {
        let message = message.into();
        info!("[{}] {message}", self.name);
        self.info_set("Log", message.clone());
        if notify {
            self.notify(message, None, false);
        }
    }

    /// Log at error level and mirror the message into the info map.
    pub fn log_error(&self, message: impl Into<String>, notify: bool) {
        let message = message.into();
        error!("[{}] {message}", self.name);
        self.info_set("Error", message.clone());
        if notify {
            self.notify(message, None, true);
        }
    }

    /// Emit a user-facing notification.
    pub fn notify(&self, message: impl Into<String>, title: Option<String>, error: bool) {
        self.events.emit(EngineEvent::Notification {
            message: message.into(),
            title,
            error,
        });
    }

    pub(crate) fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }

    pub(crate) fn mark_executed(&self) {
        let ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        self.last_execute_ms.store(ms, Ordering::SeqCst);
    }

    pub(crate) fn incr_error(&self) -> u32 {
        self.error_count.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn emit_changed(&self) {
        self.events.emit(EngineEvent::TaskChanged {
            task: self.name.clone(),
            status: self.status(),
        });
    }
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("name", &self.name)
            .field("status", &self.status())
            .field("done", &self.done())
            .field("error_count", &self.error_count())
            .finish()
    }
}
