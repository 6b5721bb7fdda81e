//! The task executor: main polling loop, cancellation-aware waits, and the
//! external control surface.
//!
//! One dedicated thread runs the whole engine: it pulls frames from the
//! [`FrameSource`], runs scene detection, then dispatches every enabled
//! task's per-frame hook in registration order. Tasks never run
//! concurrently with each other; mutual exclusion is structural. All
//! blocking goes through [`ExecContext::sleep`], which polls the
//! cancellation token and the current task's enabled flag at millisecond
//! granularity.

use crate::config::{EngineConfig, SettingsStore, TaskSettings};
use crate::error::{EngineError, Result};
use crate::events::{EngineEvent, EventSink};
use crate::frame::{Frame, FrameSource};
use crate::scene::{Scene, SceneDetector};
use crate::stats::FrameStats;
use crate::task::{Task, TaskHandle};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Granularity of the cooperative wait loop. Bounds cancellation and
/// disablement latency.
const POLL_GRANULARITY: Duration = Duration::from_millis(1);

/// Max age of the cycle's frame while tasks are still being dispatched.
/// Past this, a fresh frame is acquired before the next task.
const FRAME_FRESHNESS: Duration = Duration::from_millis(500);

/// Retry delay between `wait_until` attempts.
const WAIT_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Lock a mutex, recovering the value if a writer panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Executor state shared between the executor thread and external
/// observers.
///
/// Every field is a single atomic or a whole value behind a mutex:
/// observers may read a one-cycle-old snapshot but never a torn one.
pub struct ExecutorStatus {
    paused: AtomicBool,
    pause_start: Mutex<Instant>,
    /// Absolute wake time of the active timed wait.
    wake_deadline: Mutex<Instant>,
    current_task: Mutex<Option<Arc<TaskHandle>>>,
    current_scene: Mutex<Option<String>>,
    last_scene: Mutex<Option<String>>,
}

impl ExecutorStatus {
    /// New status with the pause gate closed; the executor runs its first
    /// cycle only after [`resume`](Self::resume).
    pub(crate) fn new() -> Self {
        let now = Instant::now();
        Self {
            paused: AtomicBool::new(true),
            pause_start: Mutex::new(now),
            wake_deadline: Mutex::new(now),
            current_task: Mutex::new(None),
            current_scene: Mutex::new(None),
            last_scene: Mutex::new(None),
        }
    }

    /// Whether the executor-wide pause gate is closed.
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Name of the task whose frame hook is executing, if any.
    pub fn current_task_name(&self) -> Option<String> {
        lock(&self.current_task)
            .as_ref()
            .map(|task| task.name().to_owned())
    }

    /// Name of the currently detected scene, if any.
    pub fn current_scene_name(&self) -> Option<String> {
        lock(&self.current_scene).clone()
    }

    /// Name of the scene active in the previous cycle, if any.
    pub fn last_scene_name(&self) -> Option<String> {
        lock(&self.last_scene).clone()
    }

    pub(crate) fn pause(&self) {
        if !self.paused.swap(true, Ordering::SeqCst) {
            *lock(&self.pause_start) = Instant::now();
        }
    }

    pub(crate) fn resume(&self) {
        if self.paused.swap(false, Ordering::SeqCst) {
            // Shift the wake deadline forward by the pause duration so an
            // interrupted wait still gets its full remaining time.
            let paused_for = lock(&self.pause_start).elapsed();
            *lock(&self.wake_deadline) += paused_for;
        }
    }

    pub(crate) fn set_wake_deadline(&self, deadline: Instant) {
        *lock(&self.wake_deadline) = deadline;
        // A wait published mid-pause owes only the pause time overlapping
        // it; restart the pause clock at publish time.
        if self.is_paused() {
            *lock(&self.pause_start) = Instant::now();
        }
    }

    pub(crate) fn wake_deadline(&self) -> Instant {
        *lock(&self.wake_deadline)
    }

    pub(crate) fn current_task(&self) -> Option<Arc<TaskHandle>> {
        lock(&self.current_task).clone()
    }

    pub(crate) fn set_current_task(&self, task: Option<Arc<TaskHandle>>) {
        *lock(&self.current_task) = task;
    }

    /// Clear the current-task reference if it names the given task.
    pub(crate) fn clear_current_task_if(&self, name: &str) {
        let mut current = lock(&self.current_task);
        if current.as_ref().is_some_and(|task| task.name() == name) {
            *current = None;
        }
    }

    pub(crate) fn set_current_scene(&self, scene: Option<String>) {
        *lock(&self.current_scene) = scene;
    }

    pub(crate) fn rotate_scene(&self) {
        let mut current = lock(&self.current_scene);
        *lock(&self.last_scene) = current.take();
    }
}

/// Execution context handed to tasks during their per-frame hook.
///
/// Owns the frame source, scene catalogue, and telemetry; exposes the
/// cancellation-aware wait primitives every task must use to suspend.
pub struct ExecContext {
    source: Box<dyn FrameSource>,
    detector: SceneDetector,
    stats: FrameStats,
    frame: Option<Frame>,
    config: EngineConfig,
    status: Arc<ExecutorStatus>,
    events: Arc<dyn EventSink>,
    cancel: CancellationToken,
    /// Task whose frame hook is being dispatched. Unlike the observable
    /// `status.current_task`, this survives an external `disable()` so the
    /// wait primitives can still observe the flag flip and unwind.
    active_task: Option<Arc<TaskHandle>>,
}

impl ExecContext {
    /// Engine timing configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Frame-rate telemetry.
    pub fn stats(&self) -> &FrameStats {
        &self.stats
    }

    /// The event sink, for tasks that emit their own notifications.
    pub fn events(&self) -> &Arc<dyn EventSink> {
        &self.events
    }

    /// Whether shutdown has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// The frame acquired for the current cycle, if any.
    pub fn current_frame(&self) -> Option<&Frame> {
        self.frame.as_ref()
    }

    /// Name of the currently detected scene.
    pub fn current_scene(&self) -> Option<&str> {
        self.detector.current_name()
    }

    /// The cycle's frame, acquiring a new one if none is cached.
    ///
    /// # Errors
    ///
    /// Propagates the disablement signal from the internal wait.
    pub fn frame(&mut self) -> Result<Option<Frame>> {
        if let Some(frame) = self.frame.clone() {
            return Ok(Some(frame));
        }
        self.next_frame()
    }

    /// Acquire a fresh frame, waiting up to the scene-wait timeout.
    ///
    /// Resets the per-cycle scene cache first. Returns `Ok(None)` on
    /// timeout or cancellation; absence of a frame is a valid outcome,
    /// not a fault. Zero-sized frames are discarded with a warning.
    ///
    /// # Errors
    ///
    /// Propagates the disablement signal from the internal wait.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        self.reset_scene();
        let start = Instant::now();
        let timeout = self.config.scene_wait_timeout();

        while !self.cancel.is_cancelled() {
            if self.source.should_capture() {
                if let Some(frame) = self.source.get_frame() {
                    if frame.is_sized() {
                        self.events.emit(EngineEvent::FrameAvailable {
                            width: frame.width(),
                            height: frame.height(),
                        });
                        self.frame = Some(frame.clone());
                        return Ok(Some(frame));
                    }
                    warn!(
                        "captured wrong size frame: {}x{}",
                        frame.width(),
                        frame.height()
                    );
                }
            }
            self.sleep(POLL_GRANULARITY)?;
            if start.elapsed() > timeout {
                return Ok(None);
            }
        }
        Ok(None)
    }

    /// Forget the cached frame and the current scene, keeping the scene
    /// for the next optimistic re-check.
    pub fn reset_scene(&mut self) {
        self.frame = None;
        self.detector.reset();
        self.status.rotate_scene();
    }

    /// Cancellation-aware timed sleep; the single blocking primitive.
    ///
    /// Computes an absolute wake time and polls at millisecond
    /// granularity, checking in order: cancellation (returns
    /// immediately), disablement of the current task (unwinds via
    /// `TaskDisabled`), and the wake time — which only counts while the
    /// executor is not paused and the source permits capture. A pause of
    /// duration P shifts the wake time by P, so the wait still gets its
    /// full remaining duration after resume.
    ///
    /// # Errors
    ///
    /// Returns `TaskDisabled` when the current task's enabled flag flips
    /// false mid-wait.
    pub fn sleep(&mut self, timeout: Duration) -> Result<()> {
        self.stats.add_sleep(timeout);
        self.status.set_wake_deadline(Instant::now() + timeout);

        loop {
            if self.cancel.is_cancelled() {
                debug!("cancellation observed, ending sleep early");
                return Ok(());
            }
            if let Some(task) = &self.active_task {
                if !task.enabled() {
                    return Err(EngineError::TaskDisabled {
                        task: task.name().to_owned(),
                    });
                }
            }
            if !self.status.is_paused()
                && self.source.should_capture()
                && Instant::now() >= self.status.wake_deadline()
            {
                return Ok(());
            }
            std::thread::sleep(POLL_GRANULARITY);
        }
    }

    /// Repeatedly acquire a fresh frame and evaluate `condition` until it
    /// yields a value or `timeout` elapses.
    ///
    /// Sleeps the settle delay first. Each attempt runs `pre_action`,
    /// acquires a frame, and evaluates the condition; on success it sleeps
    /// the confirmation delay and returns the value, otherwise it runs
    /// `post_action` (e.g. a corrective click) and retries. A `timeout`
    /// of zero means the engine's default. Timing out returns `Ok(None)`;
    /// it is not an error.
    ///
    /// # Errors
    ///
    /// Propagates the disablement signal from the internal waits.
    pub fn wait_until<T>(
        &mut self,
        mut condition: impl FnMut(&mut ExecContext) -> Option<T>,
        timeout: Duration,
        mut pre_action: Option<&mut dyn FnMut(&mut ExecContext)>,
        mut post_action: Option<&mut dyn FnMut(&mut ExecContext)>,
    ) -> Result<Option<T>> {
        let settle = self.config.settle_delay();
        self.sleep(settle)?;

        let timeout = if timeout.is_zero() {
            self.config.scene_wait_timeout()
        } else {
            timeout
        };
        let start = Instant::now();

        while !self.cancel.is_cancelled() {
            if let Some(pre) = pre_action.as_mut() {
                pre(self);
            }
            if self.next_frame()?.is_some() {
                let result = condition(self);
                self.add_frame_stats();
                if let Some(result) = result {
                    debug!("wait_until condition met");
                    let confirm = self.config.confirm_delay();
                    self.sleep(confirm)?;
                    return Ok(Some(result));
                }
            }
            if let Some(post) = post_action.as_mut() {
                post(self);
            }
            if start.elapsed() > timeout {
                info!("wait_until timed out after {timeout:?}");
                break;
            }
            self.sleep(WAIT_RETRY_DELAY)?;
        }
        Ok(None)
    }

    /// Wait until a scene is detected, optionally restricted to scenes
    /// with the given category tag. Returns the scene name.
    ///
    /// # Errors
    ///
    /// Propagates the disablement signal from the internal waits.
    pub fn wait_scene(
        &mut self,
        category: Option<&str>,
        timeout: Duration,
        pre_action: Option<&mut dyn FnMut(&mut ExecContext)>,
        post_action: Option<&mut dyn FnMut(&mut ExecContext)>,
    ) -> Result<Option<String>> {
        self.wait_until(
            |ctx| ctx.detect_scene_in(category),
            timeout,
            pre_action,
            post_action,
        )
    }

    /// Run two-phase scene detection against the cycle's frame and
    /// publish the result. Returns the selected scene's name.
    pub fn detect_scene(&mut self) -> Option<String> {
        self.detect_scene_in(None)
    }

    /// Scene detection with an optional category filter for the full
    /// scan (the optimistic re-check is unfiltered).
    pub fn detect_scene_in(&mut self, category: Option<&str>) -> Option<String> {
        let frame = self.frame.clone()?;
        let selected = self.detector.detect_filtered(&frame, category);
        let name = selected.map(|idx| self.detector.name_of(idx).to_owned());
        self.status.set_current_scene(name.clone());
        name
    }

    /// Record the cycle in the telemetry window and emit derived values.
    pub(crate) fn add_frame_stats(&mut self) {
        self.stats.add_frame();
        if let Some(fps) = self.stats.fps() {
            self.events.emit(EngineEvent::FrameTime {
                mean_ms: self.stats.mean_ms(),
                fps,
            });
            self.events.emit(EngineEvent::SceneChanged {
                scene: self.status.current_scene_name(),
            });
        }
    }
}

struct TaskEntry {
    handle: Arc<TaskHandle>,
    task: Box<dyn Task>,
}

/// The scheduling engine. Register scenes and tasks, then [`spawn`] the
/// dedicated executor thread.
///
/// [`spawn`]: Self::spawn
pub struct TaskExecutor {
    ctx: ExecContext,
    tasks: Vec<TaskEntry>,
    settings_store: Option<SettingsStore>,
}

impl TaskExecutor {
    /// Create an executor over the given frame source. The pause gate
    /// starts closed; call [`ExecutorHandle::resume`] to begin scheduling.
    pub fn new(
        source: Box<dyn FrameSource>,
        config: EngineConfig,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            ctx: ExecContext {
                source,
                detector: SceneDetector::new(),
                stats: FrameStats::new(),
                frame: None,
                config,
                status: Arc::new(ExecutorStatus::new()),
                events,
                cancel: CancellationToken::new(),
                active_task: None,
            },
            tasks: Vec::new(),
            settings_store: None,
        }
    }

    /// Persist task settings through the given store.
    pub fn with_settings_store(mut self, store: SettingsStore) -> Self {
        self.settings_store = Some(store);
        self
    }

    /// Append a scene to the catalogue. Registration order is the
    /// detection tie-break order.
    pub fn register_scene(&mut self, scene: Box<dyn Scene>) {
        self.ctx.detector.register(scene);
    }

    /// Register a task. Loads its settings, builds the shared handle, and
    /// fires `on_create`. Tasks start disabled.
    ///
    /// # Errors
    ///
    /// Returns an error if the task's settings blob cannot be loaded.
    pub fn register_task(&mut self, mut task: Box<dyn Task>) -> Result<Arc<TaskHandle>> {
        let name = task.name().to_owned();
        if self.tasks.iter().any(|entry| entry.handle.name() == name) {
            warn!("task '{name}' registered twice");
        }

        let defaults = task.default_settings();
        let mut settings = match &self.settings_store {
            Some(store) => store.load(&name, defaults)?,
            None => TaskSettings::detached(defaults),
        };
        if let Some(validator) = task.settings_validator() {
            settings = settings.with_validator(validator);
        }

        let handle = Arc::new(TaskHandle::new(
            name,
            task.description().to_owned(),
            settings,
            Arc::clone(&self.ctx.status),
            Arc::clone(&self.ctx.events),
            self.ctx.cancel.clone(),
        ));
        task.on_create(&handle);
        self.tasks.push(TaskEntry {
            handle: Arc::clone(&handle),
            task,
        });
        Ok(handle)
    }

    /// The shared cancellation token.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.ctx.cancel.clone()
    }

    /// Start the dedicated executor thread and return the control handle.
    ///
    /// # Errors
    ///
    /// Returns an error if the OS refuses to spawn the thread.
    pub fn spawn(self) -> Result<ExecutorHandle> {
        let cancel = self.ctx.cancel.clone();
        let status = Arc::clone(&self.ctx.status);
        let events = Arc::clone(&self.ctx.events);
        let handles: Vec<Arc<TaskHandle>> =
            self.tasks.iter().map(|entry| Arc::clone(&entry.handle)).collect();

        let thread = std::thread::Builder::new()
            .name("task-executor".to_owned())
            .spawn(move || self.run())
            .map_err(|e| EngineError::Executor(format!("cannot spawn executor thread: {e}")))?;

        Ok(ExecutorHandle {
            cancel,
            status,
            events,
            tasks: handles,
            thread: Some(thread),
        })
    }

    fn run(mut self) {
        info!(
            "task executor started: {} tasks, {} scenes",
            self.tasks.len(),
            self.ctx.detector.len()
        );
        while !self.ctx.cancel.is_cancelled() {
            self.run_cycle();
        }
        for entry in &mut self.tasks {
            entry.task.on_destroy();
        }
        info!("task executor stopped");
    }

    /// One full cycle: frame acquisition, scene detection, task dispatch
    /// with fault isolation and freshness enforcement, telemetry.
    fn run_cycle(&mut self) {
        let ctx = &mut self.ctx;
        match ctx.next_frame() {
            Ok(Some(_)) => {}
            // No frame within the timeout: a valid outcome, restart.
            Ok(None) | Err(_) => return,
        }
        let mut baseline = Instant::now();
        ctx.detect_scene();

        for entry in &mut self.tasks {
            if entry.handle.done() || !entry.handle.enabled() {
                continue;
            }
            ctx.status.set_current_task(Some(Arc::clone(&entry.handle)));
            ctx.active_task = Some(Arc::clone(&entry.handle));
            entry.handle.set_running(true);
            entry.handle.mark_executed();

            match entry.task.run_frame(ctx) {
                Ok(()) => {}
                Err(e) if e.is_disablement() => {
                    info!(
                        "task '{}' disabled, unwinding this frame",
                        entry.handle.name()
                    );
                }
                Err(e) => {
                    let count = entry.handle.incr_error();
                    error!("task '{}' failed (error #{count}): {e}", entry.handle.name());
                }
            }

            ctx.active_task = None;
            ctx.status.set_current_task(None);
            entry.handle.set_running(false);

            if baseline.elapsed() > FRAME_FRESHNESS {
                debug!(
                    "task '{}' ran long, re-acquiring frame before the next task",
                    entry.handle.name()
                );
                let _ = ctx.next_frame();
                baseline = Instant::now();
            }
        }

        ctx.add_frame_stats();
        let _ = ctx.sleep(POLL_GRANULARITY);
    }
}

/// Control and observer surface for a spawned executor.
pub struct ExecutorHandle {
    cancel: CancellationToken,
    status: Arc<ExecutorStatus>,
    events: Arc<dyn EventSink>,
    tasks: Vec<Arc<TaskHandle>>,
    thread: Option<JoinHandle<()>>,
}

impl ExecutorHandle {
    /// Request shutdown. Terminal; the loop exits at its next checkpoint.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Wait for the executor thread to finish.
    ///
    /// # Errors
    ///
    /// Returns an error if the executor thread panicked.
    pub fn join(mut self) -> Result<()> {
        if let Some(thread) = self.thread.take() {
            thread
                .join()
                .map_err(|_| EngineError::Executor("executor thread panicked".to_owned()))?;
        }
        Ok(())
    }

    /// Close the executor-wide pause gate.
    pub fn pause(&self) {
        self.status.pause();
        self.events.emit(EngineEvent::ExecutorPaused(true));
    }

    /// Reopen the pause gate. Returns `false` (gate unchanged) when no
    /// registered task can run.
    pub fn resume(&self) -> bool {
        if !self.tasks.iter().any(|task| task.can_run()) {
            return false;
        }
        self.status.resume();
        self.events.emit(EngineEvent::ExecutorPaused(false));
        true
    }

    /// Whether the pause gate is closed.
    pub fn is_paused(&self) -> bool {
        self.status.is_paused()
    }

    /// Whether shutdown has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Shared cancellation token.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Look up a task handle by name.
    pub fn task(&self, name: &str) -> Option<&Arc<TaskHandle>> {
        self.tasks.iter().find(|task| task.name() == name)
    }

    /// All registered task handles, in registration order.
    pub fn tasks(&self) -> &[Arc<TaskHandle>] {
        &self.tasks
    }

    /// Name of the task currently executing its frame hook.
    pub fn current_task_name(&self) -> Option<String> {
        self.status.current_task_name()
    }

    /// Name of the currently detected scene.
    pub fn current_scene_name(&self) -> Option<String> {
        self.status.current_scene_name()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::events::NullSink;
    use std::sync::atomic::AtomicUsize;

    struct TestSource {
        served: Arc<AtomicUsize>,
    }

    impl TestSource {
        fn new() -> (Self, Arc<AtomicUsize>) {
            let served = Arc::new(AtomicUsize::new(0));
            (
                Self {
                    served: Arc::clone(&served),
                },
                served,
            )
        }
    }

    impl FrameSource for TestSource {
        fn get_frame(&mut self) -> Option<Frame> {
            self.served.fetch_add(1, Ordering::SeqCst);
            Some(Frame::new(vec![0u8; 16], 4, 4))
        }

        fn name(&self) -> &str {
            "test-source"
        }
    }

    struct NoFrameSource;

    impl FrameSource for NoFrameSource {
        fn get_frame(&mut self) -> Option<Frame> {
            None
        }

        fn name(&self) -> &str {
            "no-frames"
        }
    }

    fn test_config() -> EngineConfig {
        EngineConfig {
            scene_wait_timeout_ms: 100,
            settle_delay_ms: 1,
            confirm_delay_ms: 1,
        }
    }

    fn make_executor(source: Box<dyn FrameSource>) -> TaskExecutor {
        let executor = TaskExecutor::new(source, test_config(), Arc::new(NullSink));
        // Open the pause gate; it starts closed.
        executor.ctx.status.resume();
        executor
    }

    struct RecordingTask {
        name: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
        fail: bool,
    }

    impl Task for RecordingTask {
        fn name(&self) -> &str {
            self.name
        }

        fn run_frame(&mut self, _ctx: &mut ExecContext) -> Result<()> {
            lock(&self.log).push(self.name);
            if self.fail {
                return Err(EngineError::Task("boom".to_owned()));
            }
            Ok(())
        }
    }

    fn recording(
        name: &'static str,
        log: &Arc<Mutex<Vec<&'static str>>>,
        fail: bool,
    ) -> Box<dyn Task> {
        Box::new(RecordingTask {
            name,
            log: Arc::clone(log),
            fail,
        })
    }

    // --- sleep / wait primitives -----------------------------------------

    #[test]
    fn sleep_returns_after_the_requested_duration() {
        let (source, _) = TestSource::new();
        let mut executor = make_executor(Box::new(source));

        let start = Instant::now();
        executor.ctx.sleep(Duration::from_millis(30)).unwrap();
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn sleep_observes_cancellation_quickly() {
        let (source, _) = TestSource::new();
        let mut executor = make_executor(Box::new(source));
        let cancel = executor.ctx.cancel.clone();

        let canceller = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            cancel.cancel();
        });

        let start = Instant::now();
        executor.ctx.sleep(Duration::from_secs(10)).unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));
        canceller.join().unwrap();
    }

    #[test]
    fn sleep_unwinds_when_the_current_task_is_disabled() {
        let (source, _) = TestSource::new();
        let mut executor = make_executor(Box::new(source));
        let log = Arc::new(Mutex::new(Vec::new()));
        let handle = executor.register_task(recording("t1", &log, false)).unwrap();
        handle.enable();
        executor.ctx.active_task = Some(Arc::clone(&handle));

        let disabler = {
            let handle = Arc::clone(&handle);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                handle.disable();
            })
        };

        let start = Instant::now();
        let result = executor.ctx.sleep(Duration::from_secs(10));
        assert!(matches!(
            result,
            Err(EngineError::TaskDisabled { task }) if task == "t1"
        ));
        assert!(start.elapsed() < Duration::from_secs(1));
        disabler.join().unwrap();
    }

    #[test]
    fn pause_shifts_the_wake_deadline_by_the_pause_duration() {
        let (source, _) = TestSource::new();
        let mut executor = make_executor(Box::new(source));
        let status = Arc::clone(&executor.ctx.status);

        // Pause 20ms into a 150ms sleep, resume 200ms later: the sleep
        // must not finish before ~350ms total.
        let pauser = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            status.pause();
            std::thread::sleep(Duration::from_millis(200));
            status.resume();
        });

        let start = Instant::now();
        executor.ctx.sleep(Duration::from_millis(150)).unwrap();
        let elapsed = start.elapsed();
        assert!(
            elapsed >= Duration::from_millis(330),
            "sleep returned after {elapsed:?}, pause did not shift the deadline"
        );
        pauser.join().unwrap();
    }

    #[test]
    fn sleep_started_during_a_pause_owes_only_the_overlap() {
        let (source, _) = TestSource::new();
        let mut executor = make_executor(Box::new(source));
        let status = Arc::clone(&executor.ctx.status);

        // Pause well before the sleep starts; that earlier pause time must
        // not be added to the deadline on resume.
        status.pause();
        std::thread::sleep(Duration::from_millis(200));

        let resumer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            status.resume();
        });

        let start = Instant::now();
        executor.ctx.sleep(Duration::from_millis(50)).unwrap();
        let elapsed = start.elapsed();
        // Expected: ~100ms paused + the full 50ms wait.
        assert!(
            elapsed >= Duration::from_millis(145),
            "sleep returned after {elapsed:?}, lost its remaining time"
        );
        assert!(
            elapsed < Duration::from_millis(200),
            "sleep returned after {elapsed:?}, pre-sleep pause time extended the wait"
        );
        resumer.join().unwrap();
    }

    #[test]
    fn next_frame_times_out_without_error() {
        let mut executor = make_executor(Box::new(NoFrameSource));

        let start = Instant::now();
        let frame = executor.ctx.next_frame().unwrap();
        assert!(frame.is_none());
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[test]
    fn wait_until_runs_actions_and_returns_the_result() {
        let (source, _) = TestSource::new();
        let mut executor = make_executor(Box::new(source));

        let attempts = Arc::new(AtomicUsize::new(0));
        let pre_calls = Arc::new(AtomicUsize::new(0));
        let post_calls = Arc::new(AtomicUsize::new(0));

        let condition_attempts = Arc::clone(&attempts);
        let pre_counter = Arc::clone(&pre_calls);
        let post_counter = Arc::clone(&post_calls);

        let mut pre = |_ctx: &mut ExecContext| {
            pre_counter.fetch_add(1, Ordering::SeqCst);
        };
        let mut post = |_ctx: &mut ExecContext| {
            post_counter.fetch_add(1, Ordering::SeqCst);
        };

        let result = executor
            .ctx
            .wait_until(
                move |_ctx| {
                    // Succeeds on the third attempt.
                    if condition_attempts.fetch_add(1, Ordering::SeqCst) + 1 >= 3 {
                        Some("hit")
                    } else {
                        None
                    }
                },
                Duration::ZERO,
                Some(&mut pre),
                Some(&mut post),
            )
            .unwrap();

        assert_eq!(result, Some("hit"));
        assert_eq!(pre_calls.load(Ordering::SeqCst), 3);
        // Post-action fires only on the two failed attempts.
        assert_eq!(post_calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn wait_until_timeout_is_an_absent_result() {
        let (source, _) = TestSource::new();
        let mut executor = make_executor(Box::new(source));

        let result: Option<()> = executor
            .ctx
            .wait_until(
                |_ctx| None,
                Duration::from_millis(30),
                None,
                None,
            )
            .unwrap();
        assert_eq!(result, None);
    }

    #[test]
    fn wait_scene_honors_the_category_filter() {
        struct Tagged;
        impl Scene for Tagged {
            fn name(&self) -> &str {
                "battle"
            }
            fn detect(&mut self, _frame: &Frame) -> bool {
                true
            }
            fn category(&self) -> Option<&str> {
                Some("combat")
            }
        }

        let (source, _) = TestSource::new();
        let mut executor = make_executor(Box::new(source));
        executor.register_scene(Box::new(Tagged));

        let found = executor
            .ctx
            .wait_scene(Some("combat"), Duration::ZERO, None, None)
            .unwrap();
        assert_eq!(found.as_deref(), Some("battle"));

        let missing = executor
            .ctx
            .wait_scene(Some("menu"), Duration::from_millis(30), None, None)
            .unwrap();
        assert_eq!(missing, None);
    }

    // --- cycle dispatch ---------------------------------------------------

    #[test]
    fn cycle_dispatches_only_enabled_tasks() {
        let (source, _) = TestSource::new();
        let mut executor = make_executor(Box::new(source));
        let log = Arc::new(Mutex::new(Vec::new()));

        let t1 = executor.register_task(recording("t1", &log, false)).unwrap();
        let _t2 = executor.register_task(recording("t2", &log, false)).unwrap();
        t1.enable();

        executor.run_cycle();

        assert_eq!(*lock(&log), vec!["t1"]);
        assert!(executor.ctx.status.current_task().is_none());
        assert_eq!(t1.error_count(), 0);
        assert_eq!(executor.ctx.current_scene(), None);
    }

    #[test]
    fn fault_increments_error_count_and_the_cycle_continues() {
        let (source, _) = TestSource::new();
        let mut executor = make_executor(Box::new(source));
        let log = Arc::new(Mutex::new(Vec::new()));

        let t1 = executor.register_task(recording("t1", &log, true)).unwrap();
        let t2 = executor.register_task(recording("t2", &log, false)).unwrap();
        t1.enable();
        t2.enable();

        executor.run_cycle();

        assert_eq!(t1.error_count(), 1);
        assert!(t1.enabled(), "a fault must not disable the task");
        assert_eq!(*lock(&log), vec!["t1", "t2"]);

        // Retried next cycle, no cap.
        executor.run_cycle();
        assert_eq!(t1.error_count(), 2);
    }

    #[test]
    fn disablement_signal_is_not_counted_as_a_fault() {
        struct SelfDisabling {
            handle: Option<Arc<TaskHandle>>,
        }
        impl Task for SelfDisabling {
            fn name(&self) -> &str {
                "quitter"
            }
            fn on_create(&mut self, handle: &Arc<TaskHandle>) {
                self.handle = Some(Arc::clone(handle));
            }
            fn run_frame(&mut self, ctx: &mut ExecContext) -> Result<()> {
                if let Some(handle) = &self.handle {
                    handle.disable();
                }
                // The next wait checkpoint observes the disablement.
                ctx.sleep(Duration::from_millis(5))?;
                Ok(())
            }
        }

        let (source, _) = TestSource::new();
        let mut executor = make_executor(Box::new(source));
        let log = Arc::new(Mutex::new(Vec::new()));
        let quitter = executor
            .register_task(Box::new(SelfDisabling { handle: None }))
            .unwrap();
        let t2 = executor.register_task(recording("t2", &log, false)).unwrap();
        quitter.enable();
        t2.enable();

        executor.run_cycle();

        assert_eq!(quitter.error_count(), 0);
        assert!(!quitter.enabled());
        assert_eq!(*lock(&log), vec!["t2"], "later tasks still run");
    }

    #[test]
    fn long_task_forces_frame_reacquisition() {
        struct SlowTask;
        impl Task for SlowTask {
            fn name(&self) -> &str {
                "slow"
            }
            fn run_frame(&mut self, _ctx: &mut ExecContext) -> Result<()> {
                std::thread::sleep(Duration::from_millis(520));
                Ok(())
            }
        }

        let (source, served) = TestSource::new();
        let mut executor = make_executor(Box::new(source));
        let log = Arc::new(Mutex::new(Vec::new()));

        let slow = executor.register_task(Box::new(SlowTask)).unwrap();
        let t2 = executor.register_task(recording("t2", &log, false)).unwrap();
        slow.enable();
        t2.enable();

        executor.run_cycle();

        assert_eq!(
            served.load(Ordering::SeqCst),
            2,
            "a fresh frame must be acquired after the slow task"
        );
        assert_eq!(*lock(&log), vec!["t2"]);
    }

    #[test]
    fn done_task_is_skipped_until_reenabled() {
        let (source, _) = TestSource::new();
        let mut executor = make_executor(Box::new(source));
        let log = Arc::new(Mutex::new(Vec::new()));

        let t1 = executor.register_task(recording("t1", &log, false)).unwrap();
        t1.enable();

        executor.run_cycle();
        assert_eq!(lock(&log).len(), 1);

        t1.set_done();
        executor.run_cycle();
        assert_eq!(lock(&log).len(), 1, "done task must be skipped");

        t1.enable();
        executor.run_cycle();
        assert_eq!(lock(&log).len(), 2);
    }

    #[test]
    fn only_one_task_runs_at_a_time() {
        struct WatchTask {
            name: &'static str,
            other: Arc<std::sync::OnceLock<Arc<TaskHandle>>>,
            violations: Arc<AtomicUsize>,
        }
        impl Task for WatchTask {
            fn name(&self) -> &str {
                self.name
            }
            fn run_frame(&mut self, _ctx: &mut ExecContext) -> Result<()> {
                if let Some(other) = self.other.get() {
                    if other.running() {
                        self.violations.fetch_add(1, Ordering::SeqCst);
                    }
                }
                Ok(())
            }
        }

        let (source, _) = TestSource::new();
        let mut executor = make_executor(Box::new(source));
        let violations = Arc::new(AtomicUsize::new(0));
        let other_of_a = Arc::new(std::sync::OnceLock::new());
        let other_of_b = Arc::new(std::sync::OnceLock::new());

        let a = executor
            .register_task(Box::new(WatchTask {
                name: "a",
                other: Arc::clone(&other_of_a),
                violations: Arc::clone(&violations),
            }))
            .unwrap();
        let b = executor
            .register_task(Box::new(WatchTask {
                name: "b",
                other: Arc::clone(&other_of_b),
                violations: Arc::clone(&violations),
            }))
            .unwrap();
        other_of_a.set(Arc::clone(&b)).unwrap();
        other_of_b.set(Arc::clone(&a)).unwrap();
        a.enable();
        b.enable();

        for _ in 0..5 {
            executor.run_cycle();
        }
        assert_eq!(violations.load(Ordering::SeqCst), 0);
        assert!(!a.running());
        assert!(!b.running());
    }

    #[test]
    fn scene_is_detected_once_per_cycle() {
        struct AlwaysScene;
        impl Scene for AlwaysScene {
            fn name(&self) -> &str {
                "lobby"
            }
            fn detect(&mut self, _frame: &Frame) -> bool {
                true
            }
        }

        let (source, _) = TestSource::new();
        let mut executor = make_executor(Box::new(source));
        executor.register_scene(Box::new(AlwaysScene));
        let log = Arc::new(Mutex::new(Vec::new()));
        let t1 = executor.register_task(recording("t1", &log, false)).unwrap();
        t1.enable();

        executor.run_cycle();

        assert_eq!(
            executor.ctx.status.current_scene_name().as_deref(),
            Some("lobby")
        );
    }
}
