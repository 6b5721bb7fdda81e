//! Per-task delayed-job worker.
//!
//! Each task may own one [`Handler`]: a background thread that runs posted
//! jobs after a delay, in post order. It is created lazily on first use and
//! owned exclusively by that task afterwards.

use crate::error::{EngineError, Result};
use crossbeam_channel::{RecvTimeoutError, Sender, unbounded};
use std::thread;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Poll granularity while waiting for a job's delay to elapse.
const POLL: Duration = Duration::from_millis(1);

/// How often an idle worker re-checks the cancellation token.
const IDLE_CHECK: Duration = Duration::from_millis(100);

type Job = Box<dyn FnOnce() + Send>;

struct Delayed {
    run_at: Instant,
    job: Job,
}

/// Background worker that runs posted jobs after a delay.
///
/// Jobs execute in post order on a dedicated thread. The worker exits when
/// the engine's cancellation token fires or the handler is dropped;
/// pending jobs are discarded on shutdown.
pub struct Handler {
    tx: Sender<Delayed>,
}

impl Handler {
    /// Spawn the worker thread.
    ///
    /// # Errors
    ///
    /// Returns an error if the OS refuses to spawn the thread.
    pub fn new(owner: &str, cancel: CancellationToken) -> Result<Self> {
        let (tx, rx) = unbounded::<Delayed>();
        thread::Builder::new()
            .name(format!("handler-{owner}"))
            .spawn(move || {
                loop {
                    match rx.recv_timeout(IDLE_CHECK) {
                        Ok(delayed) => {
                            while Instant::now() < delayed.run_at {
                                if cancel.is_cancelled() {
                                    return;
                                }
                                thread::sleep(POLL);
                            }
                            if cancel.is_cancelled() {
                                return;
                            }
                            (delayed.job)();
                        }
                        Err(RecvTimeoutError::Timeout) => {
                            if cancel.is_cancelled() {
                                return;
                            }
                        }
                        Err(RecvTimeoutError::Disconnected) => return,
                    }
                }
            })
            .map_err(|e| EngineError::Executor(format!("cannot spawn handler thread: {e}")))?;
        Ok(Self { tx })
    }

    /// Queue a job to run after `delay`.
    pub fn post(&self, delay: Duration, job: impl FnOnce() + Send + 'static) {
        let delayed = Delayed {
            run_at: Instant::now() + delay,
            job: Box::new(job),
        };
        if self.tx.send(delayed).is_err() {
            debug!("handler worker gone, dropping job");
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    #[test]
    fn jobs_run_in_post_order_after_their_delay() {
        let cancel = CancellationToken::new();
        let handler = Handler::new("test", cancel.clone()).unwrap();
        let (tx, rx) = mpsc::channel();

        let tx1 = tx.clone();
        let posted = Instant::now();
        handler.post(Duration::from_millis(20), move || {
            tx1.send(("first", Instant::now())).unwrap();
        });
        handler.post(Duration::ZERO, move || {
            tx.send(("second", Instant::now())).unwrap();
        });

        let (label, ran_at) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(label, "first");
        assert!(ran_at.duration_since(posted) >= Duration::from_millis(15));

        let (label, _) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(label, "second");

        cancel.cancel();
    }

    #[test]
    fn cancellation_discards_pending_jobs() {
        let cancel = CancellationToken::new();
        let handler = Handler::new("test", cancel.clone()).unwrap();
        let ran = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&ran);
        handler.post(Duration::from_millis(200), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        cancel.cancel();

        thread::sleep(Duration::from_millis(300));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }
}
