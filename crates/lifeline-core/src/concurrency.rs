use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

pub fn install_signal_handler() {
    let _ = ctrlc::set_handler(move || {
        if SHUTDOWN_REQUESTED.load(Ordering::SeqCst) {
            std::process::exit(1);
        }
        SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
        eprintln!("\ninterrupt received, abandoning pending waits...");
    });
}

pub fn shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
}

/// Cooperative cancellation for a caller blocked on a lifecycle operation.
///
/// A token is also considered cancelled once a process shutdown was
/// requested through the signal handler.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst) || shutdown_requested()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WaitError {
    #[error("timed out")]
    TimedOut,
    #[error("interrupted")]
    Interrupted,
    #[error("worker terminated: {0}")]
    WorkerTerminated(String),
}

/// Wait for one value on `rx`, checking `cancel` every `poll`.
fn wait_on<T>(
    rx: &Receiver<T>,
    timeout: Option<Duration>,
    poll: Duration,
    cancel: &CancelToken,
) -> Result<T, WaitError> {
    let deadline = timeout.map(|t| Instant::now() + t);
    loop {
        if cancel.is_cancelled() {
            return Err(WaitError::Interrupted);
        }
        let slice = match deadline {
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return Err(WaitError::TimedOut);
                }
                (deadline - now).min(poll)
            }
            None => poll,
        };
        match rx.recv_timeout(slice) {
            Ok(value) => return Ok(value),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                return Err(WaitError::WorkerTerminated(
                    "result channel closed".to_owned(),
                ))
            }
        }
    }
}

type Job = Box<dyn FnOnce() + Send>;

/// Fixed set of threads that run blocking engine calls so the caller can
/// stop waiting on them. An abandoned call keeps running on its worker.
pub struct WorkerPool {
    jobs: Sender<Job>,
}

impl WorkerPool {
    pub fn new(size: usize) -> std::io::Result<Self> {
        let size = size.max(1);
        let (jobs, queue) = unbounded::<Job>();
        for index in 0..size {
            let queue = queue.clone();
            thread::Builder::new()
                .name(format!("lifeline-worker-{index}"))
                .spawn(move || {
                    while let Ok(job) = queue.recv() {
                        job();
                    }
                })?;
        }
        debug!("started {size} lifecycle worker(s)");
        Ok(Self { jobs })
    }

    /// Run `f` on a worker and wait at most `timeout` for its result.
    ///
    /// A panic inside `f` is reported as `WorkerTerminated`. When the wait
    /// ends early, a job that has not started yet is skipped.
    pub fn run_bounded<T, F>(
        &self,
        timeout: Duration,
        poll: Duration,
        cancel: &CancelToken,
        f: F,
    ) -> Result<T, WaitError>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (tx, rx) = bounded(1);
        let abandoned = Arc::new(AtomicBool::new(false));
        let job_abandoned = Arc::clone(&abandoned);
        let job: Job = Box::new(move || {
            if job_abandoned.load(Ordering::SeqCst) {
                debug!("skipping abandoned lifecycle job");
                return;
            }
            let result = catch_unwind(AssertUnwindSafe(f)).map_err(|payload| panic_message(&*payload));
            let _ = tx.send(result);
        });
        self.jobs
            .send(job)
            .map_err(|_| WaitError::WorkerTerminated("worker pool is shut down".to_owned()))?;

        match wait_on(&rx, Some(timeout), poll, cancel) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(message)) => {
                warn!("lifecycle worker panicked: {message}");
                Err(WaitError::WorkerTerminated(message))
            }
            Err(e) => {
                abandoned.store(true, Ordering::SeqCst);
                Err(e)
            }
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_owned()
    }
}

/// Create a single-use completion signal and the waiter that observes it.
pub fn completion<T: Send>() -> (CompletionSignal<T>, CompletionWaiter<T>) {
    let (tx, rx) = bounded(1);
    let fired = Arc::new(AtomicBool::new(false));
    let signal = CompletionSignal {
        tx: tx.clone(),
        fired: Arc::clone(&fired),
    };
    (
        signal,
        CompletionWaiter {
            rx,
            fired,
            _keepalive: tx,
        },
    )
}

/// Sending half of a completion signal. Only the first completion counts.
pub struct CompletionSignal<T> {
    tx: Sender<T>,
    fired: Arc<AtomicBool>,
}

impl<T> Clone for CompletionSignal<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            fired: Arc::clone(&self.fired),
        }
    }
}

impl<T> CompletionSignal<T> {
    /// Complete with the value produced by `f`. Returns false without calling
    /// `f` when the signal already fired.
    pub fn complete_with(&self, f: impl FnOnce() -> T) -> bool {
        if self.fired.swap(true, Ordering::SeqCst) {
            return false;
        }
        let _ = self.tx.try_send(f());
        true
    }

    pub fn is_complete(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }
}

/// Receiving half of a completion signal. The waiter holds a sender of its
/// own, so a signal that is dropped without firing never ends the wait.
pub struct CompletionWaiter<T> {
    rx: Receiver<T>,
    fired: Arc<AtomicBool>,
    _keepalive: Sender<T>,
}

impl<T> CompletionWaiter<T> {
    /// Block until the signal fires, `timeout` elapses or `cancel` trips.
    /// Without a timeout the wait is unbounded.
    ///
    /// A wait that ends early disarms the signal: a completion arriving
    /// afterwards is refused by [`CompletionSignal::complete_with`].
    pub fn wait(
        self,
        timeout: Option<Duration>,
        poll: Duration,
        cancel: &CancelToken,
    ) -> Result<T, WaitError> {
        let result = wait_on(&self.rx, timeout, poll, cancel);
        if result.is_err() && self.fired.swap(true, Ordering::SeqCst) {
            // Fired between the last poll and the disarm; the value follows.
            if let Ok(value) = self.rx.recv_timeout(poll) {
                return Ok(value);
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    const POLL: Duration = Duration::from_millis(5);

    #[test]
    fn cancel_token_is_shared_between_clones() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn bounded_run_returns_value() {
        let pool = WorkerPool::new(1).unwrap();
        let v = pool
            .run_bounded(Duration::from_secs(5), POLL, &CancelToken::new(), || 41 + 1)
            .unwrap();
        assert_eq!(v, 42);
    }

    #[test]
    fn bounded_run_times_out() {
        let pool = WorkerPool::new(1).unwrap();
        let started = Instant::now();
        let err = pool
            .run_bounded(Duration::from_millis(50), POLL, &CancelToken::new(), || {
                thread::sleep(Duration::from_millis(500));
            })
            .unwrap_err();
        assert_eq!(err, WaitError::TimedOut);
        assert!(started.elapsed() < Duration::from_millis(400));
    }

    #[test]
    fn bounded_run_reports_panic() {
        let pool = WorkerPool::new(1).unwrap();
        let err = pool
            .run_bounded::<(), _>(Duration::from_secs(5), POLL, &CancelToken::new(), || {
                panic!("activator blew up")
            })
            .unwrap_err();
        assert_eq!(err, WaitError::WorkerTerminated("activator blew up".to_owned()));
        // The worker survives the panic.
        let v = pool
            .run_bounded(Duration::from_secs(5), POLL, &CancelToken::new(), || 1)
            .unwrap();
        assert_eq!(v, 1);
    }

    #[test]
    fn cancelled_wait_is_interrupted() {
        let pool = WorkerPool::new(1).unwrap();
        let token = CancelToken::new();
        let canceller = token.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            canceller.cancel();
        });
        let err = pool
            .run_bounded(Duration::from_secs(10), POLL, &token, || {
                thread::sleep(Duration::from_millis(300));
            })
            .unwrap_err();
        assert_eq!(err, WaitError::Interrupted);
        handle.join().unwrap();
    }

    #[test]
    fn abandoned_job_is_skipped() {
        let pool = WorkerPool::new(1).unwrap();
        let ran = Arc::new(AtomicUsize::new(0));
        // Occupy the only worker, then queue a job behind it and give up on it.
        let _ = pool.run_bounded(Duration::from_millis(10), POLL, &CancelToken::new(), || {
            thread::sleep(Duration::from_millis(100));
        });
        let counter = Arc::clone(&ran);
        let err = pool
            .run_bounded(Duration::from_millis(10), POLL, &CancelToken::new(), move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap_err();
        assert_eq!(err, WaitError::TimedOut);
        let v = pool
            .run_bounded(Duration::from_secs(5), POLL, &CancelToken::new(), || 7)
            .unwrap();
        assert_eq!(v, 7);
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn completion_fires_once() {
        let (signal, waiter) = completion::<u32>();
        let second = signal.clone();
        assert!(signal.complete_with(|| 1));
        assert!(!second.complete_with(|| 2));
        assert!(second.is_complete());
        assert_eq!(waiter.wait(None, POLL, &CancelToken::new()).unwrap(), 1);
    }

    #[test]
    fn completion_from_other_thread() {
        let (signal, waiter) = completion::<&'static str>();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            signal.complete_with(|| "done");
        });
        let v = waiter
            .wait(Some(Duration::from_secs(5)), POLL, &CancelToken::new())
            .unwrap();
        assert_eq!(v, "done");
        handle.join().unwrap();
    }

    #[test]
    fn dropped_signal_does_not_end_wait() {
        let (signal, waiter) = completion::<u32>();
        drop(signal);
        let err = waiter
            .wait(Some(Duration::from_millis(30)), POLL, &CancelToken::new())
            .unwrap_err();
        assert_eq!(err, WaitError::TimedOut);
    }

    #[test]
    fn abandoned_wait_refuses_late_completion() {
        let (signal, waiter) = completion::<u32>();
        let err = waiter
            .wait(Some(Duration::from_millis(20)), POLL, &CancelToken::new())
            .unwrap_err();
        assert_eq!(err, WaitError::TimedOut);
        let ran = AtomicUsize::new(0);
        assert!(!signal.complete_with(|| {
            ran.fetch_add(1, Ordering::SeqCst);
            1
        }));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }
}
