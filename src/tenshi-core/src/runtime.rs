//! Execution contexts: the host's main loop and the background task pool.
//!
//! Work that may block (adapter discovery, waiting for an adapter to connect)
//! runs on a [`TaskPool`]. Results are handed back to the host through a
//! [`Dispatcher`], normally a [`MainLoopHandle`], so consumers only ever see
//! callbacks on the thread that drives the [`MainLoop`].

use std::io;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};
use tokio::runtime::{Builder, Runtime};

pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Something that runs tasks on a particular execution context.
pub trait Dispatcher: Send + Sync {
    fn dispatch(&self, task: Task);
}

/// Runs tasks on the calling thread. Useful in tests and headless tools.
#[derive(Debug, Default, Clone, Copy)]
pub struct ImmediateDispatcher;

impl Dispatcher for ImmediateDispatcher {
    fn dispatch(&self, task: Task) {
        task();
    }
}

/// The primary execution context.
///
/// Owned by one thread which drains queued tasks with one of the `run_*`
/// methods; other threads post work through [`MainLoopHandle`]s.
pub struct MainLoop {
    tx: Sender<Task>,
    rx: Receiver<Task>,
}

impl std::fmt::Debug for MainLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MainLoop").finish_non_exhaustive()
    }
}

impl Default for MainLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl MainLoop {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel();
        Self { tx, rx }
    }

    pub fn handle(&self) -> MainLoopHandle {
        MainLoopHandle {
            tx: self.tx.clone(),
        }
    }

    /// Run every task already queued. Returns how many ran.
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        while let Ok(task) = self.rx.try_recv() {
            task();
            ran += 1;
        }
        ran
    }

    /// Wait up to `timeout` for one task and run it.
    pub fn run_one_timeout(&self, timeout: Duration) -> bool {
        match self.rx.recv_timeout(timeout) {
            Ok(task) => {
                task();
                true
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => false,
        }
    }

    /// Keep running tasks until `done` returns true or `timeout` elapses.
    ///
    /// Returns whether `done` was satisfied.
    pub fn run_until(&self, mut done: impl FnMut() -> bool, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            self.run_pending();
            if done() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            self.run_one_timeout(deadline - now);
        }
    }
}

/// Cloneable sender half of a [`MainLoop`].
#[derive(Clone)]
pub struct MainLoopHandle {
    tx: Sender<Task>,
}

impl std::fmt::Debug for MainLoopHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MainLoopHandle").finish_non_exhaustive()
    }
}

impl Dispatcher for MainLoopHandle {
    fn dispatch(&self, task: Task) {
        if self.tx.send(task).is_err() {
            tracing::warn!("main loop is gone; dropping task");
        }
    }
}

const WORKER_THREAD_NAME: &str = "tenshi-worker";

/// How long dropping a [`TaskPool`] waits for running jobs.
pub const POOL_SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Background pool for blocking work, backed by a tokio runtime.
///
/// Jobs run through `spawn_blocking`, at most `threads` at a time. Dropping
/// the pool waits up to [`POOL_SHUTDOWN_GRACE`] for running jobs; jobs still
/// queued are dropped unrun.
pub struct TaskPool {
    runtime: Option<Runtime>,
    threads: usize,
}

impl std::fmt::Debug for TaskPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskPool")
            .field("threads", &self.threads)
            .finish()
    }
}

impl TaskPool {
    pub fn new(threads: usize) -> io::Result<Self> {
        let threads = threads.max(1);
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(threads)
            .thread_name(WORKER_THREAD_NAME)
            .build()?;
        Ok(Self {
            runtime: Some(runtime),
            threads,
        })
    }

    pub fn spawn(&self, job: impl FnOnce() + Send + 'static) {
        self.dispatch(Box::new(job));
    }

    pub fn worker_count(&self) -> usize {
        self.threads
    }
}

impl Dispatcher for TaskPool {
    fn dispatch(&self, task: Task) {
        let Some(runtime) = &self.runtime else {
            tracing::error!("task pool is shut down; dropping task");
            return;
        };
        let job = runtime.spawn_blocking(task);
        runtime.spawn(async move {
            if let Err(err) = job.await {
                if err.is_panic() {
                    tracing::error!("background task panicked");
                }
            }
        });
    }
}

impl Drop for TaskPool {
    fn drop(&mut self) {
        let Some(runtime) = self.runtime.take() else {
            return;
        };
        // A job may hold the last reference; it cannot wait for itself.
        if thread::current().name() == Some(WORKER_THREAD_NAME) {
            runtime.shutdown_background();
        } else {
            runtime.shutdown_timeout(POOL_SHUTDOWN_GRACE);
        }
    }
}
