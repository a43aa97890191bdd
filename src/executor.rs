/*******************************************************************************
 * Copyright (c) 2024 Cénotélie Opérations SAS (cenotelie.fr)
 ******************************************************************************/

//! A task executor over the multi-producer multi-consumer unicast ring

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::Receiver;
use crossbeam_utils::Backoff;

use crate::errors::Full;
use crate::rings::mpmc::MpmcUnicast;

/// A type-erased unit of work
type Task = Box<dyn FnOnce() + Send + 'static>;

/// The state shared between the submitters and the workers
struct Shared<const Q: usize> {
    /// The work items awaiting a worker
    tasks: MpmcUnicast<Task, Q>,
    /// The cooperative stop signal observed by every worker
    stopping: AtomicBool,
}

/// A fixed pool of `P` worker threads pulling work from an internal ring of
/// capacity `Q`
///
/// Workers are spawned at construction and live until the executor is
/// dropped. Dropping the executor signals the stop flag, lets every worker
/// drain the remaining work, and joins them; nothing outlives the value and
/// there is no process-wide state.
///
/// ```
/// # use quadring::executor::Executor;
/// let pool = Executor::<4, 1024>::new();
/// let handle = pool.submit(|| 6 * 7);
/// assert_eq!(handle.join().ok(), Some(42));
/// ```
pub struct Executor<const P: usize, const Q: usize> {
    /// The state shared with the workers
    shared: Arc<Shared<Q>>,
    /// The worker threads, joined on drop
    workers: Vec<JoinHandle<()>>,
}

impl<const P: usize, const Q: usize> Default for Executor<P, Q> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const P: usize, const Q: usize> Executor<P, Q> {
    /// Creates the pool and starts its `P` workers
    #[must_use]
    pub fn new() -> Self {
        const {
            assert!(P >= 1, "the pool must have at least one worker");
        }
        let shared = Arc::new(Shared {
            tasks: MpmcUnicast::new(),
            stopping: AtomicBool::new(false),
        });
        let workers = (0..P)
            .map(|index| {
                std::thread::Builder::new()
                    .name(format!("worker-{index:04}"))
                    .spawn({
                        let shared = shared.clone();
                        move || worker(&shared)
                    })
                    .unwrap()
            })
            .collect::<Vec<_>>();
        Self { shared, workers }
    }

    /// Submits a unit of work, returning the handle its outcome will reach
    ///
    /// The closure runs on some worker thread. Its return value, or the
    /// payload of its panic, becomes observable through the returned
    /// [`TaskHandle`]. When the ring of pending work is full, this call
    /// backs off and retries until the task fits.
    pub fn submit<F, R>(&self, work: F) -> TaskHandle<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (deliver, result) = crossbeam::channel::bounded(1);
        let mut task: Task = Box::new(move || {
            let outcome = catch_unwind(AssertUnwindSafe(work));
            let panicked = outcome.is_err();
            if deliver.send(outcome).is_err() && panicked {
                // the submitter no longer listens; do not lose the signal entirely
                tracing::error!("task panicked after its handle was dropped");
            }
        });
        let backoff = Backoff::new();
        loop {
            match self.shared.tasks.push(task) {
                Ok(()) => break,
                Err(Full(returned)) => {
                    task = returned;
                    backoff.snooze();
                }
            }
        }
        TaskHandle { result }
    }
}

impl<const P: usize, const Q: usize> Drop for Executor<P, Q> {
    fn drop(&mut self) {
        self.shared.stopping.store(true, Ordering::Release);
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                tracing::error!("a worker thread died with an uncaught panic");
            }
        }
    }
}

/// The loop run by each worker thread
fn worker<const Q: usize>(shared: &Shared<Q>) {
    let backoff = Backoff::new();
    while !shared.stopping.load(Ordering::Acquire) {
        match shared.tasks.pop() {
            Some(task) => {
                run(task);
                backoff.reset();
            }
            None => backoff.snooze(),
        }
    }
    // stop requested; finish whatever is still queued before exiting
    while let Some(task) = shared.tasks.pop() {
        run(task);
    }
}

/// Runs one task, keeping the worker alive whatever happens inside
fn run(task: Task) {
    if catch_unwind(AssertUnwindSafe(task)).is_err() {
        tracing::error!("task panicked outside of its own capture");
    }
}

/// The one-shot handle through which a submitted task's outcome arrives
#[derive(Debug)]
pub struct TaskHandle<R> {
    /// Receives the task outcome exactly once
    result: Receiver<std::thread::Result<R>>,
}

impl<R> TaskHandle<R> {
    /// Waits for the task to finish and returns its outcome
    ///
    /// A panic inside the task surfaces here as the `Err` payload, the same
    /// shape [`std::thread::JoinHandle::join`] uses.
    pub fn join(self) -> std::thread::Result<R> {
        self.result
            .recv()
            .expect("a submitted task was dropped without running")
    }

    /// Returns the outcome if the task already finished
    #[must_use]
    pub fn try_join(&self) -> Option<std::thread::Result<R>> {
        self.result.try_recv().ok()
    }
}
