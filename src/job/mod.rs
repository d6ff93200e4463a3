//! # Job coordination
//!
//! One background worker thread runs queued [`Job`]s in submission order. Foreground
//! threads use [`JobManager::perform_concurrent_job`] to run their own work without
//! ever overlapping a background job, which is what lets the indexer be the only
//! writer of the database while queries read it.
//!
//! The worker is *paused* while anyone holds a [`Pause`]: it finishes the job it is
//! running (if any) and then leaves the queue alone until the pause is released.

use std::{
    any::Any,
    collections::VecDeque,
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock, PoisonError},
    thread::{self, JoinHandle, ThreadId},
    time::{Duration, Instant},
};

use anyhow::Result;

use crate::config;

pub mod monitor;
#[cfg(test)]
mod test;

pub use monitor::{Monitor, NullMonitor, ProgressMonitor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    /// done, drop the job
    Complete,
    /// run the job again later (it goes to the back of the queue)
    Reschedule,
}

/// A unit of work.
///
/// A background job may use its [`JobManager`] from inside `execute` (discarding
/// jobs, running a foreground job). Those calls do not wait for the background
/// queue, since the caller *is* the background worker.
pub trait Job: Send + 'static {
    /// family tag used by [`JobManager::discard_jobs`]
    fn family(&self) -> Option<&str> {
        None
    }

    fn belongs_to(&self, family: &str) -> bool {
        self.family() == Some(family)
    }

    /// name for logs
    fn name(&self) -> &str {
        "job"
    }

    fn execute(&mut self, monitor: &dyn ProgressMonitor) -> Result<JobStatus>;
}

/// How [`JobManager::perform_concurrent_job`] deals with a busy background queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    /// pause the background worker (after its current job) and run right away
    ForceImmediate,
    /// give up if there is any background work
    CancelIfNotReady,
    /// wait for the queue to drain, reporting the backlog to the monitor
    WaitUntilReady,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed(JobStatus),
    Canceled,
}

struct State {
    queue: VecDeque<Box<dyn Job>>,
    /// the worker is executing a job
    running: bool,
    /// number of outstanding pauses
    paused: usize,
    shutdown: bool,
}

impl State {
    fn busy(&self) -> bool {
        self.running || !self.queue.is_empty()
    }

    fn backlog(&self) -> usize {
        self.queue.len() + self.running as usize
    }
}

struct Shared {
    state: Mutex<State>,
    /// signalled on every state change
    changed: Condvar,
    /// set by the worker thread when it starts
    worker: OnceLock<ThreadId>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        // jobs never run while the lock is held, a poisoned lock still has a
        // consistent queue
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait<'a>(&self, guard: MutexGuard<'a, State>) -> MutexGuard<'a, State> {
        self.changed
            .wait(guard)
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn wait_timeout<'a>(
        &self,
        guard: MutexGuard<'a, State>,
        timeout: Duration,
    ) -> MutexGuard<'a, State> {
        self.changed
            .wait_timeout(guard, timeout)
            .map(|(guard, _)| guard)
            .unwrap_or_else(|e| e.into_inner().0)
    }

    /// whether the calling thread is the worker (so the running job is the caller)
    fn on_worker(&self) -> bool {
        self.worker.get() == Some(&thread::current().id())
    }

    /// pause the worker, and wait until it is not running anything
    fn pause<'a>(&'a self, mut state: MutexGuard<'a, State>) -> Pause<'a> {
        state.paused += 1;
        let on_worker = self.on_worker();
        while state.running && !on_worker {
            state = self.wait(state);
        }
        Pause { shared: self }
    }
}

/// Keeps the background worker from starting jobs while alive
#[must_use]
pub struct Pause<'a> {
    shared: &'a Shared,
}

impl Drop for Pause<'_> {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        state.paused -= 1;
        self.shared.changed.notify_all();
    }
}

pub struct JobManager {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
    poll_interval: Duration,
}

impl JobManager {
    /// Start the background worker
    pub fn new(config: &config::Jobs) -> Result<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                queue: VecDeque::new(),
                running: false,
                paused: 0,
                shutdown: false,
            }),
            changed: Condvar::new(),
            worker: OnceLock::new(),
        });
        let worker = thread::Builder::new()
            .name("symdex-jobs".into())
            .spawn({
                let shared = shared.clone();
                move || runner(&shared)
            })?;
        Ok(Self {
            shared,
            worker: Some(worker),
            poll_interval: config.poll_interval(),
        })
    }

    /// Add `job` to the back of the queue
    pub fn request(&self, job: impl Job) {
        let mut state = self.shared.lock();
        if state.shutdown {
            warn!("job manager is shut down, dropping job `{}`", job.name());
            return;
        }
        debug!("queued job `{}`", job.name());
        state.queue.push_back(Box::new(job));
        self.shared.changed.notify_all();
    }

    /// number of jobs waiting to run (not counting the running one)
    pub fn queue_len(&self) -> usize {
        self.shared.lock().queue.len()
    }

    /// nothing queued and nothing running
    pub fn is_idle(&self) -> bool {
        !self.shared.lock().busy()
    }

    /// Wait for the background work to run out. Returns `false` on timeout.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.lock();
        while state.busy() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = self.shared.wait_timeout(state, deadline - now);
        }
        true
    }

    /// Hold the background worker. It finishes its current job first.
    pub fn pause(&self) -> Pause<'_> {
        self.shared.pause(self.shared.lock())
    }

    /// Drop queued jobs of `family` (or all of them for `None`), keeping the order of
    /// the rest. Waits for the running job to finish first. Returns the number of
    /// jobs dropped.
    #[instrument(skip(self))]
    pub fn discard_jobs(&self, family: Option<&str>) -> usize {
        let state = self.shared.lock();
        if !state.busy() {
            return 0;
        }
        let pause = self.shared.pause(state);
        let mut state = self.shared.lock();
        let before = state.queue.len();
        state
            .queue
            .retain(|job| family.is_some_and(|family| !job.belongs_to(family)));
        let dropped = before - state.queue.len();
        drop(state);
        drop(pause);
        debug!("discarded {dropped} jobs");
        dropped
    }

    /// Run `job` on the calling thread, without overlapping any background job.
    ///
    /// Errors returned by the job are passed on, cancellation is reported as
    /// [`Outcome::Canceled`].
    #[instrument(skip_all, fields(job = job.name(), policy = ?policy))]
    pub fn perform_concurrent_job(
        &self,
        job: &mut dyn Job,
        policy: Policy,
        monitor: &dyn ProgressMonitor,
    ) -> Result<Outcome> {
        if monitor.is_canceled() {
            return Ok(Outcome::Canceled);
        }
        // the background work this would wait for is the caller itself
        let policy = if self.shared.on_worker() {
            trace!("called from the worker thread, running right away");
            Policy::ForceImmediate
        } else {
            policy
        };
        let pause = match policy {
            Policy::ForceImmediate => self.pause(),
            Policy::CancelIfNotReady => {
                let state = self.shared.lock();
                if state.busy() {
                    debug!("background queue is busy ({} jobs), canceling", state.backlog());
                    monitor.set_canceled();
                    return Ok(Outcome::Canceled);
                }
                self.shared.pause(state)
            }
            Policy::WaitUntilReady => {
                let mut state = self.shared.lock();
                loop {
                    if !state.busy() {
                        break self.shared.pause(state);
                    }
                    monitor.remaining(state.backlog());
                    state = self.shared.wait_timeout(state, self.poll_interval);
                    if monitor.is_canceled() {
                        debug!("canceled while waiting for the background queue");
                        return Ok(Outcome::Canceled);
                    }
                }
            }
        };
        monitor.remaining(0);
        let status = job.execute(monitor)?;
        drop(pause);
        if monitor.is_canceled() {
            return Ok(Outcome::Canceled);
        }
        Ok(Outcome::Completed(status))
    }

    /// Stop the worker once its current job is done. Queued jobs are dropped.
    pub fn shutdown(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        {
            let mut state = self.shared.lock();
            state.shutdown = true;
            if !state.queue.is_empty() {
                info!("dropping {} queued jobs on shutdown", state.queue.len());
                state.queue.clear();
            }
            self.shared.changed.notify_all();
        }
        if worker.join().is_err() {
            error!("job worker thread panicked");
        }
    }
}

impl Drop for JobManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for JobManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("JobManager")
            .field("queued", &state.queue.len())
            .field("running", &state.running)
            .field("paused", &state.paused)
            .finish()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("<non-string panic payload>")
}

/// the worker loop
fn runner(shared: &Shared) {
    let _ = shared.worker.set(thread::current().id());
    debug!("job worker started");
    loop {
        let mut job = {
            let mut state = shared.lock();
            loop {
                if state.shutdown {
                    debug!("job worker shutting down");
                    return;
                }
                if state.paused == 0 {
                    if let Some(job) = state.queue.pop_front() {
                        state.running = true;
                        break job;
                    }
                }
                state = shared.wait(state);
            }
        };
        trace!("running job `{}`", job.name());
        let status = match panic::catch_unwind(AssertUnwindSafe(|| job.execute(&NullMonitor))) {
            Ok(Ok(status)) => Some(status),
            Ok(Err(e)) => {
                error!("job `{}` failed: {e:#}", job.name());
                None
            }
            Err(panic) => {
                error!("job `{}` panicked: {}", job.name(), panic_message(&*panic));
                None
            }
        };
        let mut state = shared.lock();
        state.running = false;
        if status == Some(JobStatus::Reschedule) && !state.shutdown {
            trace!("rescheduling job `{}`", job.name());
            state.queue.push_back(job);
        }
        shared.changed.notify_all();
    }
}
