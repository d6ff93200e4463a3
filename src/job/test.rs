use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        mpsc, Arc, Mutex, Weak,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{bail, Result};
use tracing_test::traced_test;

use super::{Job, JobManager, JobStatus, Monitor, NullMonitor, Outcome, Policy, ProgressMonitor};
use crate::config;

const TIMEOUT: Duration = Duration::from_secs(10);

fn manager() -> JobManager {
    JobManager::new(&config::Jobs {
        poll_interval_ms: 5,
    })
    .unwrap()
}

/// adds one to a counter, after a short nap
struct Count {
    family: &'static str,
    counter: Arc<AtomicUsize>,
    nap: Duration,
}

impl Job for Count {
    fn family(&self) -> Option<&str> {
        Some(self.family)
    }

    fn execute(&mut self, _monitor: &dyn ProgressMonitor) -> Result<JobStatus> {
        thread::sleep(self.nap);
        self.counter.fetch_add(1, Ordering::SeqCst);
        Ok(JobStatus::Complete)
    }
}

/// runs until it is released, to keep the worker busy
struct Blocker {
    started: mpsc::Sender<()>,
    release: mpsc::Receiver<()>,
}

impl Blocker {
    fn new() -> (Self, mpsc::Receiver<()>, mpsc::Sender<()>) {
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        (
            Self {
                started: started_tx,
                release: release_rx,
            },
            started_rx,
            release_tx,
        )
    }
}

impl Job for Blocker {
    fn family(&self) -> Option<&str> {
        Some("blocker")
    }

    fn execute(&mut self, _monitor: &dyn ProgressMonitor) -> Result<JobStatus> {
        let _ = self.started.send(());
        let _ = self.release.recv_timeout(TIMEOUT);
        Ok(JobStatus::Complete)
    }
}

/// records its id into a shared log
struct Tagged {
    id: u32,
    family: &'static str,
    log: Arc<Mutex<Vec<u32>>>,
}

impl Job for Tagged {
    fn family(&self) -> Option<&str> {
        Some(self.family)
    }

    fn execute(&mut self, _monitor: &dyn ProgressMonitor) -> Result<JobStatus> {
        self.log.lock().unwrap().push(self.id);
        Ok(JobStatus::Complete)
    }
}

/// foreground job made from a closure
struct Foreground<F>(F);

impl<F> Job for Foreground<F>
where
    F: FnMut(&dyn ProgressMonitor) -> Result<JobStatus> + Send + 'static,
{
    fn execute(&mut self, monitor: &dyn ProgressMonitor) -> Result<JobStatus> {
        (self.0)(monitor)
    }
}

#[test]
#[traced_test]
fn jobs_run_in_order() {
    let jobs = manager();
    let log = Arc::new(Mutex::new(vec![]));
    for id in 0..20 {
        jobs.request(Tagged {
            id,
            family: "a",
            log: log.clone(),
        });
    }
    assert!(jobs.wait_idle(TIMEOUT));
    assert_eq!(*log.lock().unwrap(), (0..20).collect::<Vec<_>>());
}

#[test]
#[traced_test]
fn discard_on_an_idle_manager_is_a_no_op() {
    let jobs = manager();
    let start = Instant::now();
    assert_eq!(jobs.discard_jobs(None), 0);
    assert_eq!(jobs.discard_jobs(None), 0);
    assert!(start.elapsed() < Duration::from_secs(1));
    assert!(jobs.is_idle());
}

#[test]
#[traced_test]
fn discard_only_drops_the_given_family() {
    let jobs = manager();
    let (blocker, started, release) = Blocker::new();
    jobs.request(blocker);
    started.recv_timeout(TIMEOUT).unwrap();

    let log = Arc::new(Mutex::new(vec![]));
    for (id, family) in [(1, "a"), (2, "b"), (3, "a")] {
        jobs.request(Tagged {
            id,
            family,
            log: log.clone(),
        });
    }
    assert_eq!(jobs.queue_len(), 3);

    // discard has to wait for the blocker, release it from another thread
    let releaser = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        release.send(()).unwrap();
    });
    assert_eq!(jobs.discard_jobs(Some("a")), 2);
    releaser.join().unwrap();
    assert!(jobs.wait_idle(TIMEOUT));
    assert_eq!(*log.lock().unwrap(), vec![2]);
}

#[test]
#[traced_test]
fn discard_everything() {
    let jobs = manager();
    let pause = jobs.pause();
    let counter = Arc::new(AtomicUsize::new(0));
    for family in ["a", "b", "c"] {
        jobs.request(Count {
            family,
            counter: counter.clone(),
            nap: Duration::ZERO,
        });
    }
    drop(pause);
    let _ = jobs.discard_jobs(None);
    assert!(jobs.wait_idle(TIMEOUT));
    assert_eq!(jobs.queue_len(), 0);
    // the worker may have picked up at most one before the discard
    assert!(counter.load(Ordering::SeqCst) <= 1);
}

#[test]
#[traced_test]
fn force_immediate_does_not_interleave_with_the_worker() {
    let jobs = manager();
    let counter = Arc::new(AtomicUsize::new(0));
    for _ in 0..50 {
        jobs.request(Count {
            family: "bg",
            counter: counter.clone(),
            nap: Duration::from_millis(2),
        });
    }
    let observed = counter.clone();
    let mut job = Foreground(move |_: &dyn ProgressMonitor| -> Result<JobStatus> {
        let before = observed.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(50));
        if observed.load(Ordering::SeqCst) != before {
            bail!("background job ran during the immediate job");
        }
        Ok(JobStatus::Complete)
    });
    let outcome = jobs
        .perform_concurrent_job(&mut job, Policy::ForceImmediate, &NullMonitor)
        .unwrap();
    assert_eq!(outcome, Outcome::Completed(JobStatus::Complete));
    // and the queue picks up again
    assert!(jobs.wait_idle(TIMEOUT));
    assert_eq!(counter.load(Ordering::SeqCst), 50);
}

#[test]
#[traced_test]
fn cancel_if_not_ready_gives_up_on_a_busy_queue() {
    let jobs = manager();
    let (blocker, started, release) = Blocker::new();
    jobs.request(blocker);
    started.recv_timeout(TIMEOUT).unwrap();

    let ran = Arc::new(AtomicUsize::new(0));
    let mut job = Foreground({
        let ran = ran.clone();
        move |_: &dyn ProgressMonitor| -> Result<JobStatus> {
            ran.fetch_add(1, Ordering::SeqCst);
            Ok(JobStatus::Complete)
        }
    });
    let monitor = Monitor::new();
    let outcome = jobs
        .perform_concurrent_job(&mut job, Policy::CancelIfNotReady, &monitor)
        .unwrap();
    assert_eq!(outcome, Outcome::Canceled);
    assert!(monitor.is_canceled());
    assert_eq!(ran.load(Ordering::SeqCst), 0);

    release.send(()).unwrap();
    assert!(jobs.wait_idle(TIMEOUT));
    let outcome = jobs
        .perform_concurrent_job(&mut job, Policy::CancelIfNotReady, &Monitor::new())
        .unwrap();
    assert_eq!(outcome, Outcome::Completed(JobStatus::Complete));
    assert_eq!(ran.load(Ordering::SeqCst), 1);
}

#[test]
#[traced_test]
fn wait_until_ready_runs_after_the_queue_drains() {
    let jobs = manager();
    let counter = Arc::new(AtomicUsize::new(0));
    for _ in 0..10 {
        jobs.request(Count {
            family: "bg",
            counter: counter.clone(),
            nap: Duration::from_millis(5),
        });
    }
    let observed = counter.clone();
    let mut job = Foreground(move |_: &dyn ProgressMonitor| -> Result<JobStatus> {
        Ok(if observed.load(Ordering::SeqCst) == 10 {
            JobStatus::Complete
        } else {
            JobStatus::Reschedule
        })
    });
    let monitor = Monitor::new();
    let outcome = jobs
        .perform_concurrent_job(&mut job, Policy::WaitUntilReady, &monitor)
        .unwrap();
    assert_eq!(outcome, Outcome::Completed(JobStatus::Complete));
    assert!(monitor.updates() > 0, "backlog was never reported");
    assert_eq!(monitor.last_remaining(), 0);
}

#[test]
#[traced_test]
fn wait_until_ready_can_be_canceled() {
    let jobs = manager();
    let (blocker, started, release) = Blocker::new();
    jobs.request(blocker);
    started.recv_timeout(TIMEOUT).unwrap();

    let monitor = Arc::new(Monitor::new());
    let canceler = thread::spawn({
        let monitor = monitor.clone();
        move || {
            thread::sleep(Duration::from_millis(30));
            monitor.set_canceled();
        }
    });
    let mut job = Foreground(|_: &dyn ProgressMonitor| -> Result<JobStatus> {
        panic!("canceled job must not run");
    });
    let outcome = jobs
        .perform_concurrent_job(&mut job, Policy::WaitUntilReady, &*monitor)
        .unwrap();
    assert_eq!(outcome, Outcome::Canceled);
    assert_eq!(monitor.last_remaining(), 1);
    canceler.join().unwrap();
    release.send(()).unwrap();
    assert!(jobs.wait_idle(TIMEOUT));
}

#[test]
#[traced_test]
fn foreground_errors_are_returned() {
    let jobs = manager();
    let mut job = Foreground(|_: &dyn ProgressMonitor| -> Result<JobStatus> { bail!("nope") });
    let err = jobs
        .perform_concurrent_job(&mut job, Policy::ForceImmediate, &NullMonitor)
        .unwrap_err();
    assert_eq!(err.to_string(), "nope");
    // the pause was released
    let counter = Arc::new(AtomicUsize::new(0));
    jobs.request(Count {
        family: "bg",
        counter: counter.clone(),
        nap: Duration::ZERO,
    });
    assert!(jobs.wait_idle(TIMEOUT));
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

struct Explode;

impl Job for Explode {
    fn name(&self) -> &str {
        "explode"
    }

    fn execute(&mut self, _monitor: &dyn ProgressMonitor) -> Result<JobStatus> {
        panic!("boom");
    }
}

struct Fail;

impl Job for Fail {
    fn execute(&mut self, _monitor: &dyn ProgressMonitor) -> Result<JobStatus> {
        bail!("this job always fails")
    }
}

#[test]
#[traced_test]
fn failing_jobs_do_not_stop_the_worker() {
    let jobs = manager();
    let counter = Arc::new(AtomicUsize::new(0));
    jobs.request(Explode);
    jobs.request(Fail);
    jobs.request(Count {
        family: "bg",
        counter: counter.clone(),
        nap: Duration::ZERO,
    });
    assert!(jobs.wait_idle(TIMEOUT));
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

/// reschedules itself a few times
struct Retry {
    left: usize,
    log: Arc<Mutex<Vec<&'static str>>>,
}

impl Job for Retry {
    fn execute(&mut self, _monitor: &dyn ProgressMonitor) -> Result<JobStatus> {
        self.log.lock().unwrap().push("retry");
        self.left -= 1;
        Ok(if self.left == 0 {
            JobStatus::Complete
        } else {
            JobStatus::Reschedule
        })
    }
}

struct Mark(&'static str, Arc<Mutex<Vec<&'static str>>>);

impl Job for Mark {
    fn execute(&mut self, _monitor: &dyn ProgressMonitor) -> Result<JobStatus> {
        self.1.lock().unwrap().push(self.0);
        Ok(JobStatus::Complete)
    }
}

#[test]
#[traced_test]
fn rescheduled_jobs_go_to_the_back() {
    let jobs = manager();
    let log = Arc::new(Mutex::new(vec![]));
    let pause = jobs.pause();
    jobs.request(Retry {
        left: 2,
        log: log.clone(),
    });
    jobs.request(Mark("other", log.clone()));
    drop(pause);
    assert!(jobs.wait_idle(TIMEOUT));
    assert_eq!(*log.lock().unwrap(), vec!["retry", "other", "retry"]);
}

#[test]
#[traced_test]
fn shutdown_drops_queued_jobs() {
    let mut jobs = manager();
    let pause = jobs.pause();
    let counter = Arc::new(AtomicUsize::new(0));
    for _ in 0..5 {
        jobs.request(Count {
            family: "bg",
            counter: counter.clone(),
            nap: Duration::ZERO,
        });
    }
    drop(pause);
    jobs.shutdown();
    let ran = counter.load(Ordering::SeqCst);
    jobs.request(Count {
        family: "bg",
        counter: counter.clone(),
        nap: Duration::ZERO,
    });
    assert_eq!(jobs.queue_len(), 0);
    assert_eq!(counter.load(Ordering::SeqCst), ran);
}

/// uses the manager it is running on
struct Nested {
    jobs: Weak<JobManager>,
    report: mpsc::Sender<(usize, Outcome)>,
}

impl Job for Nested {
    fn execute(&mut self, _monitor: &dyn ProgressMonitor) -> Result<JobStatus> {
        let Some(jobs) = self.jobs.upgrade() else {
            bail!("job manager is gone");
        };
        let dropped = jobs.discard_jobs(Some("a"));
        let mut inner =
            Foreground(|_: &dyn ProgressMonitor| -> Result<JobStatus> { Ok(JobStatus::Complete) });
        let outcome = jobs.perform_concurrent_job(&mut inner, Policy::WaitUntilReady, &NullMonitor)?;
        let _ = self.report.send((dropped, outcome));
        Ok(JobStatus::Complete)
    }
}

#[test]
#[traced_test]
fn jobs_can_use_their_own_manager() {
    let jobs = Arc::new(manager());
    let log = Arc::new(Mutex::new(vec![]));
    let (report, reported) = mpsc::channel();
    let pause = jobs.pause();
    jobs.request(Nested {
        jobs: Arc::downgrade(&jobs),
        report,
    });
    jobs.request(Tagged {
        id: 1,
        family: "a",
        log: log.clone(),
    });
    jobs.request(Tagged {
        id: 2,
        family: "b",
        log: log.clone(),
    });
    drop(pause);
    let (dropped, outcome) = reported
        .recv_timeout(TIMEOUT)
        .expect("job using its own manager never finished");
    assert_eq!(dropped, 1);
    assert_eq!(outcome, Outcome::Completed(JobStatus::Complete));
    assert!(jobs.wait_idle(TIMEOUT));
    assert_eq!(*log.lock().unwrap(), vec![2]);
}
