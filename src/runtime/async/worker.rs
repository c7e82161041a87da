//! Fixed-size pool of worker threads for blocking operations.
//!
//! Jobs arrive through a shared injector; each finished job is pushed to a
//! completion injector and the reactor is woken through the [`Notifier`].
//! Workers never touch script state: a job is a `Send` closure and its result
//! a `Send` payload the reactor thread downcasts.

use std::any::Any;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_deque::{Injector, Steal};
use parking::{Parker, Unparker};

use super::reactor::Notifier;

pub type Payload = Box<dyn Any + Send>;

pub type Job = Box<dyn FnOnce() -> Result<Payload, WorkError> + Send>;

/// Failure of a work request, handed to its completion callback.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkError {
    #[error("{message}")]
    Io { code: Option<i32>, message: String },
    #[error("work request panicked")]
    Panicked,
    #[error("worker pool is shut down")]
    Closed,
}

impl WorkError {
    pub fn code(&self) -> Option<i32> {
        match self {
            WorkError::Io { code, .. } => *code,
            _ => None,
        }
    }
}

impl From<io::Error> for WorkError {
    fn from(err: io::Error) -> Self {
        WorkError::Io {
            code: err.raw_os_error(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(u64);

impl RequestId {
    pub(crate) fn new(raw: u64) -> Self {
        RequestId(raw)
    }
}

/// A job result waiting for the reactor.
pub struct Finished {
    pub id: RequestId,
    pub outcome: Result<Payload, WorkError>,
}

/// Counters as seen by the reactor after a poll.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub queued: usize,
    pub running: usize,
    /// Finished but not yet picked up by `poll`.
    pub finished: usize,
}

impl PoolStats {
    pub fn is_idle(&self) -> bool {
        self.queued == 0 && self.running == 0 && self.finished == 0
    }
}

struct Shared {
    jobs: Injector<(RequestId, Job)>,
    completed: Injector<Finished>,
    queued: AtomicUsize,
    running: AtomicUsize,
    finished: AtomicUsize,
    shutdown: AtomicBool,
    notifier: Arc<Notifier>,
}

struct WorkerHandle {
    thread: Option<JoinHandle<()>>,
    unparker: Unparker,
}

pub struct WorkerPool {
    shared: Arc<Shared>,
    workers: Vec<WorkerHandle>,
}

impl WorkerPool {
    /// Spawn `threads` workers (at least one). Idle workers park for at most
    /// `park_timeout` between queue checks.
    pub fn new(threads: usize, notifier: Arc<Notifier>, park_timeout: Duration) -> io::Result<Self> {
        let shared = Arc::new(Shared {
            jobs: Injector::new(),
            completed: Injector::new(),
            queued: AtomicUsize::new(0),
            running: AtomicUsize::new(0),
            finished: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
            notifier,
        });

        let threads = threads.max(1);
        // Built up in place so a failed spawn still stops the earlier workers.
        let mut pool = Self {
            shared,
            workers: Vec::with_capacity(threads),
        };
        for index in 0..threads {
            let (parker, unparker) = parking::pair();
            let worker_shared = pool.shared.clone();
            let thread = thread::Builder::new()
                .name(format!("node-worker-{}", index))
                .spawn(move || run_worker(worker_shared, parker, park_timeout))?;
            pool.workers.push(WorkerHandle {
                thread: Some(thread),
                unparker,
            });
        }
        tracing::debug!(threads, "worker pool started");

        Ok(pool)
    }

    pub fn threads(&self) -> usize {
        self.workers.len()
    }

    pub fn submit(&self, id: RequestId, job: Job) -> Result<(), WorkError> {
        if self.shared.shutdown.load(Ordering::SeqCst) {
            return Err(WorkError::Closed);
        }
        self.shared.queued.fetch_add(1, Ordering::SeqCst);
        self.shared.jobs.push((id, job));
        tracing::trace!(?id, "work request queued");

        // Wake a random worker; others pick up leftovers on their next tick.
        let idx = fastrand::usize(..self.workers.len());
        self.workers[idx].unparker.unpark();
        Ok(())
    }

    /// Drain finished jobs. Reactor thread only.
    pub fn poll(&self) -> (Vec<Finished>, PoolStats) {
        let mut finished = Vec::new();
        loop {
            match self.shared.completed.steal() {
                Steal::Success(record) => finished.push(record),
                Steal::Empty => break,
                Steal::Retry => continue,
            }
        }
        self.shared.finished.fetch_sub(finished.len(), Ordering::SeqCst);

        // Read order matters: a job moves queued -> running -> finished and
        // each counter is raised before the previous one is lowered.
        let stats = PoolStats {
            queued: self.shared.queued.load(Ordering::SeqCst),
            running: self.shared.running.load(Ordering::SeqCst),
            finished: self.shared.finished.load(Ordering::SeqCst),
        };
        (finished, stats)
    }
}

fn run_worker(shared: Arc<Shared>, parker: Parker, park_timeout: Duration) {
    while !shared.shutdown.load(Ordering::SeqCst) {
        let Some((id, job)) = steal_job(&shared.jobs) else {
            parker.park_timeout(park_timeout);
            continue;
        };

        shared.running.fetch_add(1, Ordering::SeqCst);
        shared.queued.fetch_sub(1, Ordering::SeqCst);

        let outcome = panic::catch_unwind(AssertUnwindSafe(job)).unwrap_or_else(|_| {
            tracing::error!(?id, "work request panicked");
            Err(WorkError::Panicked)
        });

        shared.finished.fetch_add(1, Ordering::SeqCst);
        shared.running.fetch_sub(1, Ordering::SeqCst);
        shared.completed.push(Finished { id, outcome });
        tracing::trace!(?id, "work request finished");

        if let Err(e) = shared.notifier.notify() {
            tracing::error!(error = %e, "failed to wake the reactor");
        }
    }
}

fn steal_job(jobs: &Injector<(RequestId, Job)>) -> Option<(RequestId, Job)> {
    loop {
        match jobs.steal() {
            Steal::Success(job) => return Some(job),
            Steal::Empty => return None,
            Steal::Retry => continue,
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        for worker in &self.workers {
            worker.unparker.unpark();
        }
        for worker in &mut self.workers {
            if let Some(thread) = worker.thread.take() {
                let _ = thread.join();
            }
        }
        tracing::debug!("worker pool stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn pool(threads: usize) -> (WorkerPool, Arc<Notifier>) {
        let notifier = Arc::new(Notifier::new().unwrap());
        let pool = WorkerPool::new(threads, notifier.clone(), Duration::from_millis(5)).unwrap();
        (pool, notifier)
    }

    fn job(value: u32) -> Job {
        Box::new(move || Ok(Box::new(value) as Payload))
    }

    fn wait_for(pool: &WorkerPool, count: usize) -> Vec<Finished> {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut done = Vec::new();
        while done.len() < count && Instant::now() < deadline {
            done.extend(pool.poll().0);
            thread::sleep(Duration::from_millis(1));
        }
        done
    }

    #[test]
    fn test_jobs_complete_once_and_stats_settle() {
        let (pool, _notifier) = pool(3);
        for i in 0..10 {
            pool.submit(RequestId::new(i), job(i as u32)).unwrap();
        }

        let done = wait_for(&pool, 10);
        let mut ids: Vec<u64> = done.iter().map(|f| f.id.0).collect();
        ids.sort_unstable();
        assert_eq!(ids, (0..10).collect::<Vec<_>>());
        for record in done {
            let value = record.outcome.unwrap().downcast::<u32>().unwrap();
            assert_eq!(u64::from(*value), record.id.0);
        }
        assert!(pool.poll().1.is_idle());
    }

    #[test]
    fn test_panicking_job_is_reported() {
        let (pool, _notifier) = pool(1);
        pool.submit(RequestId::new(1), Box::new(|| -> Result<Payload, WorkError> { panic!("job failure") })).unwrap();
        pool.submit(RequestId::new(2), job(7)).unwrap();

        let mut done = wait_for(&pool, 2);
        done.sort_by_key(|f| f.id.0);
        assert!(matches!(done[0].outcome, Err(WorkError::Panicked)));
        assert!(done[1].outcome.is_ok());
    }

    #[test]
    fn test_io_error_keeps_errno() {
        let err = WorkError::from(io::Error::from_raw_os_error(libc::ENOENT));
        assert_eq!(err.code(), Some(libc::ENOENT));
        assert_eq!(WorkError::Panicked.code(), None);
    }

    #[test]
    fn test_drop_joins_workers() {
        let (pool, notifier) = pool(2);
        assert_eq!(pool.threads(), 2);
        drop(pool);
        // only the test's handle remains
        assert_eq!(Arc::strong_count(&notifier), 1);
    }
}
