//! Named background jobs.
//!
//! A job is a tokio task with its own cancellation token, tracked under a
//! name. Starting a job under a name that is still running cancels the old
//! one first, so refreshes of the same subject never queue up behind each
//! other.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

struct TrackedJob {
    id: u64,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl TrackedJob {
    fn stop(self) {
        self.cancel.cancel();
        self.handle.abort();
    }
}

#[derive(Default)]
struct Jobs {
    running: HashMap<&'static str, TrackedJob>,
    closed: bool,
}

/// Tracker for independently cancellable named jobs.
#[derive(Default)]
pub struct JobTracker {
    jobs: Arc<Mutex<Jobs>>,
    next_id: AtomicU64,
}

fn lock(jobs: &Mutex<Jobs>) -> MutexGuard<'_, Jobs> {
    jobs.lock().unwrap_or_else(PoisonError::into_inner)
}

impl JobTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start `job` under `name`, cancelling a running job with the same name.
    ///
    /// The closure receives the job's cancellation token; writes performed
    /// by the job should be conditioned on it. Jobs started after
    /// [`close`](Self::close) are dropped.
    pub fn run_job<F, Fut>(&self, name: &'static str, job: F) -> bool
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut jobs = lock(&self.jobs);
        if jobs.closed {
            debug!(job = name, "Job tracker closed, not starting job");
            return false;
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let work = job(cancel.clone());

        let token = cancel.clone();
        let registry = Arc::clone(&self.jobs);
        // Spawned under the lock, so the task cannot deregister before it is
        // registered.
        let handle = tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => debug!(job = name, "Job cancelled"),
                _ = work => debug!(job = name, "Job finished"),
            }

            let mut jobs = lock(&registry);
            if jobs.running.get(name).map(|job| job.id) == Some(id) {
                jobs.running.remove(name);
            }
        });

        if let Some(previous) = jobs.running.insert(name, TrackedJob { id, cancel, handle }) {
            debug!(job = name, "Superseding running job");
            previous.stop();
        }
        true
    }

    /// Cancel the job running under `name`. Returns whether one was running.
    pub fn cancel_job(&self, name: &str) -> bool {
        match lock(&self.jobs).running.remove(name) {
            Some(job) => {
                debug!(job = name, "Cancelling job");
                job.stop();
                true
            }
            None => false,
        }
    }

    /// Cancel every tracked job. Does nothing when no job is running.
    pub fn cancel_all(&self) {
        let mut jobs = lock(&self.jobs);
        for (name, job) in jobs.running.drain() {
            debug!(job = name, "Cancelling job");
            job.stop();
        }
    }

    /// Cancel every job and refuse new ones.
    pub fn close(&self) {
        let mut jobs = lock(&self.jobs);
        if !jobs.closed {
            info!(running = jobs.running.len(), "Closing job tracker");
        }
        jobs.closed = true;
        for (_, job) in jobs.running.drain() {
            job.stop();
        }
    }

    pub fn is_running(&self, name: &str) -> bool {
        lock(&self.jobs).running.contains_key(name)
    }

    pub fn active_jobs(&self) -> usize {
        lock(&self.jobs).running.len()
    }
}

impl Drop for JobTracker {
    fn drop(&mut self) {
        self.close();
    }
}
