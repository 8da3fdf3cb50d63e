//! Registry of live jobs
//!
//! The registry is the process-wide job list, but it is an ordinary value:
//! create one at startup, hand clones to whoever spawns or polls jobs, and
//! let the last clone go (or call [`JobRegistry::shutdown`]) at exit.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info};

use crate::config::JobsConfig;
use crate::error::Result;
use crate::job::{Job, JobId, JobInfo};

/// Errors of a failed job queued for display
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportedError {
    pub job_id: JobId,
    pub description: String,
    pub exit_code: i32,
    pub errors: String,
}

/// Shared handle to the job list
#[derive(Clone)]
pub struct JobRegistry {
    shared: Arc<RegistryShared>,
}

pub(crate) struct RegistryShared {
    config: JobsConfig,
    next_id: AtomicU64,
    state: Mutex<RegistryState>,
    /// Set whenever the running count changes, cleared by the UI
    redraw_pending: AtomicBool,
    reported: Mutex<VecDeque<ReportedError>>,
}

#[derive(Default)]
struct RegistryState {
    jobs: Vec<Job>,
    /// Jobs not finalized yet; its size is the running count
    running: HashSet<JobId>,
}

impl JobRegistry {
    /// Create a registry with validated configuration
    pub fn new(config: JobsConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::with_valid_config(config))
    }

    fn with_valid_config(config: JobsConfig) -> Self {
        Self {
            shared: Arc::new(RegistryShared {
                config,
                next_id: AtomicU64::new(1),
                state: Mutex::new(RegistryState::default()),
                redraw_pending: AtomicBool::new(false),
                reported: Mutex::new(VecDeque::new()),
            }),
        }
    }

    pub fn config(&self) -> &JobsConfig {
        &self.shared.config
    }

    pub(crate) fn next_id(&self) -> JobId {
        JobId(self.shared.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn downgrade(&self) -> Weak<RegistryShared> {
        Arc::downgrade(&self.shared)
    }

    pub(crate) fn register(&self, job: Job) {
        let mut state = self.shared.state.lock();
        state.running.insert(job.id());
        state.jobs.push(job);
        self.shared.redraw_pending.store(true, Ordering::Release);
        debug!(running = state.running.len(), "Registered job");
    }

    /// Number of jobs in the collection, finished ones still referenced included
    pub fn len(&self) -> usize {
        self.shared.state.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `job` is still tracked
    pub fn contains(&self, job: &Job) -> bool {
        self.shared
            .state
            .lock()
            .jobs
            .iter()
            .any(|tracked| tracked.same_as(job))
    }

    pub fn find(&self, id: JobId) -> Option<Job> {
        self.shared
            .state
            .lock()
            .jobs
            .iter()
            .find(|job| job.id() == id)
            .cloned()
    }

    /// Handles to every tracked job, oldest first
    pub fn jobs(&self) -> Vec<Job> {
        self.shared.state.lock().jobs.clone()
    }

    /// Visit every tracked job. The visitor runs without the registry lock
    /// held, so it may spawn, wait or decref.
    pub fn for_each<F>(&self, mut visitor: F)
    where
        F: FnMut(&Job),
    {
        for job in self.jobs() {
            visitor(&job);
        }
    }

    /// Snapshots for a job listing
    pub fn list(&self) -> Vec<JobInfo> {
        self.jobs().iter().map(Job::info).collect()
    }

    /// Number of jobs that have not exited yet
    pub fn running_count(&self) -> usize {
        self.shared.state.lock().running.len()
    }

    pub fn redraw_pending(&self) -> bool {
        self.shared.redraw_pending.load(Ordering::Acquire)
    }

    /// Read and clear the redraw flag
    pub fn take_redraw_pending(&self) -> bool {
        self.shared.redraw_pending.swap(false, Ordering::AcqRel)
    }

    /// Finalize every job whose process has exited. Never waits for a
    /// process; jobs busy on another thread are left for the next call.
    /// Returns how many jobs were reaped.
    pub fn reap_completed(&self) -> usize {
        let reaped = self
            .jobs()
            .iter()
            .filter(|job| job.try_reap(false))
            .count();
        if reaped > 0 {
            debug!(reaped, "Reaped completed jobs");
        }
        reaped
    }

    /// Drain errors queued by failed jobs
    pub fn take_reported_errors(&self) -> Vec<ReportedError> {
        self.shared.reported.lock().drain(..).collect()
    }

    /// Release every job's handles and empty the collection. Processes that
    /// are still running are left alone.
    pub fn shutdown(&self) {
        self.shared.shutdown();
    }
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::with_valid_config(JobsConfig::default())
    }
}

impl std::fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRegistry")
            .field("jobs", &self.len())
            .field("running", &self.running_count())
            .finish()
    }
}

impl RegistryShared {
    /// Drop a job from the running count. Jobs already dropped by
    /// [`RegistryShared::shutdown`] are ignored.
    pub(crate) fn job_finished(&self, id: JobId) {
        let mut state = self.state.lock();
        if state.running.remove(&id) {
            self.redraw_pending.store(true, Ordering::Release);
            debug!(job_id = %id, running = state.running.len(), "Job finished");
        }
    }

    /// Remove a job; unknown IDs are ignored
    pub(crate) fn unregister(&self, id: JobId) -> bool {
        let mut state = self.state.lock();
        let before = state.jobs.len();
        state.jobs.retain(|job| job.id() != id);
        let removed = state.jobs.len() != before;
        if removed {
            debug!(job_id = %id, "Removed job from registry");
        }
        removed
    }

    pub(crate) fn report_error(&self, error: ReportedError) {
        self.reported.lock().push_back(error);
    }

    fn shutdown(&self) {
        let (jobs, abandoned) = {
            let mut state = self.state.lock();
            let jobs = std::mem::take(&mut state.jobs);
            let abandoned = jobs
                .iter()
                .filter(|job| state.running.remove(&job.id()))
                .count();
            (jobs, abandoned)
        };
        if jobs.is_empty() {
            return;
        }
        if abandoned > 0 {
            self.redraw_pending.store(true, Ordering::Release);
        }
        info!(jobs = jobs.len(), abandoned, "Shutting down job registry");
        for job in jobs {
            job.release();
        }
    }
}

impl Drop for RegistryShared {
    fn drop(&mut self) {
        self.shutdown();
    }
}
