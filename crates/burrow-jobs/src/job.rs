//! Job entity: one external process (or in-process task) and its captured state

use std::fmt;
use std::io::Write;
use std::ops::Deref;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ExitStatus};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::Serialize;
use tracing::{debug, error, warn};

use crate::cancellation::CancellationToken;
use crate::capture::{CapturedOutput, ErrorBuffer, StreamCapture};
use crate::error::{JobError, Result};
use crate::registry::RegistryShared;
use crate::task::{ProgressSnapshot, TaskProgress};

/// Exit code recorded when a process vanished or a task panicked
pub const LOST_EXIT_CODE: i32 = -1;

/// Unique identifier of a job within its registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a job runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    /// External command run through a shell
    External,
    /// Closure running on a thread of this process
    Task,
}

/// Lifecycle of a job; transitions only move forward
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Starting,
    Running,
    Exited,
    Reaped,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Starting => write!(f, "Starting"),
            JobState::Running => write!(f, "Running"),
            JobState::Exited => write!(f, "Exited"),
            JobState::Reaped => write!(f, "Reaped"),
        }
    }
}

/// I/O wiring of a job, fixed at creation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct JobFlags {
    /// Capture stdout into [`CapturedOutput`]
    pub capture_output: bool,
    /// Keep a writable stdin pipe on the job
    pub supply_input: bool,
    /// Stay in the file manager's process group instead of a group of its own
    pub keep_in_foreground: bool,
}

impl JobFlags {
    pub const NONE: JobFlags = JobFlags {
        capture_output: false,
        supply_input: false,
        keep_in_foreground: false,
    };
    pub const CAPTURE_OUTPUT: JobFlags = JobFlags {
        capture_output: true,
        supply_input: false,
        keep_in_foreground: false,
    };
    pub const SUPPLY_INPUT: JobFlags = JobFlags {
        capture_output: false,
        supply_input: true,
        keep_in_foreground: false,
    };

    /// Union of two flag sets
    pub const fn with(self, other: JobFlags) -> JobFlags {
        JobFlags {
            capture_output: self.capture_output || other.capture_output,
            supply_input: self.supply_input || other.supply_input,
            keep_in_foreground: self.keep_in_foreground || other.keep_in_foreground,
        }
    }
}

/// Callback run once when a job exits; runs on whichever thread reaps it
pub type ExitCallback = Box<dyn FnOnce(&Job) + Send + 'static>;

pub(crate) enum Backend {
    Process(Child),
    Task(JoinHandle<i32>),
}

/// Point-in-time description of a job for listings
#[derive(Debug, Clone, Serialize)]
pub struct JobInfo {
    pub id: JobId,
    pub pid: Option<u32>,
    pub kind: JobKind,
    pub description: String,
    pub command: String,
    pub working_dir: Option<PathBuf>,
    pub state: JobState,
    pub exit_code: Option<i32>,
    pub progress: Option<ProgressSnapshot>,
}

/// Handle to a background job.
///
/// Handles are cheap to clone and always safe to read. Registry membership
/// and OS resources are governed by the explicit reference count
/// ([`Job::incref`] / [`Job::decref`]): the job leaves the registry and
/// releases its pipes once the count is zero and the job was reaped.
#[derive(Clone)]
pub struct Job {
    inner: Arc<JobInner>,
}

struct JobInner {
    id: JobId,
    kind: JobKind,
    pid: Option<u32>,
    command: String,
    description: String,
    working_dir: Option<PathBuf>,
    flags: JobFlags,
    poll_interval: Duration,
    core: Mutex<JobCore>,
    finished: Condvar,
    errors: Arc<ErrorBuffer>,
    output: Option<Arc<CapturedOutput>>,
    progress: Option<Arc<TaskProgress>>,
    cancel: CancellationToken,
    registry: Weak<RegistryShared>,
}

struct JobCore {
    state: JobState,
    exit_code: Option<i32>,
    wait_error: Option<String>,
    refs: usize,
    /// Set by the one thread that collected the exit status
    reaping: bool,
    /// Whole finalize sequence done, count updated
    finalized: bool,
    released: bool,
    backend: Option<Backend>,
    input: Option<ChildStdin>,
    capture: StreamCapture,
    callback: Option<ExitCallback>,
}

/// Everything needed to construct a job
pub(crate) struct JobParts {
    pub id: JobId,
    pub kind: JobKind,
    pub pid: Option<u32>,
    pub command: String,
    pub description: String,
    pub working_dir: Option<PathBuf>,
    pub flags: JobFlags,
    pub poll_interval: Duration,
    pub backend: Backend,
    pub input: Option<ChildStdin>,
    pub capture: StreamCapture,
    pub errors: Arc<ErrorBuffer>,
    pub output: Option<Arc<CapturedOutput>>,
    pub progress: Option<Arc<TaskProgress>>,
    pub cancel: CancellationToken,
    pub registry: Weak<RegistryShared>,
}

/// Exit code, or why it could not be collected
type ExitOutcome = std::result::Result<i32, String>;

enum Probe {
    Pending,
    Done(ExitOutcome),
    TaskDone,
}

impl Job {
    pub(crate) fn new(parts: JobParts) -> Self {
        Self {
            inner: Arc::new(JobInner {
                id: parts.id,
                kind: parts.kind,
                pid: parts.pid,
                command: parts.command,
                description: parts.description,
                working_dir: parts.working_dir,
                flags: parts.flags,
                poll_interval: parts.poll_interval,
                core: Mutex::new(JobCore {
                    state: JobState::Starting,
                    exit_code: None,
                    wait_error: None,
                    refs: 1,
                    reaping: false,
                    finalized: false,
                    released: false,
                    backend: Some(parts.backend),
                    input: parts.input,
                    capture: parts.capture,
                    callback: None,
                }),
                finished: Condvar::new(),
                errors: parts.errors,
                output: parts.output,
                progress: parts.progress,
                cancel: parts.cancel,
                registry: parts.registry,
            }),
        }
    }

    pub fn id(&self) -> JobId {
        self.inner.id
    }

    pub fn kind(&self) -> JobKind {
        self.inner.kind
    }

    /// Process ID (None for tasks)
    pub fn pid(&self) -> Option<u32> {
        self.inner.pid
    }

    pub fn command(&self) -> &str {
        &self.inner.command
    }

    pub fn description(&self) -> &str {
        &self.inner.description
    }

    pub fn working_dir(&self) -> Option<&Path> {
        self.inner.working_dir.as_deref()
    }

    pub fn flags(&self) -> JobFlags {
        self.inner.flags
    }

    pub fn state(&self) -> JobState {
        self.inner.core.lock().state
    }

    pub fn is_running(&self) -> bool {
        self.state() < JobState::Exited
    }

    /// Exit code, available once the job reached [`JobState::Exited`]
    pub fn exit_code(&self) -> Option<i32> {
        let core = self.inner.core.lock();
        if core.state >= JobState::Exited {
            core.exit_code
        } else {
            None
        }
    }

    /// Current reference count
    pub fn refs(&self) -> usize {
        self.inner.core.lock().refs
    }

    /// Whether two handles refer to the same job
    pub fn same_as(&self, other: &Job) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Captured stdout (None unless spawned with `capture_output`)
    pub fn output(&self) -> Option<&CapturedOutput> {
        self.inner.output.as_deref()
    }

    /// Copy of the error accumulator
    pub fn errors(&self) -> String {
        self.inner.errors.snapshot()
    }

    pub fn error_buffer(&self) -> &ErrorBuffer {
        &self.inner.errors
    }

    /// Progress of a task job
    pub fn progress(&self) -> Option<ProgressSnapshot> {
        self.inner.progress.as_ref().map(|p| p.snapshot())
    }

    /// Ask a task job to stop. External processes ignore this; see [`Job::terminate`].
    pub fn cancel(&self) {
        self.inner.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    pub(crate) fn poll_interval(&self) -> Duration {
        self.inner.poll_interval
    }

    /// Snapshot for listings
    pub fn info(&self) -> JobInfo {
        let (state, exit_code) = {
            let core = self.inner.core.lock();
            (core.state, core.exit_code)
        };
        JobInfo {
            id: self.id(),
            pid: self.pid(),
            kind: self.kind(),
            description: self.inner.description.clone(),
            command: self.inner.command.clone(),
            working_dir: self.inner.working_dir.clone(),
            state,
            exit_code,
            progress: self.progress(),
        }
    }

    // --- input ---

    /// Whether the stdin pipe is still open
    pub fn has_input(&self) -> bool {
        self.inner.core.lock().input.is_some()
    }

    /// Write to the job's stdin
    pub fn write_input(&self, bytes: &[u8]) -> Result<()> {
        let mut core = self.inner.core.lock();
        match core.input.as_mut() {
            Some(input) => {
                input.write_all(bytes)?;
                input.flush()?;
                Ok(())
            }
            None => Err(JobError::Unsupported(format!(
                "job {} has no open input",
                self.inner.id
            ))),
        }
    }

    /// Close stdin, signalling end of input. Closing twice is harmless.
    pub fn close_input(&self) {
        if self.inner.core.lock().input.take().is_some() {
            debug!(job_id = %self.inner.id, "Closed job input");
        }
    }

    /// Move the stdin pipe to the caller; dropping it closes the pipe
    pub fn take_input(&self) -> Option<ChildStdin> {
        self.inner.core.lock().input.take()
    }

    // --- callbacks ---

    /// Register the exit callback, replacing any earlier one.
    ///
    /// Returns `false` (and drops `callback`) when the job already exited.
    /// The callback runs on the thread that reaps the job, which need not be
    /// the caller's; hand UI work off through a queue.
    pub fn set_exit_callback<F>(&self, callback: F) -> bool
    where
        F: FnOnce(&Job) + Send + 'static,
    {
        let mut core = self.inner.core.lock();
        if core.state >= JobState::Exited {
            return false;
        }
        core.callback = Some(Box::new(callback));
        true
    }

    // --- reference counting ---

    pub fn incref(&self) {
        let mut core = self.inner.core.lock();
        if core.released {
            warn!(job_id = %self.inner.id, "incref on a released job");
        }
        core.refs += 1;
    }

    /// Drop one reference.
    ///
    /// At zero on a reaped job the job leaves the registry and releases its
    /// handles; on a running job removal waits until it is reaped. Extra
    /// decrefs are ignored.
    pub fn decref(&self) {
        let release_now = {
            let mut core = self.inner.core.lock();
            if core.refs == 0 {
                warn!(job_id = %self.inner.id, "decref on a job without references");
                return;
            }
            core.refs -= 1;
            core.refs == 0 && core.finalized
        };
        if release_now {
            self.remove_from_registry();
        }
    }

    /// Hold a reference for the lifetime of the returned guard
    pub fn retain(&self) -> JobRef {
        self.incref();
        JobRef { job: self.clone() }
    }

    // --- lifecycle ---

    pub(crate) fn mark_running(&self) {
        let mut core = self.inner.core.lock();
        if core.state == JobState::Starting {
            core.state = JobState::Running;
        }
    }

    pub(crate) fn is_finalized(&self) -> bool {
        self.inner.core.lock().finalized
    }

    /// Outcome of a finished job: its exit code or the reason it was lost
    pub(crate) fn finished_result(&self) -> Option<Result<i32>> {
        let core = self.inner.core.lock();
        if !core.finalized {
            return None;
        }
        Some(match &core.wait_error {
            Some(reason) => Err(JobError::WaitFailed {
                pid: self.inner.pid.unwrap_or(0),
                reason: reason.clone(),
            }),
            None => Ok(core.exit_code.unwrap_or(LOST_EXIT_CODE)),
        })
    }

    /// Sleep until the job is finalized or `timeout` passes
    pub(crate) fn wait_finalized(&self, timeout: Duration) {
        let mut core = self.inner.core.lock();
        if !core.finalized {
            self.inner.finished.wait_for(&mut core, timeout);
        }
    }

    /// Check for exit without blocking on the process; finalize if it exited.
    ///
    /// With `blocking == false` a job whose lock is busy is skipped. Returns
    /// whether this call ran the finalize sequence.
    pub(crate) fn try_reap(&self, blocking: bool) -> bool {
        let core = if blocking {
            self.inner.core.lock()
        } else {
            match self.inner.core.try_lock() {
                Some(core) => core,
                None => return false,
            }
        };
        let Some(outcome) = self.probe_exit(core) else {
            return false;
        };
        self.finalize(outcome);
        true
    }

    /// Claim the exit of a finished job. Consumes the lock guard so the
    /// finalize sequence runs without it.
    fn probe_exit(&self, mut core: MutexGuard<'_, JobCore>) -> Option<ExitOutcome> {
        if core.reaping || core.state >= JobState::Exited {
            return None;
        }

        let probe = match core.backend.as_mut() {
            Some(Backend::Process(child)) => match child.try_wait() {
                Ok(None) => Probe::Pending,
                Ok(Some(status)) => Probe::Done(Ok(exit_code_of(status))),
                Err(e) => Probe::Done(Err(e.to_string())),
            },
            Some(Backend::Task(handle)) => {
                if handle.is_finished() {
                    Probe::TaskDone
                } else {
                    Probe::Pending
                }
            }
            None => Probe::Done(Err("process handle already released".to_string())),
        };

        let outcome = match probe {
            Probe::Pending => return None,
            Probe::Done(outcome) => outcome,
            Probe::TaskDone => match core.backend.take() {
                Some(Backend::Task(handle)) => handle
                    .join()
                    .map_err(|_| "task panicked".to_string()),
                _ => Err("task handle missing".to_string()),
            },
        };
        core.reaping = true;
        Some(outcome)
    }

    /// Record the exit, run the callback, mark reaped and update the registry.
    /// Runs at most once per job: only the thread that set `reaping` gets here.
    fn finalize(&self, outcome: ExitOutcome) {
        let id = self.inner.id;
        let callback = {
            let mut core = self.inner.core.lock();
            match outcome {
                Ok(code) => {
                    debug!(job_id = %id, pid = ?self.inner.pid, exit_code = code, "Job exited");
                    core.exit_code = Some(code);
                }
                Err(reason) => {
                    warn!(
                        job_id = %id,
                        pid = ?self.inner.pid,
                        reason = %reason,
                        "Lost track of job"
                    );
                    core.exit_code = Some(LOST_EXIT_CODE);
                    core.wait_error = Some(reason);
                }
            }
            core.state = JobState::Exited;
            core.callback.take()
        };

        if let Some(callback) = callback {
            if panic::catch_unwind(AssertUnwindSafe(|| callback(self))).is_err() {
                error!(job_id = %id, "Job exit callback panicked");
            }
        }

        self.inner.core.lock().state = JobState::Reaped;

        if let Some(registry) = self.inner.registry.upgrade() {
            registry.job_finished(id);
        }

        let release_now = {
            let mut core = self.inner.core.lock();
            core.finalized = true;
            core.refs == 0
        };
        self.inner.finished.notify_all();

        if release_now {
            self.remove_from_registry();
        }
    }

    fn remove_from_registry(&self) {
        if let Some(registry) = self.inner.registry.upgrade() {
            registry.unregister(self.inner.id);
        }
        self.release();
    }

    /// Close remaining handles. Runs once; later calls do nothing.
    pub(crate) fn release(&self) {
        let mut core = self.inner.core.lock();
        if core.released {
            return;
        }
        core.released = true;
        core.input = None;
        core.backend = None;
        core.callback = None;
        core.capture.release();
        debug!(job_id = %self.inner.id, "Released job resources");
    }

    /// Block until all capture threads reached end-of-file
    pub fn finish_capture(&self) {
        let mut capture = std::mem::take(&mut self.inner.core.lock().capture);
        capture.join();
    }

    /// Send SIGTERM to the job's process (its process group when detached).
    ///
    /// Not part of cancellation: a cancelled wait leaves the process alone.
    pub fn terminate(&self) -> Result<()> {
        let Some(pid) = self.inner.pid else {
            return Err(JobError::Unsupported(
                "tasks cannot be terminated, use cancel()".to_string(),
            ));
        };

        // Holding the lock keeps the process from being reaped (and its PID
        // reused) while the signal is sent.
        let core = self.inner.core.lock();
        if core.reaping || core.state >= JobState::Exited {
            return Ok(());
        }

        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, killpg, Signal};
            use nix::unistd::Pid;

            let target = Pid::from_raw(pid as i32);
            let sent = if self.inner.flags.keep_in_foreground {
                kill(target, Signal::SIGTERM)
            } else {
                killpg(target, Signal::SIGTERM)
            };
            sent.map_err(|e| JobError::Io(e.into()))?;
            debug!(job_id = %self.inner.id, pid, "Sent SIGTERM to job");
            Ok(())
        }

        #[cfg(not(unix))]
        {
            let mut core = core;
            match core.backend.as_mut() {
                Some(Backend::Process(child)) => {
                    child.kill()?;
                    debug!(job_id = %self.inner.id, pid, "Killed job process");
                    Ok(())
                }
                _ => Ok(()),
            }
        }
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.inner.id)
            .field("pid", &self.inner.pid)
            .field("description", &self.inner.description)
            .field("state", &self.state())
            .finish()
    }
}

/// Scoped job reference: `decref` runs when the guard is dropped
#[derive(Debug)]
pub struct JobRef {
    job: Job,
}

impl JobRef {
    /// Take over a reference the caller already owns (such as the one a spawn returns)
    pub fn adopt(job: Job) -> Self {
        Self { job }
    }

    pub fn job(&self) -> &Job {
        &self.job
    }
}

impl Deref for JobRef {
    type Target = Job;

    fn deref(&self) -> &Job {
        &self.job
    }
}

impl Drop for JobRef {
    fn drop(&mut self) {
        self.job.decref();
    }
}

fn exit_code_of(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }

    LOST_EXIT_CODE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_order_is_monotonic() {
        assert!(JobState::Starting < JobState::Running);
        assert!(JobState::Running < JobState::Exited);
        assert!(JobState::Exited < JobState::Reaped);
    }

    #[test]
    fn test_flags_union() {
        let flags = JobFlags::CAPTURE_OUTPUT.with(JobFlags::SUPPLY_INPUT);
        assert!(flags.capture_output);
        assert!(flags.supply_input);
        assert!(!flags.keep_in_foreground);
        assert_eq!(JobFlags::NONE, JobFlags::default());
    }

    #[test]
    fn test_job_id_display() {
        assert_eq!(JobId(42).to_string(), "42");
    }

    #[cfg(unix)]
    #[test]
    fn test_signal_exit_code() {
        use std::os::unix::process::ExitStatusExt;
        assert_eq!(exit_code_of(ExitStatus::from_raw(9)), 128 + 9);
        assert_eq!(exit_code_of(ExitStatus::from_raw(3 << 8)), 3);
    }
}
