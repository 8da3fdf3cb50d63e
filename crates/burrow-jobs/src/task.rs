//! In-process background tasks
//!
//! Long file operations (copy, move, delete) run on a thread of their own but
//! are tracked as jobs, so they share counting, waiting and callbacks with
//! external commands.

use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::info;

use crate::cancellation::CancellationToken;
use crate::capture::{ErrorBuffer, StreamCapture};
use crate::error::{JobError, Result};
use crate::job::{Backend, Job, JobFlags, JobKind, JobParts};
use crate::registry::JobRegistry;

/// Progress of a task
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProgressSnapshot {
    /// Total units of work (0 when unknown)
    pub total: u64,
    /// Units done so far
    pub done: u64,
    /// Item currently being processed
    pub item: Option<String>,
}

impl ProgressSnapshot {
    /// Completion in percent, None when the total is unknown
    pub fn percent(&self) -> Option<u8> {
        if self.total == 0 {
            return None;
        }
        let done = self.done.min(self.total);
        Some((done * 100 / self.total) as u8)
    }
}

#[derive(Debug, Default)]
pub(crate) struct TaskProgress {
    state: Mutex<ProgressSnapshot>,
}

impl TaskProgress {
    fn new(total: u64) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ProgressSnapshot {
                total,
                ..Default::default()
            }),
        })
    }

    pub(crate) fn snapshot(&self) -> ProgressSnapshot {
        self.state.lock().clone()
    }
}

/// Handed to a running task
#[derive(Debug)]
pub struct TaskContext {
    progress: Arc<TaskProgress>,
    cancel: CancellationToken,
    errors: Arc<ErrorBuffer>,
}

impl TaskContext {
    pub fn set_total(&self, total: u64) {
        self.progress.state.lock().total = total;
    }

    /// Mark `units` more work as done
    pub fn advance(&self, units: u64) {
        let mut state = self.progress.state.lock();
        state.done = state.done.saturating_add(units);
    }

    /// Name the item currently being processed
    pub fn set_item(&self, item: impl Into<String>) {
        self.progress.state.lock().item = Some(item.into());
    }

    /// Whether [`Job::cancel`] was called; tasks should stop early when set
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Append to the job's error text
    pub fn report_error(&self, text: &str) {
        self.errors.append(text);
    }
}

/// Closes the error stream when the task returns or unwinds
struct CloseErrors(Arc<ErrorBuffer>);

impl Drop for CloseErrors {
    fn drop(&mut self) {
        self.0.finish();
    }
}

impl JobRegistry {
    /// Run `task` on a new thread as a job.
    ///
    /// The closure's return value becomes the job's exit code. The returned
    /// job carries one reference owned by the caller.
    pub fn execute<F>(&self, description: impl Into<String>, total: u64, task: F) -> Result<Job>
    where
        F: FnOnce(&TaskContext) -> i32 + Send + 'static,
    {
        let description = description.into();
        let id = self.next_id();
        let progress = TaskProgress::new(total);
        let cancel = CancellationToken::new();
        let errors = ErrorBuffer::new();

        let ctx = TaskContext {
            progress: Arc::clone(&progress),
            cancel: cancel.clone(),
            errors: Arc::clone(&errors),
        };
        let handle = thread::Builder::new()
            .name(format!("job-{id}-task"))
            .spawn(move || {
                let _close = CloseErrors(Arc::clone(&ctx.errors));
                task(&ctx)
            })
            .map_err(JobError::ExecFailed)?;

        let job = Job::new(JobParts {
            id,
            kind: JobKind::Task,
            pid: None,
            command: String::new(),
            description: description.clone(),
            working_dir: None,
            flags: JobFlags::NONE,
            poll_interval: self.config().poll_interval(),
            backend: Backend::Task(handle),
            input: None,
            capture: StreamCapture::new(),
            errors,
            output: None,
            progress: Some(progress),
            cancel,
            registry: self.downgrade(),
        });
        job.mark_running();
        self.register(job.clone());

        info!(job_id = %id, description = %description, "Task started");
        Ok(job)
    }
}
