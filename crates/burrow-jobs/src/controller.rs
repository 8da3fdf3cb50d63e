//! Waiting for jobs
//!
//! Waits poll the process between timed sleeps on the job's exit condition.
//! Whoever first sees the exit (a waiter or [`JobRegistry::reap_completed`])
//! runs the finalize sequence; every other waiter wakes on the condition and
//! reads the recorded result.

use tracing::{debug, warn};

use crate::cancellation::CancellationToken;
use crate::error::{JobError, Result};
use crate::job::{Job, JobRef};
use crate::registry::JobRegistry;
use crate::shell::ShellKind;
use crate::spawner::SpawnRequest;

impl Job {
    /// Block until the job is finished and return its exit code.
    ///
    /// Repeated calls return the same result.
    pub fn wait(&self) -> Result<i32> {
        self.wait_with(&CancellationToken::none())
    }

    /// Like [`Job::wait`], but gives up with [`JobError::Cancelled`] once
    /// `token` is cancelled. The process keeps running.
    pub fn wait_with(&self, token: &CancellationToken) -> Result<i32> {
        loop {
            if let Some(result) = self.finished_result() {
                return result;
            }
            if token.is_cancelled() {
                debug!(job_id = %self.id(), "Wait cancelled");
                return Err(JobError::Cancelled);
            }
            if self.try_reap(true) {
                continue;
            }
            self.wait_finalized(self.poll_interval());
        }
    }

    /// Wait on tokio's blocking pool
    pub async fn wait_async(&self) -> Result<i32> {
        let job = self.clone();
        tokio::task::spawn_blocking(move || job.wait())
            .await
            .map_err(|e| JobError::WaitFailed {
                pid: self.pid().unwrap_or(0),
                reason: e.to_string(),
            })?
    }
}

impl JobRegistry {
    /// Block until every listed job is finished, including jobs started
    /// meanwhile
    pub fn wait_for_all(&self) {
        loop {
            let pending: Vec<Job> = self
                .jobs()
                .into_iter()
                .filter(|job| !job.is_finalized())
                .collect();
            if pending.is_empty() {
                return;
            }
            for job in pending {
                if let Err(e) = job.wait() {
                    warn!(job_id = %job.id(), error = %e, "Job ended abnormally");
                }
            }
        }
    }

    /// Run `command` through the user's shell and wait for it, collecting its
    /// error output.
    ///
    /// Fails with [`JobError::CommandFailed`] when the command exits with a
    /// non-zero code and wrote to stderr. On cancellation the wait is
    /// abandoned and the process is left running.
    pub fn run_and_collect_errors(&self, command: &str, token: &CancellationToken) -> Result<()> {
        self.run_request_and_collect_errors(
            SpawnRequest::new(command).shell(ShellKind::User),
            token,
        )
    }

    /// [`JobRegistry::run_and_collect_errors`] for a full request
    pub fn run_request_and_collect_errors(
        &self,
        request: SpawnRequest,
        token: &CancellationToken,
    ) -> Result<()> {
        let job = JobRef::adopt(self.spawn_request(request)?);

        let exit_code = job.wait_with(token)?;
        while !job.error_buffer().wait_finished(job.poll_interval()) {
            if token.is_cancelled() {
                return Err(JobError::Cancelled);
            }
        }

        let errors = job.errors();
        if exit_code != 0 {
            if !errors.is_empty() {
                return Err(JobError::CommandFailed { exit_code, errors });
            }
            warn!(job_id = %job.id(), exit_code, "Command failed without error output");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_wait_is_idempotent_for_tasks() {
        let registry = JobRegistry::default();
        let job = registry.execute("answer", 0, |_| 42).unwrap();
        assert_eq!(job.wait().unwrap(), 42);
        assert_eq!(job.wait().unwrap(), 42);
        job.decref();
    }

    #[test]
    fn test_cancelled_wait_leaves_task_running() {
        let registry = JobRegistry::default();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let job = registry
            .execute("blocked", 0, move |_| {
                let _ = release_rx.recv();
                0
            })
            .unwrap();

        let token = CancellationToken::new();
        token.cancel();
        assert!(matches!(job.wait_with(&token), Err(JobError::Cancelled)));
        assert!(job.is_running());
        assert_eq!(registry.running_count(), 1);

        release_tx.send(()).unwrap();
        assert_eq!(job.wait().unwrap(), 0);
        job.decref();
    }

    #[test]
    fn test_wait_for_all_covers_every_task() {
        let registry = JobRegistry::default();
        for i in 0..4 {
            let job = registry
                .execute(format!("sleeper {i}"), 0, |_| {
                    std::thread::sleep(Duration::from_millis(5));
                    0
                })
                .unwrap();
            job.decref();
        }
        registry.wait_for_all();
        assert_eq!(registry.running_count(), 0);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_wait_async() {
        let registry = JobRegistry::default();
        let job = registry.execute("async", 0, |_| 3).unwrap();
        assert_eq!(job.wait_async().await.unwrap(), 3);
        job.decref();
    }
}
