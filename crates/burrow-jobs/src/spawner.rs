//! Spawning external commands as jobs

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ChildStdin, Stdio};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::cancellation::CancellationToken;
use crate::capture::{CapturedOutput, ErrorBuffer, StreamCapture};
use crate::error::{JobError, Result};
use crate::job::{Backend, Job, JobFlags, JobKind, JobParts};
use crate::registry::{JobRegistry, ReportedError};
use crate::shell::{Shell, ShellKind};

/// Everything needed to start an external command
#[derive(Debug, Clone, Default)]
pub struct SpawnRequest {
    /// Command line handed to the shell
    pub command: String,
    pub flags: JobFlags,
    /// Text shown in job listings (None = the command)
    pub description: Option<String>,
    /// Directory to run in (None or empty = current directory)
    pub working_dir: Option<PathBuf>,
    pub shell: ShellKind,
    /// Environment variables added to the inherited environment
    pub env: HashMap<String, String>,
}

impl SpawnRequest {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }

    pub fn flags(mut self, flags: JobFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Enable/disable stdout capture
    pub fn capture_output(mut self, capture: bool) -> Self {
        self.flags.capture_output = capture;
        self
    }

    /// Enable/disable the stdin pipe
    pub fn supply_input(mut self, supply: bool) -> Self {
        self.flags.supply_input = supply;
        self
    }

    pub fn keep_in_foreground(mut self, keep: bool) -> Self {
        self.flags.keep_in_foreground = keep;
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn shell(mut self, shell: ShellKind) -> Self {
        self.shell = shell;
        self
    }

    /// Add environment variable
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// Options for [`JobRegistry::run_external`]
#[derive(Debug, Clone, Default)]
pub struct ExternalOptions {
    pub keep_in_foreground: bool,
    /// Do not queue the job's errors for display when it fails
    pub skip_errors: bool,
    pub shell: ShellKind,
    /// Return a stdin pipe to the caller
    pub supply_input: bool,
    pub working_dir: Option<PathBuf>,
}

impl JobRegistry {
    /// Start `command` through the user's shell.
    ///
    /// A non-empty `working_dir` must be an existing directory. On success the
    /// job is registered and carries one reference owned by the caller.
    pub fn spawn(
        &self,
        command: &str,
        flags: JobFlags,
        description: Option<&str>,
        working_dir: Option<&Path>,
    ) -> Result<Job> {
        let mut request = SpawnRequest::new(command).flags(flags);
        request.description = description.map(str::to_string);
        request.working_dir = working_dir.map(Path::to_path_buf);
        self.spawn_request(request)
    }

    /// Start a command described by a full [`SpawnRequest`]
    pub fn spawn_request(&self, request: SpawnRequest) -> Result<Job> {
        let working_dir = validate_working_dir(request.working_dir.as_deref())?;

        let shell = Shell::resolve(request.shell, self.config());
        let mut cmd = shell.command(&request.command);
        if let Some(dir) = &working_dir {
            cmd.current_dir(dir);
        }
        cmd.envs(&request.env);

        let flags = request.flags;
        cmd.stdin(if flags.supply_input {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        cmd.stdout(if flags.capture_output {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        cmd.stderr(Stdio::piped());

        #[cfg(unix)]
        if !flags.keep_in_foreground {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        debug!(
            command = %request.command,
            shell = %shell.program,
            working_dir = ?working_dir,
            "Spawning job"
        );
        let mut child = cmd.spawn().map_err(|e| {
            warn!(command = %request.command, error = %e, "Failed to start job");
            JobError::ExecFailed(e)
        })?;
        let pid = child.id();
        let id = self.next_id();

        let errors = ErrorBuffer::new();
        let output = flags.capture_output.then(CapturedOutput::new);
        let mut capture = StreamCapture::new();
        let wired = (|| -> io::Result<()> {
            if let (Some(output), Some(stdout)) = (&output, child.stdout.take()) {
                capture.capture_output(id.0, stdout, Arc::clone(output))?;
            }
            match child.stderr.take() {
                Some(stderr) => capture.capture_errors(id.0, stderr, Arc::clone(&errors))?,
                None => errors.finish(),
            }
            Ok(())
        })();
        if let Err(e) = wired {
            warn!(pid, error = %e, "Failed to start capture, abandoning job");
            let _ = child.kill();
            let _ = child.wait();
            capture.release();
            return Err(JobError::ExecFailed(e));
        }

        let input = child.stdin.take();
        let description = request
            .description
            .filter(|d| !d.is_empty())
            .unwrap_or_else(|| request.command.clone());

        let job = Job::new(JobParts {
            id,
            kind: JobKind::External,
            pid: Some(pid),
            command: request.command,
            description,
            working_dir,
            flags,
            poll_interval: self.config().poll_interval(),
            backend: Backend::Process(child),
            input,
            capture,
            errors,
            output,
            progress: None,
            cancel: CancellationToken::none(),
            registry: self.downgrade(),
        });
        job.mark_running();
        self.register(job.clone());

        info!(job_id = %id, pid, command = %job.command(), "Job spawned");
        Ok(job)
    }

    /// Start a command nobody is going to wait for.
    ///
    /// The job drops out of the registry once it is reaped. When
    /// `supply_input` is set the stdin pipe is returned; drop it to close the
    /// input. Unless `skip_errors` is set, a failure queues the job's error
    /// text for [`JobRegistry::take_reported_errors`].
    pub fn run_external(
        &self,
        command: &str,
        options: ExternalOptions,
    ) -> Result<Option<ChildStdin>> {
        let mut request = SpawnRequest::new(command)
            .shell(options.shell)
            .keep_in_foreground(options.keep_in_foreground)
            .supply_input(options.supply_input);
        request.working_dir = options.working_dir;

        let job = self.spawn_request(request)?;
        let input = job.take_input();

        if !options.skip_errors {
            let registry = self.downgrade();
            job.set_exit_callback(move |job| {
                let exit_code = job.exit_code().unwrap_or_default();
                if exit_code == 0 {
                    return;
                }
                // Give the error stream a moment to drain after exit.
                job.error_buffer().wait_finished(job.poll_interval() * 10);
                let errors = job.errors();
                if errors.is_empty() {
                    return;
                }
                if let Some(registry) = registry.upgrade() {
                    registry.report_error(ReportedError {
                        job_id: job.id(),
                        description: job.description().to_string(),
                        exit_code,
                        errors,
                    });
                }
            });
        }

        job.decref();
        Ok(input)
    }
}

fn validate_working_dir(dir: Option<&Path>) -> Result<Option<PathBuf>> {
    match dir {
        None => Ok(None),
        Some(dir) if dir.as_os_str().is_empty() => Ok(None),
        Some(dir) if dir.is_dir() => Ok(Some(dir.to_path_buf())),
        Some(dir) => {
            warn!(path = %dir.display(), "Refusing to spawn in a bad working directory");
            Err(JobError::BadWorkingDir {
                path: dir.to_path_buf(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_builder() {
        let request = SpawnRequest::new("ls -l")
            .capture_output(true)
            .description("listing")
            .working_dir("/tmp")
            .shell(ShellKind::App)
            .env("LC_ALL", "C");

        assert_eq!(request.command, "ls -l");
        assert!(request.flags.capture_output);
        assert!(!request.flags.supply_input);
        assert_eq!(request.description.as_deref(), Some("listing"));
        assert_eq!(request.working_dir, Some(PathBuf::from("/tmp")));
        assert_eq!(request.shell, ShellKind::App);
        assert_eq!(request.env.get("LC_ALL").map(String::as_str), Some("C"));
    }

    #[test]
    fn test_working_dir_validation() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("file");
        std::fs::write(&file, "x").unwrap();

        assert!(validate_working_dir(None).unwrap().is_none());
        assert!(validate_working_dir(Some(Path::new(""))).unwrap().is_none());
        assert_eq!(
            validate_working_dir(Some(dir.path())).unwrap().as_deref(),
            Some(dir.path())
        );
        assert!(matches!(
            validate_working_dir(Some(&file)),
            Err(JobError::BadWorkingDir { .. })
        ));
        assert!(matches!(
            validate_working_dir(Some(&dir.path().join("no-such-path"))),
            Err(JobError::BadWorkingDir { .. })
        ));
    }

    #[test]
    fn test_bad_working_dir_registers_nothing() {
        let registry = JobRegistry::default();
        for _ in 0..3 {
            let result = registry.spawn(
                "echo",
                JobFlags::CAPTURE_OUTPUT,
                None,
                Some(Path::new("no-such-path")),
            );
            assert!(matches!(result, Err(JobError::BadWorkingDir { .. })));
        }
        assert!(registry.is_empty());
        assert_eq!(registry.running_count(), 0);
        assert!(!registry.redraw_pending());
    }

    #[test]
    fn test_missing_shell_is_exec_failure() {
        let config = crate::config::JobsConfig {
            app_shell: "/nonexistent/burrow-shell".to_string(),
            ..Default::default()
        };
        let registry = JobRegistry::new(config).unwrap();
        let result = registry.spawn_request(SpawnRequest::new("true").shell(ShellKind::App));

        assert!(matches!(result, Err(JobError::ExecFailed(_))));
        assert!(registry.is_empty());
    }
}
