//! # burrow-jobs
//!
//! **Purpose**: Background job subsystem for the burrow file manager
//!
//! Runs shell commands and in-process tasks in the background, keeps a
//! registry of them for the UI, and lets callers wait on, feed and inspect
//! them.
//!
//! ## Features
//!
//! - **Spawning**: Commands run through the user's or the application's shell,
//!   optionally in a working directory and a process group of their own
//! - **Output Capture**: stdout split into lines, stderr accumulated as error text
//! - **Input**: Optional stdin pipe owned by the job or handed to the caller
//! - **Reaping**: Exit codes collected exactly once, exit callbacks run exactly once
//! - **Waiting**: Blocking, cancellable and async waits; wait-for-all
//! - **Tasks**: Closures on worker threads tracked like processes, with progress
//! - **Reference Counting**: Jobs stay listed until reaped and released
//!
//! ## Usage
//!
//! ```rust,no_run
//! use burrow_jobs::{JobFlags, JobRegistry, JobRef};
//!
//! # fn main() -> burrow_jobs::Result<()> {
//! let registry = JobRegistry::default();
//!
//! // Run a command and capture what it prints
//! let job = JobRef::adopt(registry.spawn("ls -1", JobFlags::CAPTURE_OUTPUT, None, None)?);
//! let code = job.wait()?;
//!
//! if let Some(output) = job.output() {
//!     for line in output.read_lines() {
//!         println!("{line}");
//!     }
//! }
//! println!("exit code {code}, errors: {}", job.errors());
//!
//! // Fire and forget
//! registry.run_external("touch stamp", Default::default())?;
//! registry.wait_for_all();
//! # Ok(())
//! # }
//! ```

pub mod cancellation;
pub mod capture;
pub mod config;
pub mod controller;
pub mod error;
pub mod job;
pub mod logging;
pub mod registry;
pub mod shell;
pub mod spawner;
pub mod task;

pub use cancellation::CancellationToken;
pub use capture::{split_lines, CapturedOutput, ErrorBuffer};
pub use config::{JobsConfig, LogConfig};
pub use error::{JobError, Result};
pub use job::{
    ExitCallback, Job, JobFlags, JobId, JobInfo, JobKind, JobRef, JobState, LOST_EXIT_CODE,
};
pub use registry::{JobRegistry, ReportedError};
pub use shell::{Shell, ShellKind};
pub use spawner::{ExternalOptions, SpawnRequest};
pub use task::{ProgressSnapshot, TaskContext};
