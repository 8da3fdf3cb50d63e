//! Shell selection and command-line construction
//!
//! Commands are always run through a shell. The caller picks between the
//! user's shell and the fixed application shell; the rest of the subsystem
//! does not care which one was used.

use std::env;
use std::ffi::OsStr;
use std::path::Path;
use std::process::Command;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::JobsConfig;

/// Which shell runs a command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShellKind {
    /// The user's configured shell (`user_shell`, then `$SHELL`, then a fallback)
    #[default]
    User,
    /// The application's own fixed shell (`app_shell`)
    App,
}

/// A resolved shell program together with its "run this string" flag
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shell {
    pub program: String,
    pub flag: String,
}

impl Shell {
    /// Resolve the shell for `kind` from configuration and environment
    pub fn resolve(kind: ShellKind, config: &JobsConfig) -> Self {
        let program = match kind {
            ShellKind::App => config.app_shell.clone(),
            ShellKind::User => config
                .user_shell
                .clone()
                .or_else(|| env::var("SHELL").ok().filter(|s| !s.is_empty()))
                .unwrap_or_else(|| fallback(config)),
        };
        debug!(kind = ?kind, shell = %program, "Resolved shell");

        Self {
            program,
            flag: config.shell_flag.clone(),
        }
    }

    /// Build a [`Command`] that runs `command` through this shell
    ///
    /// A command string starting with `-` or `+` would otherwise be parsed as
    /// shell options. For POSIX-style flags the option list is terminated with
    /// `--`, so the string is looked up in the search path like any other.
    pub fn command(&self, command: &str) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg(&self.flag);
        if needs_option_terminator(&self.flag, command) {
            cmd.arg("--");
        }
        cmd.arg(command);
        cmd
    }

    /// Base name of the shell program
    pub fn name(&self) -> &str {
        Path::new(&self.program)
            .file_name()
            .and_then(OsStr::to_str)
            .unwrap_or(&self.program)
    }
}

fn needs_option_terminator(flag: &str, command: &str) -> bool {
    flag.starts_with('-') && (command.starts_with('-') || command.starts_with('+'))
}

/// Shell used when neither configuration nor environment name one
fn fallback(config: &JobsConfig) -> String {
    #[cfg(unix)]
    {
        if let Ok(bash) = which::which("bash") {
            debug!(bash = %bash.display(), "Found bash via PATH");
            return bash.to_string_lossy().to_string();
        }
    }

    #[cfg(windows)]
    {
        if let Ok(comspec) = env::var("COMSPEC") {
            return comspec;
        }
    }

    config.app_shell.clone()
}
