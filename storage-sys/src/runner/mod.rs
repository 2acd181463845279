// SPDX-License-Identifier: GPL-3.0-only

//! Subprocess seam shared by every storage backend
//!
//! All external tools (`btrfs`, `rsync`, `dmsetup`, `thin_dump`, `df`, ...)
//! are invoked through [`CommandRunner`] so that callers can be exercised
//! against a [`ScriptedRunner`] without root privileges or block devices.

mod scripted;
mod system;

use std::fmt;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::Output;
use std::time::Duration;

pub use scripted::{Reply, ScriptedRunner};
pub use system::SystemRunner;

use crate::{Result, SysError};

/// Deadline applied to captured runs whose command line does not carry one
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// Locate `program` on `PATH`.
pub fn require_tool(program: &str) -> Result<PathBuf> {
    which::which(program).map_err(|_| SysError::MissingTool(program.to_string()))
}

/// A program invocation, rendered as `program arg1 arg2` for logs and matching
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub program: String,
    pub args: Vec<String>,
    pub timeout: Option<Duration>,
}

impl CommandLine {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn render(&self) -> String {
        let mut rendered = self.program.clone();
        for arg in &self.args {
            rendered.push(' ');
            rendered.push_str(arg);
        }
        rendered
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

/// Captured result of a finished process.
///
/// A non-zero exit is not an error at this level; [`CommandOutput::check`]
/// converts it into [`SysError::CommandFailed`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub command: String,
    pub stdout: String,
    pub stderr: String,
    /// `None` when the process was terminated by a signal
    pub exit_code: Option<i32>,
}

impl CommandOutput {
    pub(crate) fn from_process(command: String, output: &Output) -> Self {
        Self {
            command,
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code(),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    pub fn check(self) -> Result<Self> {
        if self.success() {
            return Ok(self);
        }
        Err(SysError::CommandFailed {
            command: self.command,
            stderr: self.stderr.trim().to_string(),
            exit_code: self.exit_code,
        })
    }

    /// Both streams, for tools that report conditions on either one.
    pub fn combined(&self) -> String {
        format!("{}{}", self.stdout, self.stderr)
    }
}

pub trait CommandRunner: Send + Sync {
    /// Run to completion with captured output, bounded by the command timeout.
    fn run(&self, command: &CommandLine) -> Result<CommandOutput>;

    /// Run with `input` streamed to the child's stdin.
    fn run_with_input(&self, command: &CommandLine, input: &mut dyn Read)
    -> Result<CommandOutput>;

    /// Run with the child's stdout streamed into `output`.
    ///
    /// The returned [`CommandOutput`] carries an empty `stdout`.
    fn run_to_writer(&self, command: &CommandLine, output: &mut dyn Write)
    -> Result<CommandOutput>;

    /// Run and return stdout, failing on a non-zero exit.
    fn capture(&self, command: &CommandLine) -> Result<String> {
        Ok(self.run(command)?.check()?.stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_program_and_arguments() {
        let command = CommandLine::new("dmsetup")
            .args(["message", "/dev/mapper/pool", "0"])
            .arg("reserve_metadata_snap");

        assert_eq!(
            command.render(),
            "dmsetup message /dev/mapper/pool 0 reserve_metadata_snap"
        );
        assert_eq!(command.timeout, None);
    }

    #[test]
    fn check_turns_non_zero_exit_into_command_failed() {
        let output = CommandOutput {
            command: "rsync -a a/ b/".to_string(),
            stdout: String::new(),
            stderr: "vanished files\n".to_string(),
            exit_code: Some(24),
        };

        match output.check() {
            Err(SysError::CommandFailed {
                command,
                stderr,
                exit_code,
            }) => {
                assert_eq!(command, "rsync -a a/ b/");
                assert_eq!(stderr, "vanished files");
                assert_eq!(exit_code, Some(24));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
