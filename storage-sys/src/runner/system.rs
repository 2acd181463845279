// SPDX-License-Identifier: GPL-3.0-only

use std::io::{self, Read, Write};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::{CommandLine, CommandOutput, CommandRunner, DEFAULT_TIMEOUT};
use crate::{Result, SysError};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Runs commands on the host.
///
/// Captured runs are killed once their deadline passes. Streamed runs
/// (`run_with_input`, `run_to_writer`) last as long as the stream does.
#[derive(Debug, Clone)]
pub struct SystemRunner {
    default_timeout: Duration,
}

impl Default for SystemRunner {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT)
    }
}

impl SystemRunner {
    pub fn new(default_timeout: Duration) -> Self {
        Self { default_timeout }
    }

    fn spawn(&self, command: &CommandLine, stdin: Stdio) -> Result<Child> {
        debug!(command = %command, "spawning");
        Command::new(&command.program)
            .args(&command.args)
            .stdin(stdin)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| spawn_error(&command.program, err))
    }
}

fn spawn_error(program: &str, err: io::Error) -> SysError {
    if err.kind() == io::ErrorKind::NotFound {
        SysError::MissingTool(program.to_string())
    } else {
        SysError::Io(err)
    }
}

fn drain(pipe: Option<impl Read>) -> io::Result<Vec<u8>> {
    let mut buffer = Vec::new();
    if let Some(mut pipe) = pipe {
        pipe.read_to_end(&mut buffer)?;
    }
    Ok(buffer)
}

fn joined(handle: thread::ScopedJoinHandle<'_, io::Result<Vec<u8>>>) -> io::Result<Vec<u8>> {
    handle
        .join()
        .map_err(|_| io::Error::other("pipe reader panicked"))?
}

impl CommandRunner for SystemRunner {
    fn run(&self, command: &CommandLine) -> Result<CommandOutput> {
        let timeout = command.timeout.unwrap_or(self.default_timeout);
        let rendered = command.render();
        debug!(command = %rendered, ?timeout, "running");

        let handle = duct::cmd(command.program.as_str(), &command.args)
            .stdin_null()
            .stdout_capture()
            .stderr_capture()
            .unchecked()
            .start()
            .map_err(|err| spawn_error(&command.program, err))?;

        let deadline = Instant::now() + timeout;
        loop {
            if let Some(output) = handle.try_wait()? {
                let output = CommandOutput::from_process(rendered, output);
                debug!(command = %output.command, exit_code = ?output.exit_code, "finished");
                return Ok(output);
            }
            if Instant::now() >= deadline {
                warn!(command = %rendered, ?timeout, "deadline passed, killing");
                handle.kill()?;
                return Err(SysError::Timeout {
                    command: rendered,
                    timeout,
                });
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    fn run_with_input(
        &self,
        command: &CommandLine,
        input: &mut dyn Read,
    ) -> Result<CommandOutput> {
        let mut child = self.spawn(command, Stdio::piped())?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let (stdout, stderr, copied) = thread::scope(|scope| {
            let stdout = scope.spawn(move || drain(stdout));
            let stderr = scope.spawn(move || drain(stderr));
            let copied = match child.stdin.take() {
                Some(mut stdin) => io::copy(input, &mut stdin).map(drop),
                None => Ok(()),
            };
            (joined(stdout), joined(stderr), copied)
        });

        let status = child.wait()?;
        let output = CommandOutput {
            command: command.render(),
            stdout: String::from_utf8_lossy(&stdout?).to_string(),
            stderr: String::from_utf8_lossy(&stderr?).to_string(),
            exit_code: status.code(),
        };
        // A child that exits early closes its stdin; its own status explains why.
        if let Err(err) = copied
            && output.success()
        {
            return Err(SysError::Io(err));
        }
        Ok(output)
    }

    fn run_to_writer(
        &self,
        command: &CommandLine,
        output: &mut dyn Write,
    ) -> Result<CommandOutput> {
        let mut child = self.spawn(command, Stdio::null())?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let (stderr, copied) = thread::scope(|scope| {
            let stderr = scope.spawn(move || drain(stderr));
            let copied = match stdout {
                Some(mut stdout) => io::copy(&mut stdout, output).map(drop),
                None => Ok(()),
            };
            (joined(stderr), copied)
        });

        if let Err(err) = copied {
            warn!(command = %command, "streaming stdout failed: {err}");
            let _ = child.kill();
            let _ = child.wait();
            return Err(SysError::Io(err));
        }

        let status = child.wait()?;
        Ok(CommandOutput {
            command: command.render(),
            stdout: String::new(),
            stderr: String::from_utf8_lossy(&stderr?).to_string(),
            exit_code: status.code(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shell_available() -> bool {
        which::which("sh").is_ok()
    }

    #[test]
    fn captures_output_and_exit_code() {
        if !shell_available() {
            return;
        }
        let runner = SystemRunner::default();
        let output = runner
            .run(&CommandLine::new("sh").args(["-c", "echo out; echo err >&2; exit 3"]))
            .expect("run");

        assert_eq!(output.stdout, "out\n");
        assert_eq!(output.stderr, "err\n");
        assert_eq!(output.exit_code, Some(3));
        assert!(!output.success());
    }

    #[test]
    fn kills_commands_past_their_deadline() {
        if !shell_available() {
            return;
        }
        let runner = SystemRunner::default();
        let started = Instant::now();
        let result = runner.run(
            &CommandLine::new("sh")
                .args(["-c", "sleep 5"])
                .timeout(Duration::from_millis(200)),
        );

        match result {
            Err(err @ SysError::Timeout { .. }) => assert!(err.is_retryable()),
            other => panic!("expected timeout, got {other:?}"),
        }
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn missing_program_is_reported_as_missing_tool() {
        let runner = SystemRunner::default();
        let result = runner.run(&CommandLine::new("definitely-not-a-real-tool-7f3a"));
        assert!(matches!(result, Err(SysError::MissingTool(_))));
    }

    #[test]
    fn streams_stdin_and_stdout() {
        if which::which("cat").is_err() || which::which("echo").is_err() {
            return;
        }
        let runner = SystemRunner::default();

        let mut input: &[u8] = b"payload";
        let output = runner
            .run_with_input(&CommandLine::new("cat"), &mut input)
            .expect("run with input");
        assert_eq!(output.stdout, "payload");

        let mut sink = Vec::new();
        let output = runner
            .run_to_writer(&CommandLine::new("echo").arg("streamed"), &mut sink)
            .expect("run to writer");
        assert!(output.success());
        assert_eq!(sink, b"streamed\n");
    }
}
