// SPDX-License-Identifier: GPL-3.0-only

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::sync::{Mutex, PoisonError};

use super::{CommandLine, CommandOutput, CommandRunner, DEFAULT_TIMEOUT};
use crate::{Result, SysError};

/// Canned answer for a scripted command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Output {
        stdout: Vec<u8>,
        stderr: String,
        exit_code: i32,
    },
    /// The command is reported as having hit its deadline
    Timeout,
}

impl Reply {
    pub fn ok(stdout: impl Into<Vec<u8>>) -> Self {
        Reply::Output {
            stdout: stdout.into(),
            stderr: String::new(),
            exit_code: 0,
        }
    }

    pub fn fail(exit_code: i32, stderr: impl Into<String>) -> Self {
        Reply::Output {
            stdout: Vec::new(),
            stderr: stderr.into(),
            exit_code,
        }
    }
}

type Handler = Box<dyn Fn(&CommandLine, &[u8]) -> Option<Reply> + Send + Sync>;

/// In-memory [`CommandRunner`] that records calls and plays back replies.
///
/// Replies are matched by the longest registered prefix of the rendered
/// command line. Each prefix owns a queue; the last reply in a queue
/// repeats. Commands matching nothing succeed with empty output. A handler,
/// when set, is consulted first and receives whatever was streamed to stdin.
#[derive(Default)]
pub struct ScriptedRunner {
    scripts: Mutex<Vec<(String, VecDeque<Reply>)>>,
    calls: Mutex<Vec<String>>,
    handler: Option<Handler>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&CommandLine, &[u8]) -> Option<Reply> + Send + Sync + 'static,
    {
        self.handler = Some(Box::new(handler));
        self
    }

    /// Queue `reply` for commands starting with `prefix`.
    pub fn on(&self, prefix: impl Into<String>, reply: Reply) -> &Self {
        let prefix = prefix.into();
        let mut scripts = self.scripts.lock().unwrap_or_else(PoisonError::into_inner);
        match scripts.iter_mut().find(|(known, _)| *known == prefix) {
            Some((_, replies)) => replies.push_back(reply),
            None => scripts.push((prefix, VecDeque::from([reply]))),
        }
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn call_count(&self, prefix: &str) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|call| call.starts_with(prefix))
            .count()
    }

    fn reply_for(&self, command: &CommandLine, input: &[u8]) -> Reply {
        let rendered = command.render();
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(rendered.clone());

        if let Some(reply) = self.handler.as_ref().and_then(|handler| handler(command, input)) {
            return reply;
        }

        let mut scripts = self.scripts.lock().unwrap_or_else(PoisonError::into_inner);
        let Some((_, replies)) = scripts
            .iter_mut()
            .filter(|(prefix, _)| rendered.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
        else {
            return Reply::ok(Vec::new());
        };

        if replies.len() > 1 {
            replies.pop_front().unwrap_or_else(|| Reply::ok(Vec::new()))
        } else {
            replies.front().cloned().unwrap_or_else(|| Reply::ok(Vec::new()))
        }
    }
}

fn finish(command: &CommandLine, reply: Reply, sink: Option<&mut dyn Write>) -> Result<CommandOutput> {
    match reply {
        Reply::Timeout => Err(SysError::Timeout {
            command: command.render(),
            timeout: command.timeout.unwrap_or(DEFAULT_TIMEOUT),
        }),
        Reply::Output {
            stdout,
            stderr,
            exit_code,
        } => {
            let stdout = match sink {
                Some(sink) => {
                    sink.write_all(&stdout)?;
                    String::new()
                }
                None => String::from_utf8_lossy(&stdout).to_string(),
            };
            Ok(CommandOutput {
                command: command.render(),
                stdout,
                stderr,
                exit_code: Some(exit_code),
            })
        }
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, command: &CommandLine) -> Result<CommandOutput> {
        let reply = self.reply_for(command, &[]);
        finish(command, reply, None)
    }

    fn run_with_input(
        &self,
        command: &CommandLine,
        input: &mut dyn Read,
    ) -> Result<CommandOutput> {
        let mut buffer = Vec::new();
        input.read_to_end(&mut buffer)?;
        let reply = self.reply_for(command, &buffer);
        finish(command, reply, None)
    }

    fn run_to_writer(
        &self,
        command: &CommandLine,
        output: &mut dyn Write,
    ) -> Result<CommandOutput> {
        let reply = self.reply_for(command, &[]);
        finish(command, reply, Some(output))
    }
}
