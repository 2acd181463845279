// SPDX-License-Identifier: GPL-3.0-only

use std::time::Duration;

use thiserror::Error;

/// Error types for system-level operations
#[derive(Error, Debug)]
pub enum SysError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{command} failed (exit code {exit_code:?}): {stderr}")]
    CommandFailed {
        command: String,
        stderr: String,
        exit_code: Option<i32>,
    },

    #[error("{command} timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Malformed metadata dump: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("Required tool not found: {0}")]
    MissingTool(String),
}

impl SysError {
    /// Whether repeating the operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SysError::Timeout { .. })
    }

    pub(crate) fn parse(message: impl Into<String>) -> Self {
        SysError::Parse(message.into())
    }
}

impl From<quick_xml::events::attributes::AttrError> for SysError {
    fn from(err: quick_xml::events::attributes::AttrError) -> Self {
        SysError::Xml(err.into())
    }
}

/// Result type alias for system operations
pub type Result<T> = std::result::Result<T, SysError>;
