//! Error Handling
//!
//! Error type definitions used in labeler

use std::fmt;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Exit code for a command line that names no recognized tool
pub const EXIT_INVALID_INVOCATION: i32 = 64;

/// Exit code for manifests or labels that cannot be processed
pub const EXIT_DATA_ERROR: i32 = 65;

/// Exit code for documents that cannot be re-emitted
pub const EXIT_SERIALIZATION: i32 = 70;

/// Exit code when the wrapped tool cannot be started
pub const EXIT_SPAWN_FAILED: i32 = 127;

/// Exit code after a user interrupt
pub const EXIT_INTERRUPTED: i32 = 130;

/// Processing stage an error surfaced in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Dispatch,
    Parse,
    Inject,
    Reassemble,
    Exec,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Dispatch => "dispatch",
            Stage::Parse => "parse",
            Stage::Inject => "inject",
            Stage::Reassemble => "reassemble",
            Stage::Exec => "exec",
        };
        f.write_str(name)
    }
}

/// Error types for labeler
#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid invocation: {0}")]
    InvalidInvocation(String),

    #[error("Malformed manifest (document {index}): {reason}")]
    MalformedManifest { index: usize, reason: String },

    #[error("Cannot re-emit document {index}: {reason}")]
    Serialization { index: usize, reason: String },

    #[error("Failed to start {tool}: {source}")]
    SubprocessSpawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{tool} exited with code {code}")]
    SubprocessExit { tool: String, code: i32 },

    #[error("Interrupted")]
    Interrupted,

    #[error("Label validation error: {0}")]
    LabelValidation(String),

    #[error("Configuration validation error: {0}")]
    ConfigValidation(String),

    #[error("Failed to fetch {url}: {source}")]
    Fetch {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a new invalid invocation error
    pub fn invalid_invocation<S: Into<String>>(message: S) -> Self {
        Error::InvalidInvocation(message.into())
    }

    /// Create a new configuration validation error
    pub fn config_validation<S: Into<String>>(message: S) -> Self {
        Error::ConfigValidation(message.into())
    }

    /// Create a new label validation error
    pub fn label_validation<S: Into<String>>(message: S) -> Self {
        Error::LabelValidation(message.into())
    }

    /// Stage that produced this error
    pub fn stage(&self) -> Stage {
        match self {
            Error::InvalidInvocation(_) | Error::ConfigValidation(_) => Stage::Dispatch,
            Error::MalformedManifest { .. } | Error::Yaml(_) | Error::Json(_) => Stage::Parse,
            Error::LabelValidation(_) => Stage::Inject,
            Error::Serialization { .. } => Stage::Reassemble,
            Error::SubprocessSpawn { .. }
            | Error::SubprocessExit { .. }
            | Error::Interrupted
            | Error::Fetch { .. }
            | Error::Io(_) => Stage::Exec,
        }
    }

    /// Process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::InvalidInvocation(_) => EXIT_INVALID_INVOCATION,
            Error::MalformedManifest { .. } | Error::LabelValidation(_) => EXIT_DATA_ERROR,
            Error::Serialization { .. } => EXIT_SERIALIZATION,
            Error::SubprocessSpawn { .. } => EXIT_SPAWN_FAILED,
            Error::SubprocessExit { code, .. } => *code,
            Error::Interrupted => EXIT_INTERRUPTED,
            _ => 1,
        }
    }
}
