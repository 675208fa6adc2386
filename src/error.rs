//! Error types for the monitor.
//!
//! Only [`ConfigError`] is fatal before watching begins. Registration and
//! output failures are logged and skipped; notification errors are handled
//! according to the configured [`crate::config::ErrorPolicy`].

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("item {index} has no path")]
    MissingPath { index: usize },

    #[error("item {index}'s depth expects an integer but found {value:?}")]
    InvalidDepth { index: usize, value: String },

    #[error("item {index}'s events are invalid: unknown kind {token:?} in {value:?}")]
    InvalidEvents {
        index: usize,
        token: String,
        value: String,
    },

    #[error("unknown event kind {0:?}")]
    UnknownEventKind(String),

    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {reason}")]
    Parse { path: PathBuf, reason: String },

    #[error("invalid setting: {0}")]
    Invalid(String),
}

#[derive(Error, Debug)]
pub enum RegistrationError {
    #[error("failed to watch {path}: {source}")]
    Watch {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },

    #[error("failed to list {path}: {source}")]
    ReadDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl RegistrationError {
    pub fn path(&self) -> &PathBuf {
        match self {
            RegistrationError::Watch { path, .. } | RegistrationError::ReadDir { path, .. } => path,
        }
    }
}

#[derive(Error, Debug)]
#[error("notification source failed: {message}")]
pub struct NotificationSourceError {
    pub message: String,
    pub paths: Vec<PathBuf>,
}

impl From<notify::Error> for NotificationSourceError {
    fn from(err: notify::Error) -> Self {
        let message = err.to_string();
        Self {
            message,
            paths: err.paths,
        }
    }
}

#[derive(Error, Debug)]
pub enum OutputSinkError {
    #[error("failed to write to stdout: {0}")]
    Stdout(#[source] std::io::Error),

    #[error("failed to append to {path}: {source}")]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
