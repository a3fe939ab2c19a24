// Copyright 2025 Jayashankar
// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;
use thiserror::Error;

/// Broad failure classes, used to decide how far a failure propagates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Bad input. Reported before anything touches the filesystem.
    Validation,
    /// A step was reached without the artifacts it needs.
    Precondition,
    /// The external tool failed, timed out or is missing.
    Execution,
    /// The filesystem refused a write, rename, chmod, chown or lock.
    Filesystem,
    /// Configuration could not be loaded or resolved.
    Config,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid {field} '{value}': {reason}")]
    InvalidFormat {
        field: &'static str,
        value: String,
        reason: String,
    },

    #[error("Invalid hostname '{name}': {reason}")]
    InvalidHostname { name: String, reason: String },

    #[error("Field '{0}' must not be empty")]
    EmptyField(&'static str),

    #[error("Cannot run {step}: {reason}")]
    Precondition { step: String, reason: String },

    #[error("Command failed: {command} ({status})\n{stderr}")]
    Command {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("Command '{command}' timed out after {seconds} seconds")]
    CommandTimeout { command: String, seconds: u64 },

    #[error("Command '{command}' not found.\n{hint}")]
    CommandNotFound { command: String, hint: String },

    #[error("Failed to create directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to read file {path}: {source}")]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to write file {path}: {source}")]
    WriteFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to set permissions on {path}: {source}")]
    Permissions {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to set ownership on {path}: {source}")]
    Ownership {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to lock {path}: {source}")]
    Lock {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Timed out after {seconds} seconds waiting for lock {path}. Is another run in progress?")]
    LockTimeout { path: PathBuf, seconds: u64 },

    #[error("Invalid path (non-UTF8): {0}")]
    InvalidPath(PathBuf),

    #[error("Unknown user '{0}'")]
    UnknownUser(String),

    #[error("Unknown group '{0}'")]
    UnknownGroup(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Step graph contains a cycle through {0}")]
    CyclicGraph(String),
}

impl Error {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::InvalidFormat { .. } | Error::InvalidHostname { .. } | Error::EmptyField(_) => {
                ErrorCategory::Validation
            }
            Error::Precondition { .. } => ErrorCategory::Precondition,
            Error::Command { .. } | Error::CommandTimeout { .. } | Error::CommandNotFound { .. } => {
                ErrorCategory::Execution
            }
            Error::CreateDir { .. }
            | Error::ReadFile { .. }
            | Error::WriteFile { .. }
            | Error::Permissions { .. }
            | Error::Ownership { .. }
            | Error::Lock { .. }
            | Error::LockTimeout { .. }
            | Error::InvalidPath(_)
            | Error::UnknownUser(_)
            | Error::UnknownGroup(_) => ErrorCategory::Filesystem,
            Error::Config(_) | Error::CyclicGraph(_) => ErrorCategory::Config,
        }
    }

    pub fn is_validation(&self) -> bool {
        self.category() == ErrorCategory::Validation
    }
}

pub type Result<T> = std::result::Result<T, Error>;
