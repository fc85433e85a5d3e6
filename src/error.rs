// ABOUTME: Custom error types for the migration engine
// ABOUTME: Carries the transient/fatal classification that decides whether a job can resume

use std::fmt;

/// Whether a failure is worth retrying from the last checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    Fatal,
    Unknown,
}

impl ErrorClass {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorClass::Transient => "transient",
            ErrorClass::Fatal => "fatal",
            ErrorClass::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
pub enum MigratorError {
    /// Network-level failure talking to the source or target.
    Connection(String),
    /// Credentials rejected or access forbidden.
    Permission(String),
    /// A precondition does not hold (missing tool, wrong mode, bad config).
    Validation(String),
    /// The replay or push tooling failed.
    Migration {
        message: String,
        class: ErrorClass,
        /// Set when the failure left partial progress behind.
        last_revision: Option<u64>,
    },
    /// Another job already owns the repository's working directory.
    Busy(String),
    /// The operator cancelled the job.
    Cancelled,
}

impl MigratorError {
    pub fn migration(message: impl Into<String>, class: ErrorClass) -> Self {
        MigratorError::Migration {
            message: message.into(),
            class,
            last_revision: None,
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            MigratorError::Connection(_) => ErrorClass::Transient,
            MigratorError::Permission(_) => ErrorClass::Fatal,
            MigratorError::Validation(_) => ErrorClass::Fatal,
            MigratorError::Migration { class, .. } => *class,
            MigratorError::Busy(_) => ErrorClass::Transient,
            MigratorError::Cancelled => ErrorClass::Fatal,
        }
    }

    /// Unknown failures are only resumable when they left progress behind.
    pub fn is_resumable(&self) -> bool {
        match self {
            MigratorError::Migration {
                class: ErrorClass::Unknown,
                last_revision,
                ..
            } => last_revision.is_some(),
            // A cancelled job keeps its checkpoint, so the operator may pick it up again.
            MigratorError::Cancelled => true,
            other => other.class() == ErrorClass::Transient,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            MigratorError::Connection(_) => "connection",
            MigratorError::Permission(_) => "permission",
            MigratorError::Validation(_) => "validation",
            MigratorError::Migration { .. } => "migration",
            MigratorError::Busy(_) => "busy",
            MigratorError::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for MigratorError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MigratorError::Connection(msg) => write!(f, "Connection error: {}", msg),
            MigratorError::Permission(msg) => write!(f, "Permission error: {}", msg),
            MigratorError::Validation(msg) => write!(f, "Validation error: {}", msg),
            MigratorError::Migration {
                message,
                class,
                last_revision: Some(rev),
            } => write!(f, "Migration error ({}, reached r{}): {}", class, rev, message),
            MigratorError::Migration { message, class, .. } => {
                write!(f, "Migration error ({}): {}", class, message)
            }
            MigratorError::Busy(msg) => write!(f, "Repository busy: {}", msg),
            MigratorError::Cancelled => write!(f, "Job was cancelled"),
        }
    }
}

impl std::error::Error for MigratorError {}
