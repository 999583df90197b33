//! Error handling for rootd.
use std::path::PathBuf;

use thiserror::Error;

/// Defines all possible errors that can occur in the supervisor.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Error reading or writing a service directory.
    #[error("service store I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// Error parsing an invocation plan.
    #[error("invalid invocation plan: {0}")]
    Plan(#[from] PlanError),

    /// A supposedly consistent service directory is missing required files.
    #[error("corrupt service state at {path:?}: {detail}")]
    CorruptState {
        /// The service directory that failed the consistency contract.
        path: PathBuf,
        /// Which file or kind check failed.
        detail: String,
    },

    /// Error forking or executing a service child process.
    #[error("failed to spawn service '{service}': {source}")]
    Spawn {
        /// The service whose child could not be spawned.
        service: String,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// Error delivering a signal to a service process group.
    #[error("failed to signal service process: {0}")]
    Signal(#[from] nix::errno::Errno),

    /// Error serializing or deserializing control-plane JSON.
    #[error("control JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A configuration delta carried a field of the wrong shape.
    #[error("invalid configuration delta: {0}")]
    Delta(String),

    /// Error for poisoned mutex.
    #[error("mutex is poisoned: {0}")]
    MutexPoison(String),
}

impl<T> From<std::sync::PoisonError<T>> for ServiceError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        ServiceError::MutexPoison(err.to_string())
    }
}

/// Error type for invocation plan parsing.
#[derive(Debug, Error)]
pub enum PlanError {
    /// Input before the first section tag.
    #[error("line {0}: content precedes the first section tag")]
    ContentBeforeSection(usize),

    /// A tag other than the three recognized sections.
    #[error("line {0}: unknown section tag '{1}'")]
    UnknownSection(usize, String),

    /// A section appeared more than once.
    #[error("line {0}: duplicate section tag '{1}'")]
    DuplicateSection(usize, String),

    /// An environment entry with an empty name.
    #[error("line {0}: environment entry has an empty name")]
    EmptyEnvironmentName(usize),

    /// More than one line in the executable section.
    #[error("line {0}: executable section holds more than one entry")]
    ExcessExecutable(usize),

    /// A value that cannot survive the line-oriented encoding.
    #[error("field contains an embedded newline and cannot be serialized")]
    EmbeddedNewline,

    /// A field whose text reads back as a section tag.
    #[error("field '{0}' collides with a section tag")]
    ReservedLine(String),
}

/// Error type for the actuation file token.
#[derive(Debug, Error)]
#[error("unrecognized actuation token '{0}'")]
pub struct ActuationParseError(pub String);
