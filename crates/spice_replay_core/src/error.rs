//! Replay error types

use std::path::PathBuf;

use thiserror::Error;

/// A form field that failed validation.
///
/// Raised before any session state is touched, so callers can report it and
/// leave the running replay (if any) as it was.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InputError {
    /// The record file could not be opened
    #[error("open record file failed: {0}")]
    RecordFile(String),

    /// The port is not a number in 1..=65535
    #[error("port is not a number in [1, 65535]: {0:?}")]
    Port(String),

    /// The artificial delay is not a non-negative integer
    #[error("delay is not a number of microseconds: {0:?}")]
    Delay(String),

    /// The step count is outside [1, 500]
    #[error("next n is not in [1, 500]: {0:?}")]
    StepCount(String),

    /// The client command line could not be split into arguments
    #[error("client command line is malformed: {0}")]
    ClientCommand(String),
}

/// Errors raised by the replay core
#[derive(Error, Debug)]
pub enum ReplayError {
    /// Invalid user input
    #[error(transparent)]
    Input(#[from] InputError),

    /// Failed to read a recording
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The recording uses a format this source cannot decode
    #[error("unsupported recording: {0}")]
    UnsupportedRecording(String),

    /// A malformed record in the recording
    #[error("malformed recording at line {line}: {reason}")]
    Decode { line: usize, reason: String },

    /// The client helper could not be spawned
    #[error("failed to spawn client {program:?}: {source}")]
    ClientSpawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// Run was requested while a replay is still live
    #[error("a replay session is already running")]
    SessionActive,

    /// A control action was issued with no live session
    #[error("no replay session is running")]
    NoSession,

    /// The protocol server rejected an operation
    #[error("protocol server error: {0}")]
    Server(String),
}

/// Result type for replay operations
pub type Result<T> = std::result::Result<T, ReplayError>;
