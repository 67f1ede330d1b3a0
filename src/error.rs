use std::io;
use thiserror::Error;

/// Error type for pipekv operations.
#[derive(Error, Debug)]
pub enum KvsError {
    /// IO error from pipe or file operations.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Failure from a unix system call (mkfifo, poll, signal setup).
    #[error("system error: {0}")]
    Sys(#[from] nix::Error),

    /// Malformed command line in a job file or on client stdin.
    #[error("invalid command: {0}")]
    InvalidCommand(String),

    /// Malformed or unknown frame on a request pipe.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Every session slot is occupied.
    #[error("session table is full")]
    SessionLimit,

    /// Error message reported by the server.
    #[error("{0}")]
    StringError(String),
}

/// Result type alias for pipekv operations.
pub type Result<T> = std::result::Result<T, KvsError>;
