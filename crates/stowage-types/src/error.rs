use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, StowageError>;

/// Broad failure classes. Every phase-2 failure is fatal for the session; the
/// class only exists so that operators can tell a misbehaving peer apart from
/// a bookkeeping bug or a full disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Protocol,
    Resource,
    Invariant,
    Io,
    Config,
}

#[derive(Debug, Error)]
pub enum StowageError {
    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("unexpected {cmd:?} frame from {peer}")]
    UnexpectedMessage { peer: &'static str, cmd: char },

    #[error("wrong record length for {what}: {got} != {expected}")]
    RecordLength {
        what: &'static str,
        got: usize,
        expected: usize,
    },

    #[error("verdict for block {index} does not match the block list: {reason}")]
    VerdictDesync { index: u64, reason: String },

    #[error("storage fan-out exhausted: {0}")]
    FanOutExhausted(String),

    #[error("invariant violated: {0}")]
    Invariant(String),

    #[error("illegal block transition for block {index}: {from} -> {to}")]
    IllegalTransition {
        index: u64,
        from: &'static str,
        to: &'static str,
    },

    #[error("invalid manifest record in '{}': {reason}", path.display())]
    InvalidManifest { path: PathBuf, reason: String },

    #[error("corrupt data file '{}': {reason}", path.display())]
    CorruptData { path: PathBuf, reason: String },

    #[error("I/O error on '{}': {source}", path.display())]
    PathIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("peer channel error: {0}")]
    Channel(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] rmp_serde::encode::Error),

    #[error("deserialization error: {0}")]
    Deserialization(#[from] rmp_serde::decode::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

impl StowageError {
    /// Attach a path to an I/O error.
    pub fn io_at(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StowageError::PathIo {
            path: path.into(),
            source,
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            StowageError::Protocol(_)
            | StowageError::UnexpectedMessage { .. }
            | StowageError::RecordLength { .. }
            | StowageError::VerdictDesync { .. }
            | StowageError::Deserialization(_)
            | StowageError::Channel(_) => ErrorClass::Protocol,
            StowageError::FanOutExhausted(_) => ErrorClass::Resource,
            StowageError::Invariant(_) | StowageError::IllegalTransition { .. } => {
                ErrorClass::Invariant
            }
            StowageError::InvalidManifest { .. }
            | StowageError::CorruptData { .. }
            | StowageError::PathIo { .. }
            | StowageError::Io(_)
            | StowageError::Serialization(_) => ErrorClass::Io,
            StowageError::Config(_) => ErrorClass::Config,
        }
    }
}
