use std::fmt;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, BenchError>;

#[derive(Error, Debug)]
pub enum BenchError {
    #[error("Setup error: {0}")]
    Setup(String),
    #[error("Protocol desynchronization: {0}")]
    ProtocolDesync(String),
    #[error("Transfer error: {0}")]
    Transfer(String),
    #[error("Correctness error: {0}")]
    Correctness(String),
    #[error("Interrupted")]
    Interrupted,
    #[error("Engine error: {0}")]
    Engine(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parsing error")]
    Parse,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Coarse classification of a [`BenchError`], stable enough to be stored
/// in reports and compared in tests.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Setup,
    ProtocolDesync,
    Transfer,
    Correctness,
    Interrupted,
    Other,
}

impl BenchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BenchError::Setup(_) | BenchError::Io(_) => ErrorKind::Setup,
            BenchError::ProtocolDesync(_) | BenchError::Parse => {
                ErrorKind::ProtocolDesync
            }
            BenchError::Transfer(_) => ErrorKind::Transfer,
            BenchError::Correctness(_) => ErrorKind::Correctness,
            BenchError::Interrupted => ErrorKind::Interrupted,
            BenchError::Engine(_)
            | BenchError::Config(_)
            | BenchError::Other(_) => ErrorKind::Other,
        }
    }

    /// Re-labels a raw engine failure as a setup failure, leaving every
    /// other variant untouched.
    pub fn into_setup(self) -> Self {
        match self {
            BenchError::Engine(msg) => BenchError::Setup(msg),
            other => other,
        }
    }

    /// Re-labels a raw engine failure as a transfer failure.
    pub fn into_transfer(self) -> Self {
        match self {
            BenchError::Engine(msg) => BenchError::Transfer(msg),
            other => other,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Setup => "setup",
            ErrorKind::ProtocolDesync => "protocol-desync",
            ErrorKind::Transfer => "transfer",
            ErrorKind::Correctness => "correctness",
            ErrorKind::Interrupted => "interrupted",
            ErrorKind::Other => "other",
        };
        write!(f, "{}", name)
    }
}

impl From<serde_json::Error> for BenchError {
    fn from(_: serde_json::Error) -> Self {
        Self::Parse
    }
}
