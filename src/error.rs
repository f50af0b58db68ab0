//! Error types for tlsrelay.

use thiserror::Error;

use crate::tls::TlsError;

/// Process exit codes for the server and client subcommands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    /// Normal exit
    Success = 0,
    /// Unclassified failure
    Failure = 1,
    /// Invalid configuration
    Config = 2,
    /// Listen failed
    ListenFailed = 10,
    /// TLS identity could not be generated
    Identity = 12,
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> Self {
        code as i32
    }
}

/// Main error type for tlsrelay.
#[derive(Debug, Error)]
pub enum Error {
    #[error("listen failed: {0}")]
    ListenFailed(String),

    #[error("TLS identity error: {0}")]
    Identity(#[from] TlsError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("dial failed: {0}")]
    DialFailed(String),

    #[error("dial to {target} gave up after {attempts} attempts")]
    DialExhausted { target: String, attempts: u32 },

    #[error("cancelled by shutdown")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Returns the exit code for this error.
    pub fn exit_code(&self) -> ExitCode {
        match self {
            Error::ListenFailed(_) => ExitCode::ListenFailed,
            Error::Identity(_) => ExitCode::Identity,
            Error::Config(_) => ExitCode::Config,
            Error::Cancelled => ExitCode::Success,
            Error::DialFailed(_) | Error::DialExhausted { .. } | Error::Io(_) => ExitCode::Failure,
        }
    }
}

/// Result type alias for tlsrelay operations.
pub type Result<T> = std::result::Result<T, Error>;
