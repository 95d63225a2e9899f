//! Error type shared by the session, filtering and export layers.
//!
//! The frame reader in [`crate::comm`] keeps returning plain
//! [`std::io::Error`]s, everything built on top of it reports a [`Error`].

use thiserror::Error;

/// Errors reported by the library.
#[derive(Debug, Error)]
pub enum Error {
    /// A parameter is out of range or inconsistent with the others.
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    /// The serial port could not be opened or configured.
    #[error("unable to open port {port}: {source}")]
    UnableToOpenPort {
        port: String,
        #[source]
        source: tokio_serial::Error,
    },

    /// The operation needs a prepared session.
    #[error("board session is not prepared")]
    SessionNotPrepared,

    /// `start_stream` was called while a stream is running.
    #[error("streaming thread already running")]
    StreamAlreadyRunning,

    /// `stop_stream` was called while nothing is streaming.
    #[error("streaming thread is not running")]
    StreamNotRunning,

    /// There is no data to operate on.
    #[error("no data available: {0}")]
    EmptyBuffer(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The EDF writer rejected the header or the samples.
    #[error("EDF export failed: {0}")]
    Edf(String),
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Error::InvalidArguments(message.into())
    }
}
