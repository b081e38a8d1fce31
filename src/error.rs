//! Error handling for the station logger

use std::io;

use thiserror::Error;

/// Result type for station operations
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Device error: {0}")]
    Device(String),
    /// The calibration spectrum has no resolvable peak
    #[error("Calibration spectrum has no resolvable peak")]
    DegenerateSpectrum,
    /// A blocking wait observed the shutdown token
    #[error("Shutting down")]
    ShuttingDown,
    /// The other end of a queue was dropped
    #[error("Queue peer disconnected")]
    Disconnected,
}

impl Error {
    pub fn device<S: Into<String>>(msg: S) -> Self {
        Error::Device(msg.into())
    }

    pub fn config<S: Into<String>>(msg: S) -> Self {
        Error::Config(msg.into())
    }

    /// True only for a wait cancelled by the shutdown token. A vanished queue
    /// peer is a failure, not a stop.
    pub fn is_shutdown(&self) -> bool {
        matches!(self, Error::ShuttingDown)
    }
}
