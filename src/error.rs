use std::io;

use thiserror::Error;

/// Any error this library might encounter.
#[derive(Debug, Error)]
pub enum Error {
    /// The configuration file is invalid.
    #[error("invalid configuration: {0}")]
    BadConfig(String),

    /// A device configured by USB serial number has no matching TTY.
    #[error("no serial device found with serial number {serial:?}")]
    DeviceNotFound {
        /// The USB serial number which matched nothing.
        serial: String,
    },

    /// A serial port could not be opened.
    #[error("failed to open serial port {path:?}")]
    SerialOpen {
        /// The OS device path.
        path: String,
        /// The underlying driver error.
        #[source]
        source: tokio_serial::Error,
    },

    /// The SSH host key could not be loaded or parsed.
    #[error("failed to load SSH host key")]
    HostKey(#[source] russh::keys::Error),

    /// Problems registering or encoding metrics.
    #[error("metrics error")]
    Metrics(#[from] prometheus::Error),

    /// SSH transport errors.
    #[error("SSH server error")]
    Ssh(#[from] russh::Error),

    /// Underlying IO problem.
    #[error("IO error")]
    Io(#[from] io::Error),
}

impl Error {
    /// Borrow the inner message if this is a configuration error.
    ///
    /// Useful for tests asserting on diagnostics.
    pub fn as_bad_config(&self) -> Option<&str> {
        if let Self::BadConfig(msg) = self {
            Some(msg)
        } else {
            None
        }
    }
}
