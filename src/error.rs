use std::io;
use thiserror::Error;

use crate::config::ConfigError;
use crate::timestamping::TimestampError;

/// Top-level server errors.
///
/// Anything surfacing here is fatal to the server: bind/listen failures
/// at startup or an unrecoverable socket error while running. Per-packet
/// problems (parse failures, missing timestamps, transient send errors)
/// are counted and handled in place instead.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Socket or filesystem I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Configuration could not be loaded or validated.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Timestamping facility failed during socket setup.
    #[error(transparent)]
    Timestamp(#[from] TimestampError),
}
