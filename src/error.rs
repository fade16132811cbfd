use std::io;

use thiserror::Error;
use tracing::error;

use crate::index::CursorContext;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, AgError>;

/// Errors raised by the extent bookkeeping engine.
#[derive(Debug, Error)]
pub enum AgError {
    /// Underlying I/O failure (configuration files).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// An index was found in a state its invariants forbid.
    #[error("corruption detected in {context}: {detail}")]
    Corruption {
        /// Index root the failing cursor was opened on.
        context: CursorContext,
        /// Which check failed.
        detail: &'static str,
    },
    /// A btree block failed its CRC32C check.
    #[error("checksum mismatch in {context} block {blkno}")]
    BadChecksum {
        /// Index root the block belongs to.
        context: CursorContext,
        /// Block address within the image.
        blkno: u64,
    },
    /// Not enough free space to satisfy a request or a reservation.
    #[error("no space left: {0}")]
    NoSpace(&'static str),
    /// In-memory growth of a work queue failed.
    #[error("out of memory")]
    NoMemory,
    /// A caller supplied an argument outside the accepted domain.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// Configuration could not be parsed or validated.
    #[error("configuration error: {0}")]
    Config(String),
    /// The session was shut down after an unrecoverable failure.
    #[error("filesystem has been shut down")]
    Shutdown,
}

impl AgError {
    /// Returns true for metadata corruption and checksum failures.
    pub fn is_corruption(&self) -> bool {
        matches!(self, AgError::Corruption { .. } | AgError::BadChecksum { .. })
    }
}

/// Builds a corruption error, logging it where it was detected.
pub fn corruption(context: CursorContext, detail: &'static str) -> AgError {
    error!(%context, detail, "metadata corruption detected");
    AgError::Corruption { context, detail }
}
