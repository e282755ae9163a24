//! Error types for the ABX client.
use std::io;

use thiserror::Error;

/// An error that can occur while streaming, decoding or recovering ABX records.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The byte stream to the exchange failed: refused, reset, or a read/write error.
    #[error("transport error: {source} while {context}")]
    Transport {
        /// The original error.
        #[source]
        source: io::Error,
        /// What the client was doing when the error occurred.
        context: String,
    },
    /// A frame could not be decoded into a record.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    /// A recovery response ended before a full frame arrived.
    #[error("incomplete recovery of sequence {sequence}: received {received} of 17 bytes")]
    IncompleteRecovery {
        /// The sequence number that was requested.
        sequence: i32,
        /// How many bytes arrived before the channel closed.
        received: usize,
    },
    /// The resend request carries the sequence in a single byte.
    #[error("sequence {0} does not fit in the single-byte resend field")]
    SequenceOutOfRange(i32),
    /// Local file I/O failed.
    #[error("IO error: {source} while {context}")]
    Io {
        /// The original error.
        #[source]
        source: io::Error,
        /// The context in which the error occurred.
        context: String,
    },
    /// A record could not be encoded to its wire form or serialized.
    #[error("encoding error: {0}")]
    Encode(String),
    /// A capture file is corrupt or unreadable.
    #[error("capture error: {0}")]
    Capture(String),
}

/// An alias for a `Result` with [`abx_client::Error`](crate::Error) as the error type.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Creates a new transport [`Error`](crate::Error).
    pub fn transport(error: io::Error, context: impl ToString) -> Self {
        Self::Transport {
            source: error,
            context: context.to_string(),
        }
    }

    /// Creates a new local I/O [`Error`](crate::Error).
    pub fn io(error: io::Error, context: impl ToString) -> Self {
        Self::Io {
            source: error,
            context: context.to_string(),
        }
    }

    /// Returns `true` for failures scoped to a single frame or recovery request.
    /// Those are dropped and logged; everything else aborts the run.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::MalformedFrame(_) | Self::IncompleteRecovery { .. } | Self::SequenceOutOfRange(_)
        )
    }
}
