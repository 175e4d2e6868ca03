//! Error kinds shared by the codec, transport and both orchestrators

use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeployError {
    /// Dial/accept/read/write failure. Fatal to the session on the side it occurs.
    #[error("connection error: {context}: {source}")]
    Connection {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("connection closed before the session completed")]
    ConnectionClosed,

    /// Control message out of sequence. Fatal to the connection.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Missing/garbled root marker or corrupt archive. Fatal to one extraction.
    #[error("format error: {0}")]
    Format(String),

    #[error("invalid data size: declared {declared} bytes, received {received}")]
    SizeMismatch { declared: u64, received: u64 },

    #[error("{}: {}", .path.display(), .source)]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Failure reported by the peer over the control channel
    #[error("remote error: {0}")]
    Remote(String),

    #[error("interrupted")]
    Interrupted,
}

impl DeployError {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        DeployError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn connection(context: impl Into<String>, source: io::Error) -> Self {
        DeployError::Connection {
            context: context.into(),
            source,
        }
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        DeployError::Protocol(msg.into())
    }

    pub fn format(msg: impl Into<String>) -> Self {
        DeployError::Format(msg.into())
    }

    /// Whether the error ends the connection it occurred on
    pub fn is_fatal_to_connection(&self) -> bool {
        matches!(
            self,
            DeployError::Connection { .. }
                | DeployError::ConnectionClosed
                | DeployError::Protocol(_)
                | DeployError::Interrupted
        )
    }
}

pub type Result<T, E = DeployError> = std::result::Result<T, E>;
