use thiserror::Error;

/// Errors that can occur on a single connection.
///
/// Both variants are terminal for the connection instance they occurred on: a
/// caller that wants to retry must construct a new connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    /// The peer closed the connection, or the connection was closed locally
    /// while a read or write was in progress.
    #[error("Connection closed by peer")]
    ClosedByPeer,

    /// The underlying transport failed.
    #[error("Transport error: {detail}")]
    Transport { detail: String },
}

impl ConnectionError {
    pub(crate) fn from_io(error: std::io::Error) -> Self {
        match error.kind() {
            std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::NotConnected => ConnectionError::ClosedByPeer,
            _ => ConnectionError::Transport {
                detail: error.to_string(),
            },
        }
    }
}
