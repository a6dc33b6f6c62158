use std::time::Duration;

/// Error surface of the peer. Transport-level failures stay confined to the
/// task that hit them; they are rendered into notification lines rather
/// than propagated across a command.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("peer unreachable: {0}")]
    Unreachable(#[source] std::io::Error),

    #[error("handshake failed: {0}")]
    HandshakeFailed(#[source] std::io::Error),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("no space for the file")]
    NoSpace,

    #[error("file already stored")]
    DuplicateFile,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("peer is not part of a ring yet")]
    NotBootstrapped,
}

impl Error {
    pub(crate) fn violation(what: impl Into<String>) -> Error {
        Error::ProtocolViolation(what.into())
    }
}

pub type Result<T> = core::result::Result<T, Error>;
