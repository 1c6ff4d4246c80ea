//! Crate level error handling.
//!
//! Each subsystem defines its own error enum close to the code that raises
//! it; everything converges here so that callers which span subsystems (the
//! source threads and the writer) can use a single [`Result`] alias.

use std::io;

/// A specialized [`Result`] type for the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Aggregate of all error cases raised by the logger.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("{0}")]
    Frame(#[from] crate::framing::FrameError),

    #[error("failed to encode message: {0}")]
    Encode(#[from] rmp::encode::ValueWriteError),

    #[error("failed to decode message: {0}")]
    Decode(#[from] rmpv::decode::Error),

    #[error("{0}")]
    Envelope(#[from] crate::mp::EnvelopeError),

    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("message queue rejected message")]
    QueuePush,

    #[error("serial port error: {0}")]
    Serial(String),

    #[error("source error: {0}")]
    Source(String),

    #[error("mqtt error: {0}")]
    Mqtt(String),

    /// Escape hatch for errors that don't fit the above categories.
    #[error("{0}")]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
    #[inline(always)]
    pub fn other<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::Other(error.into())
    }

    #[inline(always)]
    pub fn source_err(msg: impl Into<String>) -> Self {
        Self::Source(msg.into())
    }
}

const _: () = {
    const fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<Error>();
};
