// src/error.rs
//
// Error type shared by the session, decoder and capture layers.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CaptureError {
    /// Serial link could not be opened or dropped mid-session.
    #[error("{device}: connection error: {message}")]
    Connection { device: String, message: String },

    /// The device answered, but not the way the protocol says it should.
    #[error("{device}: protocol error: {message}")]
    Protocol { device: String, message: String },

    /// A command/response deadline expired.
    #[error("timeout after {0} ms")]
    Timeout(u32),

    #[error("configuration error: {0}")]
    Configuration(String),

    /// Declared frame length exceeds the sanity ceiling; the stream cannot
    /// be resynchronized safely.
    #[error("malformed frame: declared length {declared} exceeds limit {limit}")]
    MalformedFrame { declared: usize, limit: usize },

    /// Two consecutive null frames with a zero device timestamp.
    #[error("device reported an internal error")]
    DeviceInternal,

    #[error("pipe write error: {0}")]
    Pipe(#[from] std::io::Error),

    #[error("capture cancelled")]
    Cancelled,
}

impl CaptureError {
    pub fn connection(device: impl Into<String>, message: impl Into<String>) -> Self {
        CaptureError::Connection {
            device: device.into(),
            message: message.into(),
        }
    }

    pub fn protocol(device: impl Into<String>, message: impl Into<String>) -> Self {
        CaptureError::Protocol {
            device: device.into(),
            message: message.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        CaptureError::Configuration(message.into())
    }

    /// Timeouts are retried once during session initiation and fatal
    /// everywhere else; callers match on this to tell the cases apart.
    pub fn is_timeout(&self) -> bool {
        matches!(self, CaptureError::Timeout(_))
    }
}
