//! Error kinds shared by the decoder, sessions, registry and recorder.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// The link could not be established within the connect timeout.
    #[error("connect error: {0}")]
    Connect(String),

    /// A characteristic was missing or the subscription was rejected.
    #[error("subscribe error: {0}")]
    Subscribe(String),

    /// A notification payload did not match its declared structure.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// The reconnect budget is exhausted.
    #[error("device {device} lost after {attempts} attempt(s)")]
    DeviceLost { device: String, attempts: u32 },

    /// An output sink rejected a record.
    #[error("write error for subject {subject}: {reason}")]
    Write { subject: String, reason: String },

    /// Invalid configuration or device assignment.
    #[error("configuration error: {0}")]
    Config(String),

    /// The session has no live link.
    #[error("device is not connected")]
    NotConnected,

    /// The peripheral does not expose the requested characteristic.
    #[error("characteristic {0} is not supported by the device")]
    Unsupported(uuid::Uuid),

    #[error("operation timed out")]
    Timeout,

    #[error("BLE transport error: {0}")]
    Transport(#[from] btleplug::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
