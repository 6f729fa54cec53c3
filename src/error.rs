//! Error types for the streaming stack

use thiserror::Error;

/// Main error type for the application
#[derive(Error, Debug)]
pub enum Error {
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Capture error: {0}")]
    Capture(#[from] CaptureError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Network errors.
///
/// Only setup failures (bind, socket options, handshake) surface as errors;
/// steady-state send/recv failures are logged and treated as transient drops.
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Socket bind failed on port {port}: {reason}")]
    BindFailed { port: u16, reason: String },

    #[error("Socket option failed: {0}")]
    SocketOption(String),

    #[error("Connection timed out")]
    ConnectTimeout,

    #[error("Stream config mismatch: {0}")]
    ConfigMismatch(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Send failed: {0}")]
    SendFailed(String),
}

/// Codec errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Encoder initialization failed: {0}")]
    EncoderInit(String),

    #[error("Decoder initialization failed: {0}")]
    DecoderInit(String),

    #[error("Encoding failed: {0}")]
    EncodingFailed(String),

    #[error("Decoding failed: {0}")]
    DecodingFailed(String),

    #[error("Invalid frame size: {0}")]
    InvalidFrameSize(usize),
}

/// Capture source errors
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Capture source not available: {0}")]
    NotAvailable(String),

    #[error("Capture failed: {0}")]
    CaptureFailed(String),
}

/// Result type alias for the application
pub type Result<T> = std::result::Result<T, Error>;
