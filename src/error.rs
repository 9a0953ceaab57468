//! Error types for the voice pipeline

use thiserror::Error;

/// Main error type for the pipeline
#[derive(Error, Debug)]
pub enum Error {
    /// Unsupported sample rate or frame layout. Fatal to the call.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Permission denied, device missing, or device lost.
    #[error("Device unavailable: {0}")]
    Device(#[from] DeviceError),

    /// An operation was issued before the async step it depends on finished.
    #[error("Not ready: {0}")]
    NotReady(&'static str),

    #[error("Chunk rejected: {0}")]
    Chunk(#[from] ChunkError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),
}

impl Error {
    /// True for errors a UI should answer with a "grant microphone / plug in
    /// a device" prompt.
    pub fn is_device_unavailable(&self) -> bool {
        matches!(self, Error::Device(_))
    }
}

/// Device backend errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("Device not found: {0}")]
    NotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Unsupported stream configuration: {0}")]
    UnsupportedConfig(String),

    #[error("Failed to open stream: {0}")]
    StreamFailed(String),

    #[error("Device disconnected: {0}")]
    Disconnected(String),
}

/// Per-chunk playback errors. A rejected chunk never aborts its track.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChunkError {
    #[error("PCM16 chunk has odd length {0}")]
    OddLength(usize),
}

/// Result type alias for the pipeline
pub type Result<T> = std::result::Result<T, Error>;

/// Lifts backend failures into the pipeline taxonomy; an unsupported format
/// is a configuration problem, not a missing device.
pub(crate) fn from_device(err: DeviceError) -> Error {
    match err {
        DeviceError::UnsupportedConfig(msg) => Error::Config(msg),
        other => Error::Device(other),
    }
}
