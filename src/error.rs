//! Error types for knob-panel.

use thiserror::Error;

/// Result type alias for knob-panel operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by collaborators. The control core logs them and degrades;
/// only a missing speaker at startup is fatal.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Control device error
    #[error("input device error: {0}")]
    Device(String),

    /// Speaker output or decoding error
    #[error("audio error: {0}")]
    Audio(String),

    /// Hardware mixer error
    #[error("mixer error: {0}")]
    Mixer(String),

    /// Microphone capture error
    #[error("recording error: {0}")]
    Recording(String),

    /// Speech synthesis error
    #[error("synthesis error: {0}")]
    Synthesis(String),

    /// Transcription or blog relay error
    #[error("posting error: {0}")]
    Posting(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON error
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// WAV encoding error
    #[error("wav error: {0}")]
    Wav(#[from] hound::Error),
}
