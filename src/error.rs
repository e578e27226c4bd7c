//! Error types for the voice session subsystem.

/// Top-level error type for the voice session controller.
#[derive(Debug, thiserror::Error)]
pub enum VoiceError {
    /// Microphone permission was refused by the platform.
    #[error("microphone permission denied: {0}")]
    PermissionDenied(String),

    /// No usable capture or output device is available.
    #[error("audio device unavailable: {0}")]
    DeviceUnavailable(String),

    /// The device rejected the requested stream configuration.
    #[error("capture constraint rejected: {0}")]
    Constraint(String),

    /// The amplitude analysis graph could not be built.
    #[error("analysis setup error: {0}")]
    AnalysisSetup(String),

    /// No encoding in the preference list is accepted by the capture provider.
    #[error("no supported recording encoding")]
    EncodingUnsupported,

    /// Recording finished without capturing any audio.
    #[error("no audio captured")]
    EmptyCapture,

    /// Transcription service failure.
    #[error("transcription error: {0}")]
    Transcription(String),

    /// Speech synthesis service failure.
    #[error("synthesis error: {0}")]
    Synthesis(String),

    /// The synthesis service returned a zero-length payload.
    #[error("synthesis returned empty audio")]
    EmptyAudio,

    /// Audio playback failure.
    #[error("playback error: {0}")]
    Playback(String),

    /// Chat dispatch failure.
    #[error("chat dispatch error: {0}")]
    Dispatch(String),

    /// Channel send/receive error.
    #[error("channel error: {0}")]
    Channel(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, VoiceError>;
