//! External service capabilities consumed by the session orchestrator.
//!
//! All three collaborators are opaque async capabilities injected at
//! construction time, so tests can substitute scripted fakes.

pub mod http;

use crate::error::Result;
use crate::recording::EncodedUtterance;
use async_trait::async_trait;
use bytes::Bytes;

/// Turns one encoded utterance into recognized text.
///
/// An empty or whitespace result means "no speech recognized" and is not an
/// error.
#[async_trait]
pub trait SpeechTranscriber: Send + Sync {
    async fn transcribe(&self, utterance: &EncodedUtterance) -> Result<String>;
}

/// Turns reply text into a binary audio payload.
///
/// A zero-length payload is invalid; the orchestrator reports it as
/// [`crate::error::VoiceError::EmptyAudio`].
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(&self, text: &str) -> Result<Bytes>;
}

/// Hands recognized text to the external chat pipeline.
///
/// The chat reply re-enters the session through
/// [`crate::session::SessionHandle::on_reply_ready`].
#[async_trait]
pub trait ChatDispatcher: Send + Sync {
    async fn dispatch(&self, text: &str) -> Result<()>;
}
