//! Lectern: voice conversation subsystem for a document-reading assistant.
//!
//! This crate owns the voice session lifecycle:
//! Microphone → VAD → transcription → chat → synthesis → Speaker
//!
//! # Architecture
//!
//! One actor task owns every session resource and walks the session state
//! machine; the pieces around it are:
//! - **Device manager**: exclusive ownership of the microphone handle (`cpal`)
//! - **Analysis graph**: rolling amplitude window with smoothed RMS
//! - **VAD engine**: debounced silence detection that auto-stops recordings
//! - **Recording controller**: chunk accumulation and encoding negotiation
//! - **Playback controller**: single-handle speech playback with barge-in
//! - **Speech services**: remote transcription and synthesis over HTTP
//!
//! Hardware and network access sit behind narrow injected traits, so the
//! whole state machine is testable with scripted fakes.

pub mod audio;
pub mod config;
pub mod error;
pub mod logging;
pub mod recording;
pub mod services;
pub mod session;
pub mod vad;

pub use config::VoiceConfig;
pub use error::{Result, VoiceError};
pub use recording::{EncodedUtterance, EncodingFormat};
pub use session::{Capabilities, SessionHandle, SessionPhase, VoiceEvent, VoiceSession};
