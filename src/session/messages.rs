//! Command, event, and phase types for the voice session actor.

use crate::audio::capture::CaptureEvent;
use crate::audio::playback::DecodedAudio;
use crate::error::Result;
use tokio::sync::oneshot;

/// Observable session phase, mirrored through a `watch` channel so the UI
/// can drive the toggle and record button.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Voice mode off; no resources held.
    Disabled,
    /// Device acquired and format negotiated; ready to record.
    Armed,
    /// Microphone live, chunks accumulating, VAD loop running.
    Recording,
    /// Capture finalized; assembling/transcribing the utterance.
    Finalizing,
}

/// User-visible events broadcast by the session.
#[derive(Debug, Clone)]
pub enum VoiceEvent {
    /// The session phase changed.
    PhaseChanged(SessionPhase),
    /// Short status line for the mic indicator.
    Status(String),
    /// A recognized utterance, already handed to the chat dispatcher.
    TranscriptReady(String),
    /// A chat-visible system message (recoverable errors).
    SystemMessage(String),
}

/// Commands accepted by the session actor.
pub(crate) enum SessionCommand {
    Enable(oneshot::Sender<Result<()>>),
    Disable,
    StartRecording,
    StopRecording,
    SubmitTranscript(String),
    ReplyReady(String),
    Shutdown,
}

/// Internal events: every callback of the capture/VAD/service layers maps
/// to exactly one of these, consumed as a state transition by the actor.
pub(crate) enum SessionEvent {
    /// Chunk delivery, finalization, or device failure from the capture.
    Capture { generation: u64, event: CaptureEvent },
    /// The VAD loop observed the full silence hold.
    SilenceElapsed { generation: u64 },
    /// The transcription call settled.
    Transcribed {
        generation: u64,
        result: Result<String>,
    },
    /// The synthesis call settled and the payload was decoded.
    SpeechReady {
        generation: u64,
        result: Result<DecodedAudio>,
    },
    /// The chat dispatch call settled.
    Dispatched {
        generation: u64,
        result: Result<()>,
    },
}
