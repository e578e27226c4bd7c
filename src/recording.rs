//! Recording state machine, encoding negotiation, and utterance assembly.
//!
//! The controller owns the chunk buffer and walks
//! `Idle → Armed → Recording → Finalizing → Armed`. Chunks append only
//! while a recording is live, the buffer is cleared at every start, and
//! assembly consumes it exactly once.

use crate::audio::capture::{CaptureEvent, CaptureHandle, SampleSpec};
use crate::error::{Result, VoiceError};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Audio encodings probed during format negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EncodingFormat {
    /// Opus in a WebM container.
    OpusWebm,
    /// Opus in an Ogg container.
    OpusOgg,
    /// Uncompressed PCM in a WAV container.
    Wav,
}

impl EncodingFormat {
    /// Preference order for negotiation; first supported wins.
    pub const PREFERENCE: [EncodingFormat; 3] = [
        EncodingFormat::OpusWebm,
        EncodingFormat::OpusOgg,
        EncodingFormat::Wav,
    ];

    /// MIME tag attached to the assembled utterance.
    pub fn mime(self) -> &'static str {
        match self {
            EncodingFormat::OpusWebm => "audio/webm",
            EncodingFormat::OpusOgg => "audio/ogg;codecs=opus",
            EncodingFormat::Wav => "audio/wav",
        }
    }

}

/// One complete recorded utterance, tagged with its negotiated encoding.
#[derive(Debug, Clone)]
pub struct EncodedUtterance {
    pub format: EncodingFormat,
    pub bytes: Bytes,
}

/// Recording controller states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
    Idle,
    Armed,
    Recording,
    Finalizing,
}

/// Drives capture start/stop and accumulates the chunk buffer.
pub struct RecordingController {
    state: RecordState,
    format: Option<EncodingFormat>,
    buffer: Vec<Bytes>,
    stop_requested: bool,
}

impl Default for RecordingController {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingController {
    pub fn new() -> Self {
        Self {
            state: RecordState::Idle,
            format: None,
            buffer: Vec::new(),
            stop_requested: false,
        }
    }

    pub fn state(&self) -> RecordState {
        self.state
    }

    /// The encoding negotiated at arm time.
    pub fn format(&self) -> Option<EncodingFormat> {
        self.format
    }

    /// Negotiate an encoding and arm the controller against an acquired
    /// capture handle.
    ///
    /// # Errors
    ///
    /// Returns [`VoiceError::EncodingUnsupported`] only when the provider
    /// accepts nothing at all — the preference list otherwise degrades to
    /// the provider's default.
    pub fn arm(&mut self, handle: &dyn CaptureHandle) -> Result<()> {
        let format = negotiate_format(handle).ok_or(VoiceError::EncodingUnsupported)?;
        info!("recording armed (encoding: {})", format.mime());
        self.format = Some(format);
        self.buffer.clear();
        self.stop_requested = false;
        self.state = RecordState::Armed;
        Ok(())
    }

    /// Start a recording: clear the buffer and begin chunk delivery.
    ///
    /// Valid from `Armed` only; a start while already `Recording` is a safe
    /// no-op and any other state is rejected.
    ///
    /// # Errors
    ///
    /// Fails if the controller is not armed or the handle refuses to start.
    pub fn begin(
        &mut self,
        handle: &mut dyn CaptureHandle,
        events: mpsc::Sender<CaptureEvent>,
    ) -> Result<()> {
        match self.state {
            RecordState::Recording => {
                debug!("start requested while already recording");
                return Ok(());
            }
            RecordState::Armed => {}
            other => {
                return Err(VoiceError::Channel(format!(
                    "cannot start recording from {other:?}"
                )));
            }
        }
        let format = self
            .format
            .ok_or_else(|| VoiceError::Channel("recording armed without a format".into()))?;
        self.buffer.clear();
        self.stop_requested = false;
        handle.start(format, events)?;
        self.state = RecordState::Recording;
        info!("recording started");
        Ok(())
    }

    /// Append a delivered chunk. Empty chunks are dropped.
    pub fn append_chunk(&mut self, chunk: Bytes) {
        if chunk.is_empty() {
            return;
        }
        if matches!(self.state, RecordState::Recording | RecordState::Finalizing) {
            self.buffer.push(chunk);
        } else {
            debug!("dropping {}-byte chunk outside recording", chunk.len());
        }
    }

    /// Request the capture to finalize. Valid from `Recording`; otherwise a
    /// logged no-op.
    pub fn request_stop(&mut self, handle: &mut dyn CaptureHandle) {
        if self.state != RecordState::Recording {
            info!("stop requested while not recording");
            return;
        }
        if self.stop_requested {
            debug!("stop already requested");
            return;
        }
        self.stop_requested = true;
        handle.stop();
    }

    /// The capture reported finalization: assemble the buffered chunks into
    /// one encoded utterance. The buffer is consumed exactly once either way.
    ///
    /// # Errors
    ///
    /// Returns [`VoiceError::EmptyCapture`] when nothing was captured (the
    /// caller reports "no audio" and makes no network call), or an assembly
    /// error for the negotiated container.
    pub fn finalize(&mut self, spec: Option<SampleSpec>) -> Result<EncodedUtterance> {
        self.state = RecordState::Finalizing;
        self.stop_requested = false;

        let chunks = std::mem::take(&mut self.buffer);
        if chunks.iter().all(|c| c.is_empty()) {
            warn!("recording finalized with no audio captured");
            return Err(VoiceError::EmptyCapture);
        }

        let format = self
            .format
            .ok_or_else(|| VoiceError::Channel("finalize without a negotiated format".into()))?;
        let bytes = assemble(format, &chunks, spec)?;
        info!("assembled {}-byte utterance ({})", bytes.len(), format.mime());
        Ok(EncodedUtterance { format, bytes })
    }

    /// The post-finalize hand-off settled (success or failure): return to
    /// `Armed`, ready for the next recording.
    pub fn settle(&mut self) {
        if self.state == RecordState::Finalizing {
            self.state = RecordState::Armed;
        }
    }

    /// Drop all recording state. Used on disable and device loss.
    pub fn reset(&mut self) {
        self.state = RecordState::Idle;
        self.format = None;
        self.buffer.clear();
        self.stop_requested = false;
    }
}

/// Walk the preference list, falling back to the provider default.
fn negotiate_format(handle: &dyn CaptureHandle) -> Option<EncodingFormat> {
    for format in EncodingFormat::PREFERENCE {
        if handle.supports(format) {
            return Some(format);
        }
        debug!("encoding {} not supported, trying next", format.mime());
    }
    handle.default_format()
}

/// Assemble buffered chunks into the final encoded object.
///
/// Provider-encoded streams (opus) concatenate directly, matching the
/// chunked container fragments the provider emits. Raw PCM16 chunks are
/// wrapped in a WAV container.
fn assemble(
    format: EncodingFormat,
    chunks: &[Bytes],
    spec: Option<SampleSpec>,
) -> Result<Bytes> {
    match (format, spec) {
        (EncodingFormat::Wav, Some(spec)) => wav_from_pcm16(chunks, spec),
        _ => {
            let total: usize = chunks.iter().map(Bytes::len).sum();
            let mut out = Vec::with_capacity(total);
            for chunk in chunks {
                out.extend_from_slice(chunk);
            }
            Ok(Bytes::from(out))
        }
    }
}

/// Wrap concatenated PCM16-LE chunk bytes in a WAV container.
fn wav_from_pcm16(chunks: &[Bytes], spec: SampleSpec) -> Result<Bytes> {
    let wav_spec = hound::WavSpec {
        channels: spec.channels,
        sample_rate: spec.sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, wav_spec)
            .map_err(|e| VoiceError::Channel(format!("failed to create wav writer: {e}")))?;
        for chunk in chunks {
            for pair in chunk.chunks_exact(2) {
                let sample = i16::from_le_bytes([pair[0], pair[1]]);
                writer
                    .write_sample(sample)
                    .map_err(|e| VoiceError::Channel(format!("failed to write wav sample: {e}")))?;
            }
        }
        writer
            .finalize()
            .map_err(|e| VoiceError::Channel(format!("failed to finalize wav: {e}")))?;
    }
    Ok(Bytes::from(cursor.into_inner()))
}
