//! Speech playback: payload decoding, a cancellable output sink, and the
//! single-handle playback lifecycle.
//!
//! At most one playback is alive per session. Starting a new playback or a
//! new recording tears the previous handle down unconditionally, and both
//! completion and failure clear the handle.

use crate::error::{Result, VoiceError};
use async_trait::async_trait;
use cpal::StreamConfig;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Decoded audio ready for the output sink.
#[derive(Debug, Clone)]
pub struct DecodedAudio {
    /// Mono f32 samples.
    pub samples: Vec<f32>,
    /// Sample rate in Hz.
    pub sample_rate: u32,
}

/// Completion notice for one playback.
#[derive(Debug)]
pub struct PlaybackFinished {
    /// Identifier returned by [`PlaybackController::begin`].
    pub playback_id: u64,
    /// `Ok` for both natural completion and interruption; `Err` for sink
    /// failures.
    pub result: Result<()>,
}

/// Plays decoded audio. Implementations must honor the cancellation token
/// promptly and treat cancellation as a normal outcome.
#[async_trait]
pub trait AudioSink: Send + Sync {
    async fn play(&self, audio: DecodedAudio, cancel: CancellationToken) -> Result<()>;
}

/// A live playback: the task playing audio plus its cancellation token.
struct PlaybackHandle {
    id: u64,
    cancel: CancellationToken,
}

/// Manages the single playback slot for a session.
pub struct PlaybackController {
    sink: Arc<dyn AudioSink>,
    current: Option<PlaybackHandle>,
    next_id: u64,
}

impl PlaybackController {
    pub fn new(sink: Arc<dyn AudioSink>) -> Self {
        Self {
            sink,
            current: None,
            next_id: 0,
        }
    }

    /// Whether a playback handle is currently alive.
    pub fn is_active(&self) -> bool {
        self.current.is_some()
    }

    /// Tear down the current playback, if any. Safe to call repeatedly.
    pub fn interrupt(&mut self) {
        if let Some(handle) = self.current.take() {
            info!("interrupting active playback");
            handle.cancel.cancel();
        }
    }

    /// Start playing `audio`, tearing down any prior handle first. The
    /// completion notice arrives on `done_tx` tagged with the returned id.
    pub fn begin(&mut self, audio: DecodedAudio, done_tx: mpsc::UnboundedSender<PlaybackFinished>) -> u64 {
        self.interrupt();

        let id = self.next_id;
        self.next_id += 1;

        let cancel = CancellationToken::new();
        let sink = Arc::clone(&self.sink);
        let task_cancel = cancel.clone();
        tokio::spawn(async move {
            let result = sink.play(audio, task_cancel).await;
            let _ = done_tx.send(PlaybackFinished {
                playback_id: id,
                result,
            });
        });

        self.current = Some(PlaybackHandle { id, cancel });
        id
    }

    /// Clear the handle once its completion notice arrives. Stale ids (from
    /// an already-interrupted playback) are ignored.
    pub fn acknowledge(&mut self, playback_id: u64) -> bool {
        match &self.current {
            Some(handle) if handle.id == playback_id => {
                self.current = None;
                true
            }
            _ => {
                debug!("ignoring completion of stale playback {playback_id}");
                false
            }
        }
    }
}

/// Speaker output via cpal.
///
/// The `cpal::Stream` is `!Send`, so each play runs on a blocking thread
/// that owns the stream and polls a shared progress buffer.
pub struct CpalSink {
    output_device: Option<String>,
}

impl CpalSink {
    pub fn new(output_device: Option<String>) -> Self {
        Self { output_device }
    }
}

#[async_trait]
impl AudioSink for CpalSink {
    async fn play(&self, audio: DecodedAudio, cancel: CancellationToken) -> Result<()> {
        let device_name = self.output_device.clone();
        tokio::task::spawn_blocking(move || play_blocking(device_name.as_deref(), &audio, &cancel))
            .await
            .map_err(|e| VoiceError::Playback(format!("playback task failed: {e}")))?
    }
}

/// Internal buffer for tracking playback progress.
struct PlaybackBuffer {
    samples: Vec<f32>,
    position: usize,
    finished: bool,
}

fn play_blocking(
    device_name: Option<&str>,
    audio: &DecodedAudio,
    cancel: &CancellationToken,
) -> Result<()> {
    let host = cpal::default_host();

    let device = if let Some(name) = device_name {
        host.output_devices()
            .map_err(|e| VoiceError::Playback(format!("cannot enumerate devices: {e}")))?
            .find(|d| {
                d.description()
                    .ok()
                    .map(|desc| desc.name() == name)
                    .unwrap_or(false)
            })
            .ok_or_else(|| VoiceError::Playback(format!("output device '{name}' not found")))?
    } else {
        host.default_output_device()
            .ok_or_else(|| VoiceError::Playback("no default output device".into()))?
    };

    let stream_config = StreamConfig {
        channels: 1,
        sample_rate: audio.sample_rate,
        buffer_size: cpal::BufferSize::Default,
    };

    let buffer = Arc::new(Mutex::new(PlaybackBuffer {
        samples: audio.samples.clone(),
        position: 0,
        finished: false,
    }));
    let buffer_clone = Arc::clone(&buffer);

    let stream = device
        .build_output_stream(
            &stream_config,
            move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                let mut buf = match buffer_clone.lock() {
                    Ok(b) => b,
                    Err(_) => return,
                };
                for sample in data.iter_mut() {
                    if buf.position < buf.samples.len() {
                        *sample = buf.samples[buf.position];
                        buf.position += 1;
                    } else {
                        *sample = 0.0;
                        buf.finished = true;
                    }
                }
            },
            move |err| {
                error!("audio output stream error: {err}");
            },
            None,
        )
        .map_err(|e| VoiceError::Playback(format!("failed to build output stream: {e}")))?;

    stream
        .play()
        .map_err(|e| VoiceError::Playback(format!("failed to start output stream: {e}")))?;

    // Poll until the buffer drains or the handle is torn down.
    loop {
        std::thread::sleep(std::time::Duration::from_millis(10));
        if cancel.is_cancelled() {
            debug!("playback interrupted");
            break;
        }
        let buf = buffer
            .lock()
            .map_err(|e| VoiceError::Playback(format!("playback buffer lock poisoned: {e}")))?;
        if buf.finished {
            break;
        }
    }

    drop(stream);
    Ok(())
}

/// Decode a synthesis payload (MP3 or WAV) into mono f32 samples.
///
/// # Errors
///
/// Returns [`VoiceError::Playback`] when the payload cannot be probed or
/// decoded.
pub fn decode_payload(payload: &[u8]) -> Result<DecodedAudio> {
    use symphonia::core::audio::SampleBuffer;
    use symphonia::core::codecs::DecoderOptions;
    use symphonia::core::errors::Error as SymphError;
    use symphonia::core::formats::FormatOptions;
    use symphonia::core::io::MediaSourceStream;
    use symphonia::core::meta::MetadataOptions;
    use symphonia::core::probe::Hint;

    let cursor = std::io::Cursor::new(payload.to_vec());
    let mss = MediaSourceStream::new(Box::new(cursor), Default::default());

    let probed = symphonia::default::get_probe()
        .format(
            &Hint::new(),
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| VoiceError::Playback(format!("failed to probe audio: {e}")))?;

    let mut format = probed.format;
    let track = format
        .default_track()
        .ok_or_else(|| VoiceError::Playback("no default audio track".into()))?;
    let track_id = track.id;
    let codec_params = track.codec_params.clone();

    let sample_rate = codec_params
        .sample_rate
        .ok_or_else(|| VoiceError::Playback("unknown sample rate".into()))?;

    let mut decoder = symphonia::default::get_codecs()
        .make(&codec_params, &DecoderOptions::default())
        .map_err(|e| VoiceError::Playback(format!("failed to create decoder: {e}")))?;

    let mut samples: Vec<f32> = Vec::new();
    let mut sample_buf: Option<SampleBuffer<f32>> = None;

    loop {
        let packet = match format.next_packet() {
            Ok(p) => p,
            Err(SymphError::IoError(e)) => {
                if e.kind() == std::io::ErrorKind::UnexpectedEof {
                    break;
                }
                return Err(VoiceError::Playback(format!("audio read error: {e}")));
            }
            Err(e) => return Err(VoiceError::Playback(format!("audio read error: {e}"))),
        };

        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(d) => d,
            Err(SymphError::DecodeError(_)) => continue,
            Err(e) => return Err(VoiceError::Playback(format!("audio decode error: {e}"))),
        };

        let spec = *decoded.spec();
        let channels = spec.channels.count();
        let frames = decoded.frames() as u64;

        let required = (frames as usize).saturating_mul(channels);
        let needs_new = match sample_buf.as_ref() {
            Some(b) => b.capacity() < required,
            None => true,
        };
        if needs_new {
            sample_buf = Some(SampleBuffer::<f32>::new(frames, spec));
        } else if let Some(b) = sample_buf.as_mut() {
            b.clear();
        }

        if let Some(b) = sample_buf.as_mut() {
            b.copy_interleaved_ref(decoded);
        }

        let data = match sample_buf.as_ref() {
            Some(b) => b.samples(),
            None => &[],
        };
        if channels <= 1 {
            samples.extend_from_slice(data);
        } else {
            for frame in data.chunks_exact(channels) {
                let sum: f32 = frame.iter().sum();
                samples.push(sum / channels as f32);
            }
        }
    }

    if samples.is_empty() {
        return Err(VoiceError::Playback("decoded audio is empty".into()));
    }

    Ok(DecodedAudio {
        samples,
        sample_rate,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    /// Sink that idles until cancelled or a scripted duration elapses.
    struct TimedSink {
        duration: Duration,
    }

    #[async_trait]
    impl AudioSink for TimedSink {
        async fn play(&self, _audio: DecodedAudio, cancel: CancellationToken) -> Result<()> {
            tokio::select! {
                () = cancel.cancelled() => Ok(()),
                () = tokio::time::sleep(self.duration) => Ok(()),
            }
        }
    }

    fn beep() -> DecodedAudio {
        DecodedAudio {
            samples: vec![0.1; 160],
            sample_rate: 16_000,
        }
    }

    #[tokio::test]
    async fn begin_tears_down_previous_handle() {
        let sink = Arc::new(TimedSink {
            duration: Duration::from_secs(60),
        });
        let mut controller = PlaybackController::new(sink);
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();

        let first = controller.begin(beep(), done_tx.clone());
        let second = controller.begin(beep(), done_tx);
        assert_ne!(first, second);

        // The first playback was cancelled and reports completion; its id is
        // stale by the time the notice arrives.
        let finished = done_rx.recv().await.expect("completion notice");
        assert_eq!(finished.playback_id, first);
        assert!(finished.result.is_ok());
        assert!(!controller.acknowledge(finished.playback_id));
        assert!(controller.is_active());
    }

    #[tokio::test]
    async fn completion_clears_the_handle() {
        let sink = Arc::new(TimedSink {
            duration: Duration::from_millis(1),
        });
        let mut controller = PlaybackController::new(sink);
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();

        let id = controller.begin(beep(), done_tx);
        let finished = done_rx.recv().await.expect("completion notice");
        assert_eq!(finished.playback_id, id);
        assert!(controller.acknowledge(id));
        assert!(!controller.is_active());
    }

    #[tokio::test]
    async fn interrupt_without_playback_is_noop() {
        let sink = Arc::new(TimedSink {
            duration: Duration::from_millis(1),
        });
        let mut controller = PlaybackController::new(sink);
        controller.interrupt();
        controller.interrupt();
        assert!(!controller.is_active());
    }

    #[test]
    fn decode_rejects_garbage_payload() {
        let err = decode_payload(&[0u8; 32]).expect_err("garbage must not decode");
        assert!(matches!(err, VoiceError::Playback(_)));
    }

    #[test]
    fn decode_round_trips_wav() {
        // Build a tiny WAV in memory and decode it back.
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 16_000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = std::io::Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).expect("writer");
            for i in 0..160 {
                let s = ((i as f32 / 160.0) * std::f32::consts::TAU).sin();
                writer
                    .write_sample((s * i16::MAX as f32 * 0.5) as i16)
                    .expect("sample");
            }
            writer.finalize().expect("finalize");
        }
        let decoded = decode_payload(cursor.get_ref()).expect("decode");
        assert_eq!(decoded.sample_rate, 16_000);
        assert_eq!(decoded.samples.len(), 160);
    }
}
