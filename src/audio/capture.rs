//! Microphone capture: capability traits and the cpal implementation.
//!
//! The production provider captures at the device's native sample rate and
//! downsamples to the configured input rate. While a recording is active it
//! delivers PCM chunks on a fixed cadence; the amplitude tap is fed
//! continuously so the VAD engine can sample loudness at any time.

use crate::audio::analysis::LevelTap;
use crate::config::VoiceConfig;
use crate::error::{Result, VoiceError};
use crate::recording::EncodingFormat;
use async_trait::async_trait;
use bytes::Bytes;
use cpal::StreamConfig;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Sample layout of the PCM chunk stream delivered by a capture handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleSpec {
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Channel count (the cpal provider always delivers mono).
    pub channels: u16,
}

/// One event from an active recording.
#[derive(Debug, Clone)]
pub enum CaptureEvent {
    /// A chunk of recorded audio data, delivered on the configured cadence.
    Chunk(Bytes),
    /// The capture finalized after a stop request; no further chunks follow.
    Finalized,
    /// The underlying device failed mid-recording.
    Error(String),
}

/// Grants access to the microphone.
#[async_trait]
pub trait CaptureProvider: Send + Sync {
    /// Request microphone access and return a live capture handle.
    ///
    /// # Errors
    ///
    /// Fails with [`VoiceError::PermissionDenied`],
    /// [`VoiceError::DeviceUnavailable`], or [`VoiceError::Constraint`].
    async fn acquire(&self, config: &VoiceConfig) -> Result<Box<dyn CaptureHandle>>;
}

/// A live microphone stream. At most one exists per session and the device
/// manager owns it exclusively.
pub trait CaptureHandle: Send {
    /// Whether this handle can deliver chunks in `format`.
    fn supports(&self, format: EncodingFormat) -> bool;

    /// The format used when negotiation falls through the whole preference
    /// list, or `None` if the provider has nothing to offer.
    fn default_format(&self) -> Option<EncodingFormat>;

    /// Sample layout of delivered chunks; `None` for streams that are
    /// already container-encoded by the provider.
    fn sample_spec(&self) -> Option<SampleSpec>;

    /// A live amplitude tap for the analysis graph.
    fn level_tap(&self) -> LevelTap;

    /// Begin periodic chunk delivery in the negotiated format.
    ///
    /// # Errors
    ///
    /// Fails if a recording is already in progress on this handle.
    fn start(&mut self, format: EncodingFormat, events: mpsc::Sender<CaptureEvent>) -> Result<()>;

    /// Request finalization of the current recording. A final chunk (if any)
    /// and [`CaptureEvent::Finalized`] follow on the event channel. No-op
    /// when not recording.
    fn stop(&mut self);

    /// Stop the underlying stream and release the device. Idempotent; safe
    /// on an already-released handle.
    fn release(&mut self);
}

/// Microphone capture provider backed by cpal.
pub struct CpalCaptureProvider;

#[async_trait]
impl CaptureProvider for CpalCaptureProvider {
    async fn acquire(&self, config: &VoiceConfig) -> Result<Box<dyn CaptureHandle>> {
        let config = config.clone();
        // cpal device negotiation is blocking; keep it off the event loop.
        let handle = tokio::task::spawn_blocking(move || CpalCaptureHandle::open(&config))
            .await
            .map_err(|e| VoiceError::DeviceUnavailable(format!("capture init task failed: {e}")))??;
        Ok(Box::new(handle))
    }
}

/// State shared between the audio callback, the stream-owner thread, and the
/// handle.
struct SharedCapture {
    tap: LevelTap,
    recording: AtomicBool,
    stop_requested: AtomicBool,
    alive: AtomicBool,
    /// PCM16-LE bytes accumulated since the last chunk emission.
    pending: Mutex<Vec<u8>>,
    events: Mutex<Option<mpsc::Sender<CaptureEvent>>>,
}

impl SharedCapture {
    fn emit(&self, event: CaptureEvent) {
        let sender = self.events.lock().ok().and_then(|g| g.clone());
        if let Some(tx) = sender
            && tx.blocking_send(event).is_err()
        {
            debug!("capture event receiver gone");
        }
    }

    /// Swap out the accumulated PCM bytes.
    fn take_pending(&self) -> Vec<u8> {
        self.pending
            .lock()
            .map(|mut p| std::mem::take(&mut *p))
            .unwrap_or_default()
    }
}

/// A live cpal microphone stream.
///
/// The `cpal::Stream` is `!Send`, so a dedicated thread owns it for the
/// handle's whole lifetime and also drives chunk emission on the configured
/// cadence.
pub struct CpalCaptureHandle {
    shared: Arc<SharedCapture>,
    spec: SampleSpec,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl CpalCaptureHandle {
    /// Open the configured (or default) input device and start its stream.
    fn open(config: &VoiceConfig) -> Result<Self> {
        let host = cpal::default_host();

        let device = if let Some(ref name) = config.audio.input_device {
            host.input_devices()
                .map_err(|e| VoiceError::DeviceUnavailable(format!("cannot enumerate devices: {e}")))?
                .find(|d| {
                    d.description()
                        .ok()
                        .map(|desc| desc.name() == name)
                        .unwrap_or(false)
                })
                .ok_or_else(|| {
                    VoiceError::DeviceUnavailable(format!("input device '{name}' not found"))
                })?
        } else {
            host.default_input_device()
                .ok_or_else(|| VoiceError::DeviceUnavailable("no default input device".into()))?
        };

        let device_name = device
            .description()
            .map(|d| d.name().to_owned())
            .unwrap_or_else(|_| "<unknown>".into());
        info!("using input device: {device_name}");

        // Use the device's default config for best compatibility and
        // downsample in software.
        let default_config = device
            .default_input_config()
            .map_err(|e| VoiceError::Constraint(format!("no default input config: {e}")))?;

        let native_rate = default_config.sample_rate();
        let native_channels = default_config.channels();
        let stream_config = StreamConfig {
            channels: native_channels,
            sample_rate: native_rate,
            buffer_size: cpal::BufferSize::Default,
        };

        let target_rate = config.audio.input_sample_rate;
        if native_rate != target_rate {
            info!("will downsample from {native_rate}Hz to {target_rate}Hz");
        }

        let shared = Arc::new(SharedCapture {
            tap: LevelTap::new(&config.analysis),
            recording: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            alive: AtomicBool::new(true),
            pending: Mutex::new(Vec::new()),
            events: Mutex::new(None),
        });

        let chunk_interval = Duration::from_millis(config.recording.chunk_interval_ms.max(20));
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<()>>();

        let thread = {
            let shared = Arc::clone(&shared);
            std::thread::spawn(move || {
                run_stream_thread(
                    &device,
                    &stream_config,
                    native_rate,
                    native_channels,
                    target_rate,
                    chunk_interval,
                    shared,
                    &ready_tx,
                );
            })
        };

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = thread.join();
                return Err(e);
            }
            Err(_) => {
                let _ = thread.join();
                return Err(VoiceError::DeviceUnavailable(
                    "capture thread exited before the stream started".into(),
                ));
            }
        }

        info!("audio capture started: native {native_rate}Hz -> target {target_rate}Hz");

        Ok(Self {
            shared,
            spec: SampleSpec {
                sample_rate: target_rate,
                channels: 1,
            },
            thread: Some(thread),
        })
    }
}

impl CaptureHandle for CpalCaptureHandle {
    fn supports(&self, format: EncodingFormat) -> bool {
        // cpal yields raw PCM; WAV is the only encoding this provider can
        // honestly produce.
        format == EncodingFormat::Wav
    }

    fn default_format(&self) -> Option<EncodingFormat> {
        Some(EncodingFormat::Wav)
    }

    fn sample_spec(&self) -> Option<SampleSpec> {
        Some(self.spec)
    }

    fn level_tap(&self) -> LevelTap {
        self.shared.tap.clone()
    }

    fn start(&mut self, format: EncodingFormat, events: mpsc::Sender<CaptureEvent>) -> Result<()> {
        if !self.supports(format) {
            return Err(VoiceError::EncodingUnsupported);
        }
        if self.shared.recording.load(Ordering::Acquire) {
            return Err(VoiceError::Constraint("recording already in progress".into()));
        }
        self.shared.take_pending();
        if let Ok(mut guard) = self.shared.events.lock() {
            *guard = Some(events);
        }
        self.shared.stop_requested.store(false, Ordering::Release);
        self.shared.recording.store(true, Ordering::Release);
        Ok(())
    }

    fn stop(&mut self) {
        if self.shared.recording.load(Ordering::Acquire) {
            self.shared.stop_requested.store(true, Ordering::Release);
        } else {
            debug!("capture stop requested while not recording");
        }
    }

    fn release(&mut self) {
        self.shared.alive.store(false, Ordering::Release);
        self.shared.recording.store(false, Ordering::Release);
        self.shared.tap.detach();
        if let Ok(mut guard) = self.shared.events.lock() {
            guard.take();
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("capture stream thread panicked during release");
            }
            info!("capture device released");
        }
    }
}

impl Drop for CpalCaptureHandle {
    fn drop(&mut self) {
        self.release();
    }
}

/// Build the input stream and keep it alive, emitting chunks on cadence
/// until the handle is released.
#[allow(clippy::too_many_arguments)]
fn run_stream_thread(
    device: &cpal::Device,
    stream_config: &StreamConfig,
    native_rate: u32,
    native_channels: u16,
    target_rate: u32,
    chunk_interval: Duration,
    shared: Arc<SharedCapture>,
    ready_tx: &std::sync::mpsc::Sender<Result<()>>,
) {
    let cb_shared = Arc::clone(&shared);
    let err_shared = Arc::clone(&shared);

    let stream = device.build_input_stream(
        stream_config,
        move |data: &[f32], _info: &cpal::InputCallbackInfo| {
            let mono = if native_channels > 1 {
                to_mono(data, native_channels)
            } else {
                data.to_vec()
            };
            let samples = if native_rate != target_rate {
                downsample(&mono, native_rate, target_rate)
            } else {
                mono
            };

            cb_shared.tap.push(&samples);

            if cb_shared.recording.load(Ordering::Acquire)
                && let Ok(mut pending) = cb_shared.pending.lock()
            {
                for &s in &samples {
                    let v = (s.clamp(-1.0, 1.0) * f32::from(i16::MAX)).round() as i16;
                    pending.extend_from_slice(&v.to_le_bytes());
                }
            }
        },
        move |err| {
            error!("audio input stream error: {err}");
            if err_shared.recording.swap(false, Ordering::AcqRel) {
                err_shared.emit(CaptureEvent::Error(err.to_string()));
            }
        },
        None,
    );

    let stream = match stream {
        Ok(s) => s,
        Err(e) => {
            let _ = ready_tx.send(Err(classify_build_error(&e)));
            return;
        }
    };

    if let Err(e) = stream.play() {
        let _ = ready_tx.send(Err(VoiceError::DeviceUnavailable(format!(
            "failed to start input stream: {e}"
        ))));
        return;
    }
    let _ = ready_tx.send(Ok(()));

    let tick = chunk_interval.min(Duration::from_millis(20));
    let mut last_emit = Instant::now();

    while shared.alive.load(Ordering::Acquire) {
        std::thread::sleep(tick);

        if shared.recording.load(Ordering::Acquire) && last_emit.elapsed() >= chunk_interval {
            let bytes = shared.take_pending();
            shared.emit(CaptureEvent::Chunk(Bytes::from(bytes)));
            last_emit = Instant::now();
        }

        if shared.stop_requested.swap(false, Ordering::AcqRel)
            && shared.recording.swap(false, Ordering::AcqRel)
        {
            let remainder = shared.take_pending();
            if !remainder.is_empty() {
                shared.emit(CaptureEvent::Chunk(Bytes::from(remainder)));
            }
            shared.emit(CaptureEvent::Finalized);
            if let Ok(mut guard) = shared.events.lock() {
                guard.take();
            }
            last_emit = Instant::now();
        }
    }

    drop(stream);
    shared.tap.detach();
    debug!("capture stream thread exited");
}

fn classify_build_error(err: &cpal::BuildStreamError) -> VoiceError {
    match err {
        cpal::BuildStreamError::DeviceNotAvailable => {
            VoiceError::DeviceUnavailable("input device disappeared".into())
        }
        cpal::BuildStreamError::StreamConfigNotSupported | cpal::BuildStreamError::InvalidArgument => {
            VoiceError::Constraint(err.to_string())
        }
        other => {
            let msg = other.to_string();
            let lowered = msg.to_ascii_lowercase();
            if lowered.contains("permission") || lowered.contains("denied") {
                VoiceError::PermissionDenied(msg)
            } else {
                VoiceError::DeviceUnavailable(msg)
            }
        }
    }
}

/// Convert interleaved multi-channel audio to mono by averaging channels.
fn to_mono(data: &[f32], channels: u16) -> Vec<f32> {
    let ch = channels as usize;
    data.chunks_exact(ch)
        .map(|frame| frame.iter().sum::<f32>() / ch as f32)
        .collect()
}

/// Simple linear-interpolation downsampler.
///
/// For speech capture (48kHz → 16kHz) this is sufficient quality — no
/// anti-alias filter needed since human speech energy is below 8kHz.
fn downsample(samples: &[f32], src_rate: u32, dst_rate: u32) -> Vec<f32> {
    if src_rate == dst_rate || samples.is_empty() {
        return samples.to_vec();
    }

    let ratio = src_rate as f64 / dst_rate as f64;
    let out_len = (samples.len() as f64 / ratio) as usize;
    let mut output = Vec::with_capacity(out_len);

    for i in 0..out_len {
        let src_pos = i as f64 * ratio;
        let idx = src_pos as usize;
        let frac = src_pos - idx as f64;

        let sample = if idx + 1 < samples.len() {
            samples[idx] as f64 * (1.0 - frac) + samples[idx + 1] as f64 * frac
        } else {
            samples[idx.min(samples.len() - 1)] as f64
        };

        output.push(sample as f32);
    }

    output
}
