//! End-to-end lifecycle tests for the voice session actor, driven through
//! scripted hardware/service fakes.

use async_trait::async_trait;
use bytes::Bytes;
use lectern::audio::analysis::LevelTap;
use lectern::audio::capture::{CaptureEvent, CaptureHandle, CaptureProvider};
use lectern::audio::playback::{AudioSink, DecodedAudio};
use lectern::config::{AnalysisConfig, VoiceConfig};
use lectern::error::{Result, VoiceError};
use lectern::recording::{EncodedUtterance, EncodingFormat};
use lectern::services::{ChatDispatcher, SpeechSynthesizer, SpeechTranscriber};
use lectern::session::{Capabilities, SessionHandle, SessionPhase, VoiceEvent, VoiceSession};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;

// ─── Fakes ───────────────────────────────────────────────────────────────────

#[derive(Default)]
struct MicState {
    acquired: usize,
    released: usize,
    recording: bool,
    events: Option<mpsc::Sender<CaptureEvent>>,
    tap: Option<LevelTap>,
}

/// Scriptable microphone shared between the provider, its handles, and the
/// test body.
struct FakeMic {
    state: Arc<Mutex<MicState>>,
    deny: Option<fn() -> VoiceError>,
}

impl FakeMic {
    fn granting() -> Arc<Self> {
        Arc::new(Self {
            state: Arc::new(Mutex::new(MicState::default())),
            deny: None,
        })
    }

    fn denying(err: fn() -> VoiceError) -> Arc<Self> {
        Arc::new(Self {
            state: Arc::new(Mutex::new(MicState::default())),
            deny: Some(err),
        })
    }

    fn acquired(&self) -> usize {
        self.state.lock().expect("mic state").acquired
    }

    fn released(&self) -> usize {
        self.state.lock().expect("mic state").released
    }

    fn tap(&self) -> LevelTap {
        self.state
            .lock()
            .expect("mic state")
            .tap
            .clone()
            .expect("no live tap")
    }

    fn event_sender(&self) -> mpsc::Sender<CaptureEvent> {
        self.state
            .lock()
            .expect("mic state")
            .events
            .clone()
            .expect("not recording")
    }
}

#[async_trait]
impl CaptureProvider for FakeMic {
    async fn acquire(&self, config: &VoiceConfig) -> Result<Box<dyn CaptureHandle>> {
        if let Some(err) = self.deny {
            return Err(err());
        }
        let tap = LevelTap::new(&config.analysis);
        let mut state = self.state.lock().expect("mic state");
        state.acquired += 1;
        state.tap = Some(tap.clone());
        Ok(Box::new(FakeHandle {
            state: Arc::clone(&self.state),
            tap,
            released: false,
        }))
    }
}

struct FakeHandle {
    state: Arc<Mutex<MicState>>,
    tap: LevelTap,
    released: bool,
}

impl CaptureHandle for FakeHandle {
    fn supports(&self, format: EncodingFormat) -> bool {
        format == EncodingFormat::OpusWebm
    }

    fn default_format(&self) -> Option<EncodingFormat> {
        Some(EncodingFormat::OpusWebm)
    }

    fn sample_spec(&self) -> Option<lectern::audio::capture::SampleSpec> {
        // Pre-encoded stream: chunks concatenate as-is.
        None
    }

    fn level_tap(&self) -> LevelTap {
        self.tap.clone()
    }

    fn start(&mut self, _format: EncodingFormat, events: mpsc::Sender<CaptureEvent>) -> Result<()> {
        let mut state = self.state.lock().expect("mic state");
        state.recording = true;
        state.events = Some(events);
        Ok(())
    }

    fn stop(&mut self) {
        let mut state = self.state.lock().expect("mic state");
        if state.recording {
            state.recording = false;
            if let Some(tx) = state.events.take() {
                let _ = tx.try_send(CaptureEvent::Finalized);
            }
        }
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.tap.detach();
        let mut state = self.state.lock().expect("mic state");
        state.recording = false;
        state.events = None;
        state.released += 1;
    }
}

impl Drop for FakeHandle {
    fn drop(&mut self) {
        self.release();
    }
}

/// Transcriber returning a canned result and counting calls.
struct FakeTranscriber {
    calls: AtomicUsize,
    reply: Mutex<Result<String>>,
    gate: Option<Arc<Notify>>,
}

impl FakeTranscriber {
    fn returning(text: &str) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            reply: Mutex::new(Ok(text.to_owned())),
            gate: None,
        })
    }

    fn gated(text: &str, gate: Arc<Notify>) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            reply: Mutex::new(Ok(text.to_owned())),
            gate: Some(gate),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SpeechTranscriber for FakeTranscriber {
    async fn transcribe(&self, _utterance: &EncodedUtterance) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        match &*self.reply.lock().expect("reply") {
            Ok(text) => Ok(text.clone()),
            Err(e) => Err(VoiceError::Transcription(e.to_string())),
        }
    }
}

/// Synthesizer returning a canned payload and counting calls.
struct FakeSynthesizer {
    calls: AtomicUsize,
    payload: Bytes,
}

impl FakeSynthesizer {
    fn returning(payload: Bytes) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            payload,
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SpeechSynthesizer for FakeSynthesizer {
    async fn synthesize(&self, _text: &str) -> Result<Bytes> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.payload.clone())
    }
}

/// Sink that records plays/cancellations and holds until cancelled or a
/// scripted duration elapses.
struct FakeSink {
    hold: Duration,
    plays: AtomicUsize,
    cancelled: AtomicUsize,
}

impl FakeSink {
    fn new(hold: Duration) -> Arc<Self> {
        Arc::new(Self {
            hold,
            plays: AtomicUsize::new(0),
            cancelled: AtomicUsize::new(0),
        })
    }

    fn plays(&self) -> usize {
        self.plays.load(Ordering::SeqCst)
    }

    fn cancellations(&self) -> usize {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AudioSink for FakeSink {
    async fn play(&self, _audio: DecodedAudio, cancel: CancellationToken) -> Result<()> {
        self.plays.fetch_add(1, Ordering::SeqCst);
        tokio::select! {
            () = cancel.cancelled() => {
                self.cancelled.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            () = tokio::time::sleep(self.hold) => Ok(()),
        }
    }
}

/// Chat dispatcher recording everything submitted to it.
#[derive(Default)]
struct FakeChat {
    dispatched: Mutex<Vec<String>>,
}

impl FakeChat {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn dispatched(&self) -> Vec<String> {
        self.dispatched.lock().expect("dispatched").clone()
    }
}

#[async_trait]
impl ChatDispatcher for FakeChat {
    async fn dispatch(&self, text: &str) -> Result<()> {
        self.dispatched
            .lock()
            .expect("dispatched")
            .push(text.to_owned());
        Ok(())
    }
}

// ─── Harness ─────────────────────────────────────────────────────────────────

struct Harness {
    session: SessionHandle,
    mic: Arc<FakeMic>,
    transcriber: Arc<FakeTranscriber>,
    synthesizer: Arc<FakeSynthesizer>,
    sink: Arc<FakeSink>,
    chat: Arc<FakeChat>,
}

fn test_config() -> VoiceConfig {
    let mut config = VoiceConfig::default();
    // Small, unsmoothed analysis window so scripted samples dominate, and a
    // short hold so silence-driven stops land quickly in tests.
    config.analysis = AnalysisConfig {
        window_size: 64,
        smoothing: 0.0,
    };
    config.vad.silence_hold_ms = 200;
    config.vad.poll_interval_ms = 5;
    config
}

fn wav_payload() -> Bytes {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: 16_000,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec).expect("writer");
        for i in 0..320 {
            writer
                .write_sample(((i % 32) * 512) as i16)
                .expect("sample");
        }
        writer.finalize().expect("finalize");
    }
    Bytes::from(cursor.into_inner())
}

struct HarnessOptions {
    mic: Arc<FakeMic>,
    transcriber: Arc<FakeTranscriber>,
    synth_payload: Bytes,
    sink_hold: Duration,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            mic: FakeMic::granting(),
            transcriber: FakeTranscriber::returning("hello from the reader"),
            synth_payload: wav_payload(),
            sink_hold: Duration::from_millis(5),
        }
    }
}

fn harness(options: HarnessOptions) -> Harness {
    lectern::logging::init();
    let synthesizer = FakeSynthesizer::returning(options.synth_payload);
    let sink = FakeSink::new(options.sink_hold);
    let chat = FakeChat::new();
    let caps = Capabilities {
        capture: options.mic.clone(),
        sink: sink.clone(),
        transcriber: options.transcriber.clone(),
        synthesizer: synthesizer.clone(),
        chat: chat.clone(),
    };
    let session = VoiceSession::spawn(test_config(), caps);
    Harness {
        session,
        mic: options.mic,
        transcriber: options.transcriber,
        synthesizer,
        sink,
        chat,
    }
}

const WAIT: Duration = Duration::from_secs(2);

async fn wait_phase(session: &SessionHandle, phase: SessionPhase) {
    let mut rx = session.phase_updates();
    tokio::time::timeout(WAIT, rx.wait_for(|p| *p == phase))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {phase:?}"))
        .expect("session task gone");
}

async fn wait_event(
    events: &mut tokio::sync::broadcast::Receiver<VoiceEvent>,
    mut matcher: impl FnMut(&VoiceEvent) -> bool,
) -> VoiceEvent {
    loop {
        let event = tokio::time::timeout(WAIT, events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event stream closed");
        if matcher(&event) {
            return event;
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn enable_failure_rolls_back_to_disabled() {
    let mic = FakeMic::denying(|| VoiceError::PermissionDenied("user refused".into()));
    let h = harness(HarnessOptions {
        mic: mic.clone(),
        ..HarnessOptions::default()
    });

    let err = h.session.enable().await.expect_err("enable must fail");
    assert!(matches!(err, VoiceError::PermissionDenied(_)));
    assert_eq!(h.session.phase(), SessionPhase::Disabled);
    assert_eq!(mic.acquired(), 0);
    assert_eq!(mic.released(), 0);
}

#[tokio::test]
async fn enable_then_disable_releases_the_device() {
    let h = harness(HarnessOptions::default());

    h.session.enable().await.expect("enable");
    assert_eq!(h.session.phase(), SessionPhase::Armed);
    assert_eq!(h.mic.acquired(), 1);

    h.session.disable();
    wait_phase(&h.session, SessionPhase::Disabled).await;
    assert_eq!(h.mic.released(), 1);

    // Idempotent under repeated calls.
    h.session.disable();
    h.session.disable();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(h.session.phase(), SessionPhase::Disabled);
    assert_eq!(h.mic.released(), 1);
}

#[tokio::test]
async fn enable_is_reentrant() {
    let h = harness(HarnessOptions::default());
    h.session.enable().await.expect("enable");
    h.session.enable().await.expect("second enable is a no-op");
    assert_eq!(h.mic.acquired(), 1);
}

#[tokio::test]
async fn silence_drives_exactly_one_transcription() {
    let h = harness(HarnessOptions::default());
    let mut events = h.session.events();

    h.session.enable().await.expect("enable");
    h.session.start_recording();
    wait_phase(&h.session, SessionPhase::Recording).await;

    // Deliver one audio chunk while the recording is live; the tap stays
    // silent so the VAD hold elapses on its own.
    h.mic
        .event_sender()
        .send(CaptureEvent::Chunk(Bytes::from_static(b"utterance-bytes")))
        .await
        .expect("chunk delivery");

    let transcript = wait_event(&mut events, |e| matches!(e, VoiceEvent::TranscriptReady(_))).await;
    let VoiceEvent::TranscriptReady(text) = transcript else {
        unreachable!()
    };
    assert_eq!(text, "hello from the reader");

    wait_phase(&h.session, SessionPhase::Armed).await;
    assert_eq!(h.transcriber.calls(), 1);

    // The recognized text went straight into the chat pipeline.
    tokio::time::timeout(WAIT, async {
        while h.chat.dispatched().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("dispatch");
    assert_eq!(h.chat.dispatched(), vec!["hello from the reader".to_owned()]);
}

#[tokio::test]
async fn speech_postpones_the_silence_stop() {
    let h = harness(HarnessOptions::default());

    h.session.enable().await.expect("enable");
    h.session.start_recording();
    wait_phase(&h.session, SessionPhase::Recording).await;

    // Keep the tap loud for longer than the hold: the recording must stay
    // alive the whole time.
    let tap = h.mic.tap();
    for _ in 0..30 {
        tap.push(&[0.5; 64]);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(h.session.phase(), SessionPhase::Recording);
    }

    // Now fall silent and let the debounce fire.
    tap.push(&[0.0; 64]);
    wait_phase(&h.session, SessionPhase::Armed).await;
}

#[tokio::test]
async fn empty_capture_makes_no_network_call() {
    let h = harness(HarnessOptions::default());
    let mut events = h.session.events();

    h.session.enable().await.expect("enable");
    h.session.start_recording();
    wait_phase(&h.session, SessionPhase::Recording).await;

    // Manual stop with no chunks delivered.
    h.session.stop_recording();

    wait_event(&mut events, |e| {
        matches!(e, VoiceEvent::Status(s) if s == "no audio captured")
    })
    .await;
    wait_phase(&h.session, SessionPhase::Armed).await;
    assert_eq!(h.transcriber.calls(), 0);
}

#[tokio::test]
async fn starting_a_recording_interrupts_playback() {
    let h = harness(HarnessOptions {
        sink_hold: Duration::from_secs(30),
        ..HarnessOptions::default()
    });

    h.session.enable().await.expect("enable");
    h.session.on_reply_ready("a long spoken reply");

    tokio::time::timeout(WAIT, async {
        while h.sink.plays() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("playback started");

    h.session.start_recording();
    wait_phase(&h.session, SessionPhase::Recording).await;

    tokio::time::timeout(WAIT, async {
        while h.sink.cancellations() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("playback interrupted");
}

#[tokio::test]
async fn empty_synthesis_payload_reports_empty_audio() {
    let h = harness(HarnessOptions {
        synth_payload: Bytes::new(),
        ..HarnessOptions::default()
    });
    let mut events = h.session.events();

    h.session.enable().await.expect("enable");
    h.session.on_reply_ready("anything");

    wait_event(&mut events, |e| {
        matches!(e, VoiceEvent::SystemMessage(m) if m.contains("no audio"))
    })
    .await;
    assert_eq!(h.synthesizer.calls(), 1);
    assert_eq!(h.sink.plays(), 0);
}

#[tokio::test]
async fn reply_is_ignored_while_disabled() {
    let h = harness(HarnessOptions::default());
    h.session.on_reply_ready("nobody is listening");
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(h.synthesizer.calls(), 0);
    assert_eq!(h.sink.plays(), 0);
}

#[tokio::test]
async fn blank_reply_is_ignored() {
    let h = harness(HarnessOptions::default());
    h.session.enable().await.expect("enable");
    h.session.on_reply_ready("   \n\t ");
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(h.synthesizer.calls(), 0);
}

#[tokio::test]
async fn disable_during_recording_cleans_everything_up() {
    let h = harness(HarnessOptions::default());

    h.session.enable().await.expect("enable");
    h.session.start_recording();
    wait_phase(&h.session, SessionPhase::Recording).await;

    h.session.disable();
    wait_phase(&h.session, SessionPhase::Disabled).await;
    assert_eq!(h.mic.released(), 1);

    // No late resurrection: nothing more happens after cleanup.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(h.session.phase(), SessionPhase::Disabled);
    assert_eq!(h.transcriber.calls(), 0);
}

#[tokio::test]
async fn stale_transcription_after_disable_is_discarded() {
    let gate = Arc::new(Notify::new());
    let transcriber = FakeTranscriber::gated("late answer", gate.clone());
    let h = harness(HarnessOptions {
        transcriber: transcriber.clone(),
        ..HarnessOptions::default()
    });
    let mut events = h.session.events();

    h.session.enable().await.expect("enable");
    h.session.start_recording();
    wait_phase(&h.session, SessionPhase::Recording).await;

    h.mic
        .event_sender()
        .send(CaptureEvent::Chunk(Bytes::from_static(b"bytes")))
        .await
        .expect("chunk delivery");
    h.session.stop_recording();
    wait_phase(&h.session, SessionPhase::Finalizing).await;
    assert_eq!(transcriber.calls(), 1);

    // Voice mode goes off while the service call is in flight; the result
    // must be dropped, not applied.
    h.session.disable();
    wait_phase(&h.session, SessionPhase::Disabled).await;
    gate.notify_one();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.chat.dispatched().is_empty());
    assert_eq!(h.session.phase(), SessionPhase::Disabled);
    // Drain anything pending: no transcript may have been broadcast.
    while let Ok(event) = events.try_recv() {
        assert!(
            !matches!(event, VoiceEvent::TranscriptReady(_)),
            "stale transcript must not surface"
        );
    }
}

#[tokio::test]
async fn reenable_after_disable_reacquires_the_device() {
    let h = harness(HarnessOptions::default());

    h.session.enable().await.expect("enable");
    h.session.disable();
    wait_phase(&h.session, SessionPhase::Disabled).await;

    h.session.enable().await.expect("re-enable");
    assert_eq!(h.session.phase(), SessionPhase::Armed);
    assert_eq!(h.mic.acquired(), 2);
    assert_eq!(h.mic.released(), 1);
}

#[tokio::test]
async fn shutdown_releases_resources_and_stops_the_task() {
    let h = harness(HarnessOptions::default());
    h.session.enable().await.expect("enable");

    h.session.shutdown();
    tokio::time::timeout(WAIT, async {
        while h.mic.released() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("device released on shutdown");

    // The actor is gone: further commands fail.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(h.session.enable().await.is_err());
}

#[tokio::test]
async fn submit_transcript_reaches_the_chat_dispatcher() {
    let h = harness(HarnessOptions::default());
    h.session.submit_transcript("typed instead of spoken");
    tokio::time::timeout(WAIT, async {
        while h.chat.dispatched().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("dispatch");
    assert_eq!(
        h.chat.dispatched(),
        vec!["typed instead of spoken".to_owned()]
    );
}
