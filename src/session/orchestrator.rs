//! The voice session actor: one event loop owning every session resource.
//!
//! All mutation happens on this task. Long-running work (device
//! acquisition, the VAD loop, service calls, playback) is represented as a
//! cancellable task or a generation-tagged pending result, so `disable()`
//! can always clear local state in a single loop turn and stale results
//! from a previous generation are discarded instead of applied.

use crate::audio::analysis::AnalysisGraph;
use crate::audio::capture::{CaptureEvent, CaptureProvider, CpalCaptureProvider};
use crate::audio::device::DeviceManager;
use crate::audio::playback::{
    AudioSink, CpalSink, DecodedAudio, PlaybackController, PlaybackFinished, decode_payload,
};
use crate::config::VoiceConfig;
use crate::error::{Result, VoiceError};
use crate::recording::{RecordState, RecordingController};
use crate::services::http::HttpSpeechService;
use crate::services::{ChatDispatcher, SpeechSynthesizer, SpeechTranscriber};
use crate::session::messages::{SessionCommand, SessionEvent, SessionPhase, VoiceEvent};
use crate::vad::run_vad_loop;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Channel buffer sizes.
const CAPTURE_CHANNEL_SIZE: usize = 64;
const EVENT_CHANNEL_SIZE: usize = 64;

/// Hardware and network capabilities injected into the session.
///
/// Tests substitute scripted fakes; production wiring comes from
/// [`Capabilities::production`].
pub struct Capabilities {
    pub capture: Arc<dyn CaptureProvider>,
    pub sink: Arc<dyn AudioSink>,
    pub transcriber: Arc<dyn SpeechTranscriber>,
    pub synthesizer: Arc<dyn SpeechSynthesizer>,
    pub chat: Arc<dyn ChatDispatcher>,
}

impl Capabilities {
    /// Wire the cpal devices and HTTP speech services. The chat dispatcher
    /// always comes from the embedding assistant.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn production(config: &VoiceConfig, chat: Arc<dyn ChatDispatcher>) -> Result<Self> {
        let speech = HttpSpeechService::new(&config.services)?;
        Ok(Self {
            capture: Arc::new(CpalCaptureProvider),
            sink: Arc::new(CpalSink::new(config.audio.output_device.clone())),
            transcriber: Arc::new(speech.clone()),
            synthesizer: Arc::new(speech),
            chat,
        })
    }
}

/// Cloneable handle to a running voice session.
#[derive(Clone)]
pub struct SessionHandle {
    cmd_tx: mpsc::UnboundedSender<SessionCommand>,
    phase_rx: watch::Receiver<SessionPhase>,
    event_tx: broadcast::Sender<VoiceEvent>,
}

impl SessionHandle {
    /// Turn voice mode on: acquire the microphone, build the analysis
    /// graph, and arm the recorder.
    ///
    /// # Errors
    ///
    /// Surfaces the acquisition/setup failure; the session is rolled back
    /// to disabled.
    pub async fn enable(&self) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.send(SessionCommand::Enable(ack_tx))?;
        ack_rx
            .await
            .map_err(|_| VoiceError::Channel("session dropped the enable request".into()))?
    }

    /// Turn voice mode off, releasing every resource. Safe from any state
    /// and idempotent.
    pub fn disable(&self) {
        let _ = self.send(SessionCommand::Disable);
    }

    /// Start a recording (record button / auto re-arm).
    pub fn start_recording(&self) {
        let _ = self.send(SessionCommand::StartRecording);
    }

    /// Stop the active recording (manual stop; VAD stops automatically).
    pub fn stop_recording(&self) {
        let _ = self.send(SessionCommand::StopRecording);
    }

    /// Hand text to the external chat dispatcher.
    pub fn submit_transcript(&self, text: impl Into<String>) {
        let _ = self.send(SessionCommand::SubmitTranscript(text.into()));
    }

    /// A chat reply is ready: speak it if voice mode is enabled.
    pub fn on_reply_ready(&self, text: impl Into<String>) {
        let _ = self.send(SessionCommand::ReplyReady(text.into()));
    }

    /// Stop the session task entirely (releases all resources first).
    pub fn shutdown(&self) {
        let _ = self.send(SessionCommand::Shutdown);
    }

    /// Current session phase.
    pub fn phase(&self) -> SessionPhase {
        *self.phase_rx.borrow()
    }

    /// Watch phase transitions.
    pub fn phase_updates(&self) -> watch::Receiver<SessionPhase> {
        self.phase_rx.clone()
    }

    /// Subscribe to user-visible session events.
    pub fn events(&self) -> broadcast::Receiver<VoiceEvent> {
        self.event_tx.subscribe()
    }

    fn send(&self, cmd: SessionCommand) -> Result<()> {
        self.cmd_tx
            .send(cmd)
            .map_err(|_| VoiceError::Channel("voice session task is gone".into()))
    }
}

/// The session actor state. Created via [`VoiceSession::spawn`].
pub struct VoiceSession {
    config: VoiceConfig,
    caps: Capabilities,
    enabled: bool,
    /// Bumped on every enable/disable; in-flight results from an older
    /// generation are discarded on arrival.
    generation: u64,
    device: DeviceManager,
    analysis: Option<AnalysisGraph>,
    recorder: RecordingController,
    playback: PlaybackController,
    vad_cancel: Option<CancellationToken>,
    phase_tx: watch::Sender<SessionPhase>,
    event_tx: broadcast::Sender<VoiceEvent>,
    internal_tx: mpsc::UnboundedSender<SessionEvent>,
    playback_done_tx: mpsc::UnboundedSender<PlaybackFinished>,
}

impl VoiceSession {
    /// Spawn the session actor and return its handle.
    pub fn spawn(config: VoiceConfig, caps: Capabilities) -> SessionHandle {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (playback_done_tx, playback_done_rx) = mpsc::unbounded_channel();
        let (phase_tx, phase_rx) = watch::channel(SessionPhase::Disabled);
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_SIZE);

        let session = Self {
            device: DeviceManager::new(Arc::clone(&caps.capture)),
            playback: PlaybackController::new(Arc::clone(&caps.sink)),
            config,
            caps,
            enabled: false,
            generation: 0,
            analysis: None,
            recorder: RecordingController::new(),
            vad_cancel: None,
            phase_tx,
            event_tx: event_tx.clone(),
            internal_tx,
            playback_done_tx,
        };

        tokio::spawn(session.run(cmd_rx, internal_rx, playback_done_rx));

        SessionHandle {
            cmd_tx,
            phase_rx,
            event_tx,
        }
    }

    async fn run(
        mut self,
        mut cmd_rx: mpsc::UnboundedReceiver<SessionCommand>,
        mut internal_rx: mpsc::UnboundedReceiver<SessionEvent>,
        mut playback_done_rx: mpsc::UnboundedReceiver<PlaybackFinished>,
    ) {
        info!("voice session task started");
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        None | Some(SessionCommand::Shutdown) => break,
                        Some(cmd) => self.handle_command(cmd).await,
                    }
                }
                Some(event) = internal_rx.recv() => self.handle_event(event),
                Some(done) = playback_done_rx.recv() => self.on_playback_finished(done),
            }
        }
        self.disable();
        info!("voice session task stopped");
    }

    async fn handle_command(&mut self, cmd: SessionCommand) {
        match cmd {
            SessionCommand::Enable(ack) => {
                let result = self.enable().await;
                let _ = ack.send(result);
            }
            SessionCommand::Disable => self.disable(),
            SessionCommand::StartRecording => self.start_recording(),
            SessionCommand::StopRecording => self.stop_recording(),
            SessionCommand::SubmitTranscript(text) => self.dispatch_transcript(text),
            SessionCommand::ReplyReady(text) => self.speak(text),
            SessionCommand::Shutdown => {}
        }
    }

    fn handle_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Capture { generation, event } => {
                if generation != self.generation {
                    debug!("dropping capture event from a prior generation");
                    return;
                }
                match event {
                    CaptureEvent::Chunk(bytes) => self.recorder.append_chunk(bytes),
                    CaptureEvent::Finalized => self.on_capture_finalized(),
                    CaptureEvent::Error(msg) => self.on_capture_error(&msg),
                }
            }
            SessionEvent::SilenceElapsed { generation } => {
                if generation != self.generation {
                    return;
                }
                self.emit_status("silence detected");
                self.stop_recording();
            }
            SessionEvent::Transcribed { generation, result } => {
                self.on_transcribed(generation, result);
            }
            SessionEvent::SpeechReady { generation, result } => {
                self.on_speech_ready(generation, result);
            }
            SessionEvent::Dispatched { generation, result } => {
                if generation == self.generation
                    && let Err(e) = result
                {
                    error!("chat dispatch failed: {e}");
                    self.emit_system(format!("chat dispatch failed: {e}"));
                }
            }
        }
    }

    /// Enable voice mode: acquire → analysis graph → arm. Any failure rolls
    /// everything back to disabled before surfacing the error.
    async fn enable(&mut self) -> Result<()> {
        if self.enabled {
            debug!("enable requested while already enabled");
            return Ok(());
        }
        self.generation += 1;
        self.emit_status("requesting microphone...");

        if let Err(e) = self.device.acquire(&self.config).await {
            error!("microphone acquisition failed: {e}");
            self.rollback_enable();
            self.emit_status("microphone unavailable");
            return Err(e);
        }

        let graph = {
            let Some(handle) = self.device.handle() else {
                self.rollback_enable();
                return Err(VoiceError::DeviceUnavailable(
                    "capture handle vanished after acquisition".into(),
                ));
            };
            match AnalysisGraph::build(handle) {
                Ok(graph) => graph,
                Err(e) => {
                    error!("analysis graph setup failed: {e}");
                    self.rollback_enable();
                    self.emit_status("audio analyser error");
                    return Err(e);
                }
            }
        };

        {
            let Some(handle) = self.device.handle() else {
                self.rollback_enable();
                return Err(VoiceError::DeviceUnavailable(
                    "capture handle vanished after acquisition".into(),
                ));
            };
            if let Err(e) = self.recorder.arm(handle) {
                error!("recorder arm failed: {e}");
                self.rollback_enable();
                return Err(e);
            }
        }

        self.analysis = Some(graph);
        self.enabled = true;
        self.set_phase(SessionPhase::Armed);
        self.emit_status("voice ready");
        info!("voice session enabled");
        Ok(())
    }

    /// Undo a partial enable: no flag, no handle, no graph, no format.
    fn rollback_enable(&mut self) {
        self.recorder.reset();
        self.analysis = None;
        self.device.release();
        self.enabled = false;
        self.set_phase(SessionPhase::Disabled);
    }

    /// Disable voice mode from any state. All local state (flags, timer,
    /// buffer, handles) is cleared before this returns; hardware teardown
    /// may complete asynchronously. Idempotent.
    fn disable(&mut self) {
        let was_enabled = self.enabled;
        self.generation += 1;
        self.cancel_vad();
        self.playback.interrupt();
        self.recorder.reset();
        // The graph never outlives the handle it was built from.
        self.analysis = None;
        self.device.release();
        self.enabled = false;
        self.set_phase(SessionPhase::Disabled);
        if was_enabled {
            self.emit_status("voice disabled");
            info!("voice session disabled");
        }
    }

    /// Start a recording. Valid while armed; a start during an active
    /// recording is a safe no-op, and a start while the previous recording
    /// is still finalizing is rejected.
    fn start_recording(&mut self) {
        if !self.enabled {
            warn!("start recording requested while voice mode is off");
            return;
        }
        match self.recorder.state() {
            RecordState::Recording => {
                debug!("already recording");
                return;
            }
            RecordState::Finalizing => {
                warn!("previous recording still finalizing, start rejected");
                return;
            }
            RecordState::Armed => {}
            RecordState::Idle => {
                warn!("recorder not armed");
                return;
            }
        }

        // Barge-in: the microphone never overlaps active playback.
        self.playback.interrupt();

        let Some(source) = self.analysis.as_ref().map(AnalysisGraph::source) else {
            self.emit_system("recording failed: analysis graph missing".to_owned());
            return;
        };

        let (capture_tx, mut capture_rx) = mpsc::channel(CAPTURE_CHANNEL_SIZE);
        {
            let Some(handle) = self.device.handle_mut() else {
                self.emit_system("recording failed: microphone not held".to_owned());
                return;
            };
            if let Err(e) = self.recorder.begin(handle, capture_tx) {
                error!("recording start failed: {e}");
                self.emit_system(format!("recording failed: {e}"));
                return;
            }
        }

        let generation = self.generation;

        // Forward capture events into the actor, stamped with the current
        // generation so late events from a torn-down handle are discarded.
        {
            let internal = self.internal_tx.clone();
            tokio::spawn(async move {
                while let Some(event) = capture_rx.recv().await {
                    if internal
                        .send(SessionEvent::Capture { generation, event })
                        .is_err()
                    {
                        break;
                    }
                }
            });
        }

        // The VAD loop: cancellable from stop_recording() and disable().
        let cancel = CancellationToken::new();
        self.vad_cancel = Some(cancel.clone());
        {
            let vad_config = self.config.vad.clone();
            let internal = self.internal_tx.clone();
            tokio::spawn(async move {
                if run_vad_loop(source, &vad_config, cancel).await {
                    let _ = internal.send(SessionEvent::SilenceElapsed { generation });
                }
            });
        }

        self.set_phase(SessionPhase::Recording);
        self.emit_status("listening...");
    }

    /// Stop the active recording; logged no-op otherwise.
    fn stop_recording(&mut self) {
        if self.recorder.state() != RecordState::Recording {
            info!("stop requested while not recording");
            return;
        }
        self.cancel_vad();
        self.emit_status("processing...");
        if let Some(handle) = self.device.handle_mut() {
            self.recorder.request_stop(handle);
        }
    }

    /// The capture finalized: assemble the utterance and hand it to the
    /// transcriber, or report an empty capture.
    fn on_capture_finalized(&mut self) {
        self.cancel_vad();
        let spec = self.device.handle().and_then(|h| h.sample_spec());
        match self.recorder.finalize(spec) {
            Err(VoiceError::EmptyCapture) => {
                self.emit_status("no audio captured");
                self.recorder.settle();
                self.set_phase(SessionPhase::Armed);
            }
            Ok(utterance) => {
                self.set_phase(SessionPhase::Finalizing);
                self.emit_status("transcribing...");
                let generation = self.generation;
                let transcriber = Arc::clone(&self.caps.transcriber);
                let internal = self.internal_tx.clone();
                tokio::spawn(async move {
                    let result = transcriber.transcribe(&utterance).await;
                    let _ = internal.send(SessionEvent::Transcribed { generation, result });
                });
            }
            Err(e) => {
                error!("utterance assembly failed: {e}");
                self.emit_system(format!("recording failed: {e}"));
                self.recorder.settle();
                self.set_phase(SessionPhase::Armed);
            }
        }
    }

    /// The capture device died mid-recording. Recording is no longer
    /// possible, so the session force-disables through the usual cleanup.
    fn on_capture_error(&mut self, msg: &str) {
        error!("capture device failed: {msg}");
        self.emit_system(format!("microphone error: {msg}"));
        self.disable();
    }

    fn on_transcribed(&mut self, generation: u64, result: Result<String>) {
        if generation != self.generation {
            debug!("discarding stale transcription result");
            return;
        }
        // The call settled: back to armed regardless of outcome.
        self.recorder.settle();
        self.set_phase(SessionPhase::Armed);
        match result {
            Err(e) => {
                error!("transcription failed: {e}");
                self.emit_status("transcription failed");
                self.emit_system(format!("transcription failed: {e}"));
            }
            Ok(text) => {
                let trimmed = text.trim();
                if trimmed.is_empty() {
                    info!("transcription empty: no speech recognized");
                    self.emit_status("no speech recognized");
                    return;
                }
                info!("transcription: {trimmed}");
                self.emit_status("transcript ready");
                self.emit_event(VoiceEvent::TranscriptReady(trimmed.to_owned()));
                self.dispatch_transcript(trimmed.to_owned());
            }
        }
    }

    /// Hand recognized text to the external chat pipeline.
    fn dispatch_transcript(&mut self, text: String) {
        if text.trim().is_empty() {
            return;
        }
        let generation = self.generation;
        let chat = Arc::clone(&self.caps.chat);
        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = chat.dispatch(&text).await;
            let _ = internal.send(SessionEvent::Dispatched { generation, result });
        });
    }

    /// Speak a chat reply: synthesize, decode, and play. No-op when voice
    /// mode is off or the text is blank.
    fn speak(&mut self, text: String) {
        if !self.enabled {
            debug!("voice mode off, reply is display-only");
            return;
        }
        let text = text.trim().to_owned();
        if text.is_empty() {
            warn!("speak requested with empty text");
            return;
        }

        // Any existing playback is torn down before the new request.
        self.playback.interrupt();
        self.emit_status("synthesizing speech...");

        let generation = self.generation;
        let synthesizer = Arc::clone(&self.caps.synthesizer);
        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = synthesize_and_decode(synthesizer.as_ref(), &text).await;
            let _ = internal.send(SessionEvent::SpeechReady { generation, result });
        });
    }

    fn on_speech_ready(&mut self, generation: u64, result: Result<DecodedAudio>) {
        if generation != self.generation {
            debug!("discarding stale synthesis result");
            return;
        }
        match result {
            Err(e) => {
                error!("speech synthesis failed: {e}");
                self.emit_status("speech synthesis failed");
                let message = match &e {
                    VoiceError::EmptyAudio => "synthesis returned no audio".to_owned(),
                    other => format!("speech synthesis failed: {other}"),
                };
                self.emit_system(message);
            }
            Ok(audio) => {
                // A recording started while the reply was being synthesized:
                // the microphone wins and the reply is dropped.
                if self.recorder.state() == RecordState::Recording {
                    info!("discarding synthesized reply, recording in progress");
                    return;
                }
                self.playback.begin(audio, self.playback_done_tx.clone());
                self.emit_status("playing reply...");
            }
        }
    }

    fn on_playback_finished(&mut self, done: PlaybackFinished) {
        if !self.playback.acknowledge(done.playback_id) {
            return;
        }
        match done.result {
            Ok(()) => {
                if self.enabled {
                    self.emit_status("playback finished");
                }
            }
            Err(e) => {
                error!("playback failed: {e}");
                self.emit_status("playback error");
                self.emit_system(format!("playback error: {e}"));
            }
        }
    }

    fn cancel_vad(&mut self) {
        if let Some(cancel) = self.vad_cancel.take() {
            cancel.cancel();
        }
    }

    fn set_phase(&mut self, phase: SessionPhase) {
        if *self.phase_tx.borrow() != phase {
            self.phase_tx.send_replace(phase);
            self.emit_event(VoiceEvent::PhaseChanged(phase));
        }
    }

    fn emit_event(&self, event: VoiceEvent) {
        // Nobody listening is fine.
        let _ = self.event_tx.send(event);
    }

    fn emit_status(&self, message: impl Into<String>) {
        self.emit_event(VoiceEvent::Status(message.into()));
    }

    fn emit_system(&self, message: String) {
        self.emit_event(VoiceEvent::SystemMessage(message));
    }
}

/// Synthesize reply text and decode the payload for the sink.
async fn synthesize_and_decode(
    synthesizer: &dyn SpeechSynthesizer,
    text: &str,
) -> Result<DecodedAudio> {
    let payload = synthesizer.synthesize(text).await?;
    if payload.is_empty() {
        return Err(VoiceError::EmptyAudio);
    }
    tokio::task::spawn_blocking(move || decode_payload(&payload))
        .await
        .map_err(|e| VoiceError::Playback(format!("decode task failed: {e}")))?
}
