//! Voice activity detection: a debounced silence detector over a live
//! amplitude source.
//!
//! The detector is a pure decision core fed with RMS readings and
//! timestamps, so the debounce semantics are testable without timers. The
//! sampling loop wraps it in an explicit cancellable periodic task that
//! self-terminates when recording stops, the amplitude source disappears,
//! or end-of-utterance fires — it never leaves a dangling callback behind.

use crate::audio::analysis::SignalSource;
use crate::config::VadConfig;
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Outcome of one level observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadDecision {
    /// Level above threshold: speech continues, any pending deadline is
    /// cancelled.
    Voice,
    /// Level at/below threshold but the hold window has not yet elapsed.
    Pending,
    /// The hold window elapsed with no speech: stop the recording.
    SilenceElapsed,
}

/// Debounced end-of-utterance detector.
///
/// Silence must hold continuously for the configured duration before
/// [`VadDecision::SilenceElapsed`] is produced; a single loud reading
/// resets the window. The decision fires at most once per pending window.
pub struct SilenceDetector {
    threshold: f32,
    hold: Duration,
    deadline: Option<Instant>,
}

impl SilenceDetector {
    pub fn new(config: &VadConfig) -> Self {
        Self {
            threshold: config.threshold,
            hold: Duration::from_millis(config.silence_hold_ms),
            deadline: None,
        }
    }

    /// Feed one RMS reading observed at `now`.
    pub fn observe(&mut self, rms: f32, now: Instant) -> VadDecision {
        if rms > self.threshold {
            self.deadline = None;
            return VadDecision::Voice;
        }
        match self.deadline {
            None => {
                self.deadline = Some(now + self.hold);
                VadDecision::Pending
            }
            Some(deadline) if now >= deadline => {
                self.deadline = None;
                VadDecision::SilenceElapsed
            }
            Some(_) => VadDecision::Pending,
        }
    }

    /// Drop any pending deadline.
    pub fn reset(&mut self) {
        self.deadline = None;
    }

    /// Whether a silence deadline is currently pending.
    pub fn is_pending(&self) -> bool {
        self.deadline.is_some()
    }
}

/// Run the sampling loop against a live amplitude source.
///
/// Polls on the configured interval and returns `true` when
/// end-of-utterance fired, `false` when the loop terminated for any other
/// reason (cancellation, or the source going away).
pub async fn run_vad_loop(
    source: impl SignalSource,
    config: &VadConfig,
    cancel: CancellationToken,
) -> bool {
    let mut detector = SilenceDetector::new(config);
    let mut ticker = tokio::time::interval(Duration::from_millis(config.poll_interval_ms.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                debug!("VAD loop cancelled");
                return false;
            }
            _ = ticker.tick() => {
                let Some(rms) = source.level() else {
                    debug!("amplitude source gone, VAD loop terminating");
                    return false;
                };
                let now = tokio::time::Instant::now().into_std();
                if detector.observe(rms, now) == VadDecision::SilenceElapsed {
                    info!("silence held for {}ms, stopping recording", config.silence_hold_ms);
                    return true;
                }
            }
        }
    }
}
