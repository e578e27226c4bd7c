//! Amplitude analysis graph: a rolling sample window with smoothed RMS.
//!
//! The capture side pushes normalized samples into a shared [`LevelTap`];
//! the VAD engine polls the tap for a smoothed loudness estimate. Taps are
//! bound to the capture handle that created them — once the handle is
//! released the tap reads as absent, which tells the sampling loop to
//! terminate.

use crate::audio::capture::CaptureHandle;
use crate::config::AnalysisConfig;
use crate::error::{Result, VoiceError};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// A live amplitude source polled by the VAD engine.
pub trait SignalSource: Send {
    /// Current smoothed RMS of the sample window, or `None` once the
    /// underlying tap has been detached.
    fn level(&self) -> Option<f32>;
}

struct TapState {
    window: VecDeque<f32>,
    window_size: usize,
    smoothing: f32,
    smoothed_rms: f32,
    attached: bool,
}

/// Shared amplitude tap between a capture stream and the VAD engine.
///
/// Cloning is cheap; all clones observe the same window.
#[derive(Clone)]
pub struct LevelTap {
    state: Arc<Mutex<TapState>>,
}

impl LevelTap {
    /// Create a tap with the given window size and smoothing constant.
    pub fn new(config: &AnalysisConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(TapState {
                window: VecDeque::with_capacity(config.window_size),
                window_size: config.window_size.max(1),
                smoothing: config.smoothing.clamp(0.0, 0.99),
                smoothed_rms: 0.0,
                attached: true,
            })),
        }
    }

    /// Push normalized samples (amplitude in \[-1, 1\]) into the window and
    /// refresh the smoothed RMS estimate.
    pub fn push(&self, samples: &[f32]) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        if !state.attached {
            return;
        }
        for &s in samples {
            if state.window.len() == state.window_size {
                state.window.pop_front();
            }
            state.window.push_back(s);
        }
        let rms = rms_of(state.window.iter().copied());
        let alpha = state.smoothing;
        state.smoothed_rms = alpha * state.smoothed_rms + (1.0 - alpha) * rms;
    }

    /// Detach the tap. Subsequent reads return `None`; detaching twice is a
    /// no-op.
    pub fn detach(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.attached = false;
            state.window.clear();
            state.smoothed_rms = 0.0;
        }
    }

    /// Whether the tap is still connected to a live capture stream.
    pub fn is_attached(&self) -> bool {
        self.state.lock().map(|s| s.attached).unwrap_or(false)
    }
}

impl SignalSource for LevelTap {
    fn level(&self) -> Option<f32> {
        let state = self.state.lock().ok()?;
        state.attached.then_some(state.smoothed_rms)
    }
}

/// The analysis graph derived from a capture handle.
///
/// Its lifetime is bound to the handle: rebuilding after the handle is
/// replaced swaps the tap, and a previously detached tap is tolerated
/// rather than treated as an error.
pub struct AnalysisGraph {
    tap: LevelTap,
}

impl AnalysisGraph {
    /// Build the graph from a freshly acquired capture handle.
    ///
    /// # Errors
    ///
    /// Returns [`VoiceError::AnalysisSetup`] if the handle's tap is already
    /// detached (the stream died between acquisition and setup).
    pub fn build(handle: &dyn CaptureHandle) -> Result<Self> {
        let tap = handle.level_tap();
        if !tap.is_attached() {
            return Err(VoiceError::AnalysisSetup(
                "capture stream has no live amplitude tap".into(),
            ));
        }
        Ok(Self { tap })
    }

    /// Replace the tap after the capture handle was re-acquired.
    ///
    /// The prior tap may already be detached; that is not an error.
    pub fn rebuild(&mut self, handle: &dyn CaptureHandle) -> Result<()> {
        self.tap.detach();
        *self = Self::build(handle)?;
        Ok(())
    }

    /// A cloneable amplitude source for the VAD engine.
    pub fn source(&self) -> LevelTap {
        self.tap.clone()
    }
}

/// RMS of a sample sequence; zero for an empty window.
fn rms_of(samples: impl ExactSizeIterator<Item = f32>) -> f32 {
    let n = samples.len();
    if n == 0 {
        return 0.0;
    }
    let sum_sq: f32 = samples.map(|s| s * s).sum();
    (sum_sq / n as f32).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tap(window: usize, smoothing: f32) -> LevelTap {
        LevelTap::new(&AnalysisConfig {
            window_size: window,
            smoothing,
        })
    }

    #[test]
    fn silent_window_reads_zero() {
        let t = tap(8, 0.0);
        t.push(&[0.0; 8]);
        assert_eq!(t.level(), Some(0.0));
    }

    #[test]
    fn unsmoothed_rms_matches_hand_computation() {
        let t = tap(4, 0.0);
        t.push(&[0.5, -0.5, 0.5, -0.5]);
        let level = t.level().expect("attached");
        assert!((level - 0.5).abs() < 1e-6);
    }

    #[test]
    fn window_keeps_only_recent_samples() {
        let t = tap(2, 0.0);
        t.push(&[1.0, 1.0]);
        t.push(&[0.0, 0.0]);
        assert_eq!(t.level(), Some(0.0));
    }

    #[test]
    fn smoothing_damps_sudden_change() {
        let t = tap(4, 0.8);
        t.push(&[1.0, 1.0, 1.0, 1.0]);
        let first = t.level().expect("attached");
        // One push from silence: 0.8 * 0 + 0.2 * 1.0
        assert!((first - 0.2).abs() < 1e-6);
    }

    #[test]
    fn detached_tap_reads_none() {
        let t = tap(4, 0.0);
        t.push(&[0.3; 4]);
        t.detach();
        assert_eq!(t.level(), None);
        // Repeated detach is a no-op.
        t.detach();
        assert_eq!(t.level(), None);
    }

    #[test]
    fn push_after_detach_is_ignored() {
        let t = tap(4, 0.0);
        t.detach();
        t.push(&[1.0; 4]);
        assert_eq!(t.level(), None);
    }

    /// Minimal handle carrying only a tap, for graph lifetime tests.
    struct TapOnlyHandle {
        tap: LevelTap,
    }

    impl CaptureHandle for TapOnlyHandle {
        fn supports(&self, format: crate::recording::EncodingFormat) -> bool {
            format == crate::recording::EncodingFormat::Wav
        }
        fn default_format(&self) -> Option<crate::recording::EncodingFormat> {
            Some(crate::recording::EncodingFormat::Wav)
        }
        fn sample_spec(&self) -> Option<crate::audio::capture::SampleSpec> {
            None
        }
        fn level_tap(&self) -> LevelTap {
            self.tap.clone()
        }
        fn start(
            &mut self,
            _format: crate::recording::EncodingFormat,
            _events: tokio::sync::mpsc::Sender<crate::audio::capture::CaptureEvent>,
        ) -> Result<()> {
            Ok(())
        }
        fn stop(&mut self) {}
        fn release(&mut self) {
            self.tap.detach();
        }
    }

    #[test]
    fn build_fails_on_a_dead_tap() {
        let handle = TapOnlyHandle { tap: tap(4, 0.0) };
        handle.tap.detach();
        assert!(matches!(
            AnalysisGraph::build(&handle),
            Err(VoiceError::AnalysisSetup(_))
        ));
    }

    #[test]
    fn rebuild_swaps_to_the_new_handle() {
        let mut first = TapOnlyHandle { tap: tap(4, 0.0) };
        let mut graph = AnalysisGraph::build(&first).expect("build");

        // The handle is replaced; its tap dies with it.
        first.release();
        assert_eq!(graph.source().level(), None);

        let second = TapOnlyHandle { tap: tap(4, 0.0) };
        graph.rebuild(&second).expect("rebuild");
        second.tap.push(&[0.25; 4]);
        let level = graph.source().level().expect("live tap");
        assert!((level - 0.25).abs() < 1e-6);
    }

    #[test]
    fn rebuild_tolerates_an_already_detached_prior_tap() {
        let first = TapOnlyHandle { tap: tap(4, 0.0) };
        let mut graph = AnalysisGraph::build(&first).expect("build");
        // Detach twice before rebuilding: still a non-error.
        first.tap.detach();
        first.tap.detach();

        let second = TapOnlyHandle { tap: tap(4, 0.0) };
        graph.rebuild(&second).expect("rebuild");
        assert!(graph.source().level().is_some());
    }
}
