//! Energy-based voice-activity detection.
//!
//! [`VoiceActivityDetector`] watches the RMS energy of successive analysis
//! windows while capture is active and decides when the speaker has gone
//! quiet for long enough that the utterance is over.
//!
//! ## Algorithm
//!
//! Each window's RMS amplitude is compared against the configured silence
//! threshold. The first sub-threshold window starts the silence clock; any
//! window at or above threshold resets it. Once the clock exceeds the
//! configured duration the detector fires end-of-utterance exactly once and
//! disarms itself until [`VoiceActivityDetector::reset`] is called for the
//! next capture cycle.
//!
//! Timestamps are passed in by the caller rather than read from a clock, so
//! the decision logic is deterministic under test.

use std::time::{Duration, Instant};
use tracing::debug;

/// Tunables for silence detection.
///
/// Both values are deployment-dependent: quiet headset microphones work
/// well around a 0.02 threshold while laptop microphones in open rooms need
/// 0.05-0.1, so they are configuration, not constants.
#[derive(Debug, Clone, Copy)]
pub struct VadConfig {
    /// RMS energy below which a window counts as silence.
    pub silence_threshold: f32,
    /// Sustained silence that ends an utterance.
    pub silence_duration: Duration,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            silence_threshold: 0.05,
            silence_duration: Duration::from_millis(1500),
        }
    }
}

/// Instantaneous RMS energy of one analysis window.
///
/// Emitted for every observed window regardless of silence state so the UI
/// meter keeps moving; never persisted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VolumeSample {
    pub rms: f32,
}

/// Outcome of observing one analysis window.
#[derive(Debug, Clone, Copy)]
pub struct VadDecision {
    /// Volume for UI metering, always present.
    pub volume: VolumeSample,
    /// True exactly once per utterance, when sustained silence exceeded the
    /// configured duration.
    pub end_of_utterance: bool,
}

/// Silence-duration state machine over a stream of sample windows.
#[derive(Debug)]
pub struct VoiceActivityDetector {
    config: VadConfig,
    /// When the current silence span began; cleared on any loud window.
    silence_started: Option<Instant>,
    /// Disarmed after firing (or external stop) until the next reset.
    armed: bool,
}

impl VoiceActivityDetector {
    pub fn new(config: VadConfig) -> Self {
        Self {
            config,
            silence_started: None,
            armed: true,
        }
    }

    /// RMS amplitude of a window of samples in `[-1.0, 1.0]`.
    pub fn rms(window: &[f32]) -> f32 {
        if window.is_empty() {
            return 0.0;
        }
        let mean_sq: f32 = window.iter().map(|s| s * s).sum::<f32>() / window.len() as f32;
        mean_sq.sqrt()
    }

    /// Observe one analysis window captured at `at`.
    ///
    /// Returns the window's volume and whether this window completed an
    /// utterance. After firing, further windows produce volume only until
    /// [`reset`](Self::reset) re-arms the detector.
    pub fn observe(&mut self, window: &[f32], at: Instant) -> VadDecision {
        let volume = VolumeSample {
            rms: Self::rms(window),
        };

        if !self.armed {
            return VadDecision {
                volume,
                end_of_utterance: false,
            };
        }

        if volume.rms < self.config.silence_threshold {
            match self.silence_started {
                None => {
                    self.silence_started = Some(at);
                }
                Some(started) => {
                    if at.duration_since(started) > self.config.silence_duration {
                        debug!(
                            silence_ms = at.duration_since(started).as_millis() as u64,
                            "silence exceeded configured duration, ending utterance"
                        );
                        self.silence_started = None;
                        self.armed = false;
                        return VadDecision {
                            volume,
                            end_of_utterance: true,
                        };
                    }
                }
            }
        } else if self.silence_started.is_some() {
            // Speech resumed before the duration elapsed
            self.silence_started = None;
        }

        VadDecision {
            volume,
            end_of_utterance: false,
        }
    }

    /// Stop evaluating windows without firing, e.g. when capture was stopped
    /// manually. Disarmed detectors emit volume only.
    pub fn disarm(&mut self) {
        self.armed = false;
        self.silence_started = None;
    }

    /// Re-arm for the next capture cycle.
    pub fn reset(&mut self) {
        self.armed = true;
        self.silence_started = None;
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW_MS: u64 = 50;

    fn detector() -> VoiceActivityDetector {
        VoiceActivityDetector::new(VadConfig {
            silence_threshold: 0.05,
            silence_duration: Duration::from_millis(1500),
        })
    }

    fn quiet_window() -> Vec<f32> {
        vec![0.01_f32; 800]
    }

    fn loud_window() -> Vec<f32> {
        vec![0.5_f32; 800]
    }

    /// Feed `total_ms` of 50 ms windows and count end-of-utterance events.
    fn feed_silence(vad: &mut VoiceActivityDetector, base: Instant, total_ms: u64) -> usize {
        let mut events = 0;
        let mut elapsed = 0;
        while elapsed <= total_ms {
            let decision = vad.observe(&quiet_window(), base + Duration::from_millis(elapsed));
            if decision.end_of_utterance {
                events += 1;
            }
            elapsed += WINDOW_MS;
        }
        events
    }

    #[test]
    fn test_sustained_silence_fires_exactly_once() {
        let mut vad = detector();
        let base = Instant::now();

        // 50 ms windows below threshold 0.05 for 1600 ms
        let events = feed_silence(&mut vad, base, 1600);
        assert_eq!(events, 1);

        // Further silence after firing produces nothing until reset
        let events = feed_silence(&mut vad, base + Duration::from_millis(2000), 3000);
        assert_eq!(events, 0);
    }

    #[test]
    fn test_short_silence_fires_nothing() {
        let mut vad = detector();
        let events = feed_silence(&mut vad, Instant::now(), 800);
        assert_eq!(events, 0);
        assert!(vad.is_armed());
    }

    #[test]
    fn test_speech_resets_the_silence_clock() {
        let mut vad = detector();
        let base = Instant::now();

        // 1000 ms of silence, then speech, then another 1000 ms of silence:
        // neither span alone exceeds the duration, so no event fires.
        assert_eq!(feed_silence(&mut vad, base, 1000), 0);
        let decision = vad.observe(&loud_window(), base + Duration::from_millis(1050));
        assert!(!decision.end_of_utterance);
        assert_eq!(feed_silence(&mut vad, base + Duration::from_millis(1100), 1000), 0);
    }

    #[test]
    fn test_reset_allows_a_second_utterance() {
        let mut vad = detector();
        let base = Instant::now();

        assert_eq!(feed_silence(&mut vad, base, 1600), 1);
        vad.reset();
        assert_eq!(
            feed_silence(&mut vad, base + Duration::from_millis(5000), 1600),
            1
        );
    }

    #[test]
    fn test_disarmed_detector_ignores_silence() {
        let mut vad = detector();
        vad.disarm();

        // Capture was stopped externally: no phantom events no matter how
        // long the silence runs.
        assert_eq!(feed_silence(&mut vad, Instant::now(), 5000), 0);
    }

    #[test]
    fn test_volume_reported_regardless_of_state() {
        let mut vad = detector();
        let base = Instant::now();

        let decision = vad.observe(&loud_window(), base);
        assert!((decision.volume.rms - 0.5).abs() < 1e-6);

        vad.disarm();
        let decision = vad.observe(&loud_window(), base + Duration::from_millis(50));
        assert!((decision.volume.rms - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_rms_of_empty_window_is_zero() {
        assert_eq!(VoiceActivityDetector::rms(&[]), 0.0);
    }
}
