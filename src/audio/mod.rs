//! Client-side audio pipeline: microphone capture and voice-activity
//! detection.
//!
//! [`capture::AudioCapture`] produces fixed-cadence [`capture::AudioChunk`]s
//! from the default input device; [`vad::VoiceActivityDetector`] watches the
//! same sample windows and decides when an utterance has ended.

pub mod capture;
pub mod vad;

pub use capture::{AudioCapture, AudioChunk, CaptureError, ChunkAssembler};
pub use vad::{VadConfig, VadDecision, VoiceActivityDetector, VolumeSample};
