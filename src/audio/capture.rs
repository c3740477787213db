//! Microphone capture via `cpal`.
//!
//! [`AudioCapture`] owns the input device for the duration of a capture and
//! slices the callback stream into fixed-cadence [`AudioChunk`]s (100 ms by
//! default, matching the transport framing the upstream service expects).
//! The cadence is measured in sample counts rather than wall clock, so
//! chunk boundaries are exact regardless of the platform's callback sizes.
//!
//! ## Stop semantics
//!
//! `stop()` is idempotent. While capturing it flips an atomic gate *before*
//! flushing, so a callback racing with teardown sees the gate closed and
//! discards its buffer: nothing is emitted after `stop()` returns, even if
//! the hardware delivers one more buffer while the stream winds down.

use byteorder::{LittleEndian, WriteBytesExt};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{error, warn};

/// One fixed-cadence slice of captured audio.
///
/// Chunks are produced in capture order and carry an implicit sequence
/// position; they are forwarded immediately and never retained.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    /// Mono samples in `[-1.0, 1.0]`.
    pub samples: Vec<f32>,
    /// Sample rate of this chunk in Hz.
    pub sample_rate: u32,
    /// When the chunk was sliced off, milliseconds since the epoch.
    pub captured_at: i64,
}

impl AudioChunk {
    /// Encode as 16-bit little-endian PCM for the transport.
    pub fn pcm_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.samples.len() * 2);
        for sample in &self.samples {
            let value = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
            // Writing into a Vec cannot fail
            bytes.write_i16::<LittleEndian>(value).expect("vec write");
        }
        bytes
    }
}

/// Errors that can occur while acquiring or running the capture device.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("no input device found on the default audio host")]
    NoDevice,

    #[error("failed to query default input config: {0}")]
    DefaultConfig(#[from] cpal::DefaultStreamConfigError),

    #[error("failed to build input stream: {0}")]
    BuildStream(#[from] cpal::BuildStreamError),

    #[error("failed to start audio stream: {0}")]
    PlayStream(#[from] cpal::PlayStreamError),
}

/// Slices an interleaved callback stream into mono fixed-size chunks.
///
/// Kept separate from the device plumbing so the cadence and downmix logic
/// are testable without hardware.
#[derive(Debug)]
pub struct ChunkAssembler {
    sample_rate: u32,
    samples_per_chunk: usize,
    pending: Vec<f32>,
}

impl ChunkAssembler {
    pub fn new(sample_rate: u32, chunk_interval: Duration) -> Self {
        let samples_per_chunk =
            ((sample_rate as u128 * chunk_interval.as_millis()) / 1000).max(1) as usize;
        Self {
            sample_rate,
            samples_per_chunk,
            pending: Vec::with_capacity(samples_per_chunk),
        }
    }

    /// Append an interleaved buffer, downmixing to mono, and return every
    /// complete chunk this buffer filled.
    pub fn push(&mut self, interleaved: &[f32], channels: u16) -> Vec<AudioChunk> {
        if channels <= 1 {
            self.pending.extend_from_slice(interleaved);
        } else {
            let channels = channels as usize;
            for frame in interleaved.chunks_exact(channels) {
                self.pending
                    .push(frame.iter().sum::<f32>() / channels as f32);
            }
        }

        let mut chunks = Vec::new();
        while self.pending.len() >= self.samples_per_chunk {
            let rest = self.pending.split_off(self.samples_per_chunk);
            let samples = std::mem::replace(&mut self.pending, rest);
            chunks.push(self.make_chunk(samples));
        }
        chunks
    }

    /// Emit whatever is buffered as a final short chunk, if anything.
    pub fn flush(&mut self) -> Option<AudioChunk> {
        if self.pending.is_empty() {
            return None;
        }
        let samples = std::mem::take(&mut self.pending);
        Some(self.make_chunk(samples))
    }

    fn make_chunk(&self, samples: Vec<f32>) -> AudioChunk {
        AudioChunk {
            samples,
            sample_rate: self.sample_rate,
            captured_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn samples_per_chunk(&self) -> usize {
        self.samples_per_chunk
    }
}

/// Live stream state, present only while capturing.
struct ActiveCapture {
    /// Keeps the cpal stream alive; dropping it releases the device.
    stream: cpal::Stream,
    /// Closed before teardown so late callbacks discard their data.
    gate: Arc<AtomicBool>,
    assembler: Arc<Mutex<ChunkAssembler>>,
    tx: mpsc::UnboundedSender<AudioChunk>,
}

/// Microphone capture with exclusive device ownership while active.
pub struct AudioCapture {
    device: cpal::Device,
    config: cpal::StreamConfig,
    sample_rate: u32,
    channels: u16,
    chunk_interval: Duration,
    active: Option<ActiveCapture>,
}

impl AudioCapture {
    /// Bind to the system default input device.
    ///
    /// The device's preferred configuration is used as-is; the assembler
    /// downmixes to mono, and echo cancellation / noise suppression are
    /// whatever the platform's default input pipeline provides.
    ///
    /// Failure leaves no capture state behind; there is no "starting"
    /// limbo to recover from.
    pub fn new(chunk_interval: Duration) -> Result<Self, CaptureError> {
        let host = cpal::default_host();
        let device = host.default_input_device().ok_or(CaptureError::NoDevice)?;

        let supported = device.default_input_config()?;
        let channels = supported.channels();
        let sample_rate = supported.sample_rate().0;
        let config: cpal::StreamConfig = supported.into();

        Ok(Self {
            device,
            config,
            sample_rate,
            channels,
            chunk_interval,
            active: None,
        })
    }

    /// Begin producing chunks on `tx`. A no-op while already capturing.
    pub fn start(&mut self, tx: mpsc::UnboundedSender<AudioChunk>) -> Result<(), CaptureError> {
        if self.active.is_some() {
            return Ok(());
        }

        let gate = Arc::new(AtomicBool::new(true));
        let assembler = Arc::new(Mutex::new(ChunkAssembler::new(
            self.sample_rate,
            self.chunk_interval,
        )));

        let cb_gate = gate.clone();
        let cb_assembler = assembler.clone();
        let cb_tx = tx.clone();
        let channels = self.channels;

        let stream = self.device.build_input_stream(
            &self.config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                // Gate closed means stop() already ran: discard, don't emit.
                if !cb_gate.load(Ordering::Acquire) {
                    return;
                }
                let chunks = {
                    let mut assembler = cb_assembler.lock().unwrap();
                    assembler.push(data, channels)
                };
                for chunk in chunks {
                    if cb_tx.send(chunk).is_err() {
                        warn!("audio chunk receiver dropped while capturing");
                        return;
                    }
                }
            },
            |err: cpal::StreamError| {
                error!(error = %err, "input stream error");
            },
            None,
        )?;

        stream.play()?;

        self.active = Some(ActiveCapture {
            stream,
            gate,
            assembler,
            tx,
        });
        Ok(())
    }

    /// Stop capturing. Idempotent: a no-op while not capturing; otherwise
    /// flushes the partial chunk, releases the device, and guarantees no
    /// further chunks are produced.
    pub fn stop(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };

        // Close the gate first; a callback already holding the assembler
        // lock finishes before we take it, anything later is discarded.
        active.gate.store(false, Ordering::Release);

        let remainder = active.assembler.lock().unwrap().flush();
        if let Some(chunk) = remainder {
            let _ = active.tx.send(chunk);
        }

        drop(active.stream);
    }

    pub fn is_capturing(&self) -> bool {
        self.active.is_some()
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

impl Drop for AudioCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assembler_cadence_in_samples() {
        // 100 ms at 44.1 kHz is 4410 samples
        let assembler = ChunkAssembler::new(44_100, Duration::from_millis(100));
        assert_eq!(assembler.samples_per_chunk(), 4410);
    }

    #[test]
    fn test_chunks_emitted_only_on_boundaries() {
        let mut assembler = ChunkAssembler::new(16_000, Duration::from_millis(100));
        // 1600 samples per chunk; feed 1000 then 1000
        assert!(assembler.push(&vec![0.1; 1000], 1).is_empty());
        let chunks = assembler.push(&vec![0.1; 1000], 1);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].samples.len(), 1600);
        // 400 samples remain pending
        let remainder = assembler.flush().unwrap();
        assert_eq!(remainder.samples.len(), 400);
    }

    #[test]
    fn test_large_buffer_yields_multiple_chunks_in_order() {
        let mut assembler = ChunkAssembler::new(16_000, Duration::from_millis(100));
        let mut input = Vec::new();
        for i in 0..3500_u32 {
            input.push(i as f32 / 10_000.0);
        }
        let chunks = assembler.push(&input, 1);
        assert_eq!(chunks.len(), 2);
        // Capture order preserved across the boundary
        assert_eq!(chunks[0].samples[0], 0.0);
        assert_eq!(chunks[1].samples[0], 1600.0 / 10_000.0);
    }

    #[test]
    fn test_flush_is_empty_after_flush() {
        let mut assembler = ChunkAssembler::new(16_000, Duration::from_millis(100));
        assembler.push(&vec![0.2; 100], 1);
        assert!(assembler.flush().is_some());
        assert!(assembler.flush().is_none());
    }

    #[test]
    fn test_stereo_downmix() {
        let mut assembler = ChunkAssembler::new(16_000, Duration::from_millis(100));
        // Left 0.4, right 0.2 → mono 0.3
        assembler.push(&[0.4, 0.2, 0.4, 0.2], 2);
        let chunk = assembler.flush().unwrap();
        assert_eq!(chunk.samples.len(), 2);
        assert!((chunk.samples[0] - 0.3).abs() < 1e-6);
    }

    #[test]
    fn test_pcm_encoding_little_endian() {
        let chunk = AudioChunk {
            samples: vec![0.0, 1.0, -1.0],
            sample_rate: 16_000,
            captured_at: 0,
        };
        let bytes = chunk.pcm_bytes();
        assert_eq!(bytes.len(), 6);
        assert_eq!(&bytes[0..2], &[0, 0]);
        assert_eq!(&bytes[2..4], &i16::MAX.to_le_bytes());
        assert_eq!(&bytes[4..6], &(-i16::MAX).to_le_bytes());
    }

    #[test]
    fn test_pcm_encoding_clamps_out_of_range() {
        let chunk = AudioChunk {
            samples: vec![2.0, -2.0],
            sample_rate: 16_000,
            captured_at: 0,
        };
        let bytes = chunk.pcm_bytes();
        assert_eq!(&bytes[0..2], &i16::MAX.to_le_bytes());
        assert_eq!(&bytes[2..4], &(-i16::MAX).to_le_bytes());
    }
}
