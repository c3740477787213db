//! # voice-client - Terminal Voice Client
//!
//! Wires the client pipeline together: microphone capture → voice-activity
//! detection → session transport, with the session's message log rendered to
//! the terminal. One utterance is streamed per capture cycle; capture
//! resumes automatically once the assistant has responded.

use anyhow::Result;
use std::time::{Duration, Instant};
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use voice_relay::audio::{AudioCapture, VadConfig, VoiceActivityDetector};
use voice_relay::client::{ClientSession, SessionEvent, SessionStore};
use voice_relay::config::AppConfig;
use voice_relay::message::ControlMessage;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let config = AppConfig::load()?;
    config.validate()?;

    // Stable per-install identity; the relay and upstream resume session
    // state from it across reconnects.
    let token = SessionStore::new().load_or_create()?;
    info!(session_id = %token, "using session identity");

    let (session, mut events) = ClientSession::new(
        config.client.relay_url.clone(),
        token,
        Duration::from_secs(config.client.reconnect_delay_secs),
    );
    session.connect();

    let mut vad = VoiceActivityDetector::new(VadConfig {
        silence_threshold: config.vad.silence_threshold,
        silence_duration: Duration::from_millis(config.vad.silence_duration_ms),
    });

    // A missing microphone is reported, not fatal: the session still
    // receives messages, there is just nothing to stream.
    let (chunk_tx, mut chunks) = mpsc::unbounded_channel();
    let mut capture =
        match AudioCapture::new(Duration::from_millis(config.client.chunk_interval_ms)) {
            Ok(capture) => Some(capture),
            Err(e) => {
                error!(error = %e, "microphone unavailable, running receive-only");
                None
            }
        };

    if let Some(capture) = capture.as_mut() {
        capture.start(chunk_tx.clone())?;
        info!("listening - speak into the microphone (ctrl-c to quit)");
    }

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("shutting down");
                break;
            }

            Some(chunk) = chunks.recv() => {
                let decision = vad.observe(&chunk.samples, Instant::now());

                if !session.send_binary(chunk.pcm_bytes()) {
                    debug!("dropped audio chunk while disconnected");
                }

                if decision.end_of_utterance {
                    info!("utterance complete, waiting for the assistant");
                    if let Some(capture) = capture.as_mut() {
                        capture.stop();
                    }
                    session.send_control(&ControlMessage::stop_recording());
                }
            }

            Some(event) = events.recv() => {
                match event {
                    SessionEvent::Connected => info!("connected to relay"),
                    SessionEvent::Disconnected => warn!("disconnected from relay, retrying"),
                    SessionEvent::Control(entry) => {
                        render(&entry.message);

                        // Resume listening once the assistant has answered
                        let answered = matches!(entry.message, ControlMessage::AiResponse { .. });
                        if answered {
                            if let Some(capture) = capture.as_mut() {
                                if !capture.is_capturing() {
                                    vad.reset();
                                    capture.start(chunk_tx.clone())?;
                                    info!("listening again");
                                }
                            }
                        }
                    }
                    SessionEvent::Audio(bytes) => {
                        // Synthesized speech playback is out of scope here
                        debug!(len = bytes.len(), "received audio frame");
                    }
                }
            }
        }
    }

    if let Some(capture) = capture.as_mut() {
        capture.stop();
    }
    session.disconnect();
    Ok(())
}

/// Terminal stand-in for the UI's message pane.
fn render(message: &ControlMessage) {
    match message {
        ControlMessage::System { message, .. } => {
            println!("[system] {}", message.as_deref().unwrap_or(""));
        }
        ControlMessage::Error { message, .. } => {
            println!("[error] {}", message.as_deref().unwrap_or(""));
        }
        ControlMessage::Status { message, .. } => {
            println!("[status] {}", message.as_deref().unwrap_or(""));
        }
        ControlMessage::Transcription { text, .. } => {
            println!("you: {}", text.as_deref().unwrap_or(""));
        }
        ControlMessage::AiResponse { text, .. } => {
            println!("assistant: {}", text.as_deref().unwrap_or(""));
        }
        ControlMessage::StopRecording { .. } | ControlMessage::Interrupt { .. } => {
            debug!(kind = message.kind(), "control signal echoed back");
        }
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voice_client=info,voice_relay=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
