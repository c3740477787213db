//! # voice-relay
//!
//! Real-time audio session relay between voice clients and an upstream
//! speech/AI service, plus the client-side capture pipeline.
//!
//! ## Crate layout:
//! - **relay**: per-connection Pairing actor that forwards frames verbatim
//! - **client**: session transport with reconnect, and the persisted
//!   session identity
//! - **audio**: microphone capture and energy-based voice-activity detection
//! - **message**: the JSON control-message protocol shared by all parties
//! - **config / state / health / middleware / handlers / error**: the
//!   service shell around the relay
//!
//! Two binaries are built from this library: `voice-relay` (the relay
//! process) and `voice-client` (a terminal client wiring capture → VAD →
//! session).

pub mod audio;
pub mod client;
pub mod config;
pub mod error;
pub mod handlers;
pub mod health;
pub mod message;
pub mod middleware;
pub mod relay;
pub mod state;

pub use config::AppConfig;
pub use error::{RelayError, RelayResult};
pub use state::AppState;
