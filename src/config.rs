//! # Configuration Management
//!
//! Loads application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix, `__` as the section separator)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Deployment-platform variables (HOST, PORT, UPSTREAM_URL, FRONTEND_URL)
//! 2. Environment variables (APP_SERVER__HOST, APP_VAD__SILENCE_THRESHOLD, ...)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)
//!
//! The silence threshold and duration are deliberately configuration, not
//! constants: reasonable deployments range from 0.02 to 0.1 for the
//! threshold and 1.0 to 1.5 s for the duration depending on microphone and
//! room noise.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

/// Main application configuration for both the relay process and the
/// client binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    pub cors: CorsConfig,
    pub client: ClientConfig,
    pub vad: VadSettings,
}

/// Relay listener settings.
///
/// - `host = "127.0.0.1"`: only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: accept connections from any address (production)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Where the relay opens its outbound connection for each Pairing.
///
/// The `session_id` query parameter is appended per connection; it is never
/// part of this URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    pub url: String,
}

/// Origin policy for inbound connections.
///
/// An origin is permitted when it appears verbatim in `allowed_origins` or
/// ends with one of `allowed_origin_suffixes` (e.g. `.vercel.app` for
/// preview deployments). Requests without an Origin header (native clients,
/// curl) are always permitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorsConfig {
    pub allowed_origins: Vec<String>,
    pub allowed_origin_suffixes: Vec<String>,
}

/// Settings consumed by the `voice-client` binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// WebSocket endpoint of the relay.
    pub relay_url: String,
    /// Fixed delay before re-dialing after an unexpected close.
    pub reconnect_delay_secs: u64,
    /// Audio chunk cadence during active capture.
    pub chunk_interval_ms: u64,
}

/// Voice-activity detection tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VadSettings {
    /// RMS energy below which a window counts as silence (0.0–1.0).
    pub silence_threshold: f32,
    /// Sustained silence that ends an utterance, in milliseconds.
    pub silence_duration_ms: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 3001,
            },
            upstream: UpstreamConfig {
                url: "ws://localhost:8000/ws/ai".to_string(),
            },
            cors: CorsConfig {
                allowed_origins: vec![
                    "http://localhost:3000".to_string(),
                    "http://localhost:3001".to_string(),
                ],
                allowed_origin_suffixes: vec![".vercel.app".to_string()],
            },
            client: ClientConfig {
                relay_url: "ws://localhost:3001/ws".to_string(),
                reconnect_delay_secs: 3,
                chunk_interval_ms: 100,
            },
            vad: VadSettings {
                silence_threshold: 0.05,
                silence_duration_ms: 1500,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, config.toml, and the environment.
    ///
    /// Deployment platforms conventionally set bare `HOST`/`PORT` variables,
    /// and this system's deployments additionally use `UPSTREAM_URL` and
    /// `FRONTEND_URL`; all four are honored without the `APP_` prefix.
    /// `FRONTEND_URL`, when set, is appended to the allowed-origin list.
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        if let Ok(upstream) = env::var("UPSTREAM_URL") {
            settings = settings.set_override("upstream.url", upstream)?;
        }

        let mut config: AppConfig = settings.build()?.try_deserialize()?;

        if let Ok(origin) = env::var("FRONTEND_URL") {
            if !origin.is_empty() {
                config.cors.allowed_origins.push(origin);
            }
        }

        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// Catching configuration errors at startup gives a clear message
    /// instead of a confusing runtime failure on the first connection.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        let upstream = url::Url::parse(&self.upstream.url)
            .map_err(|e| anyhow::anyhow!("Invalid upstream URL: {}", e))?;
        if upstream.scheme() != "ws" && upstream.scheme() != "wss" {
            return Err(anyhow::anyhow!(
                "Upstream URL must use the ws or wss scheme, got {}",
                upstream.scheme()
            ));
        }

        if !(self.vad.silence_threshold > 0.0 && self.vad.silence_threshold < 1.0) {
            return Err(anyhow::anyhow!(
                "Silence threshold must be between 0 and 1 (exclusive)"
            ));
        }

        if self.vad.silence_duration_ms == 0 {
            return Err(anyhow::anyhow!("Silence duration must be greater than 0"));
        }

        if self.client.reconnect_delay_secs == 0 {
            return Err(anyhow::anyhow!("Reconnect delay must be greater than 0"));
        }

        if self.client.chunk_interval_ms == 0 {
            return Err(anyhow::anyhow!("Chunk interval must be greater than 0"));
        }

        Ok(())
    }

    /// Apply a partial update from a JSON body (runtime config endpoint).
    ///
    /// Only the runtime tunables (VAD settings and client cadence/delay)
    /// are updatable; listener and upstream addresses require a restart to
    /// take effect and are rejected implicitly by being ignored here.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial: serde_json::Value = serde_json::from_str(json_str)?;

        if let Some(vad) = partial.get("vad") {
            if let Some(threshold) = vad.get("silence_threshold").and_then(|v| v.as_f64()) {
                self.vad.silence_threshold = threshold as f32;
            }
            if let Some(duration) = vad.get("silence_duration_ms").and_then(|v| v.as_u64()) {
                self.vad.silence_duration_ms = duration;
            }
        }

        if let Some(client) = partial.get("client") {
            if let Some(delay) = client.get("reconnect_delay_secs").and_then(|v| v.as_u64()) {
                self.client.reconnect_delay_secs = delay;
            }
            if let Some(interval) = client.get("chunk_interval_ms").and_then(|v| v.as_u64()) {
                self.client.chunk_interval_ms = interval;
            }
        }

        self.validate()?;
        Ok(())
    }
}

impl CorsConfig {
    /// Decide whether an inbound connection's Origin is acceptable.
    ///
    /// `None` (no Origin header) is allowed: native clients and tooling do
    /// not send one.
    pub fn permits(&self, origin: Option<&str>) -> bool {
        match origin {
            None => true,
            Some(origin) => {
                self.allowed_origins.iter().any(|allowed| allowed == origin)
                    || self
                        .allowed_origin_suffixes
                        .iter()
                        .any(|suffix| origin.ends_with(suffix.as_str()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 3001);
        assert_eq!(config.upstream.url, "ws://localhost:8000/ws/ai");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.upstream.url = "http://localhost:8000".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.vad.silence_threshold = 1.5;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.vad.silence_duration_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_update() {
        let mut config = AppConfig::default();
        let json = r#"{"vad": {"silence_threshold": 0.02, "silence_duration_ms": 1000}}"#;
        assert!(config.update_from_json(json).is_ok());
        assert!((config.vad.silence_threshold - 0.02).abs() < 1e-6);
        assert_eq!(config.vad.silence_duration_ms, 1000);
        // Untouched sections keep their values
        assert_eq!(config.server.port, 3001);
    }

    #[test]
    fn test_config_update_rejects_invalid_values() {
        let mut config = AppConfig::default();
        let json = r#"{"vad": {"silence_duration_ms": 0}}"#;
        assert!(config.update_from_json(json).is_err());
    }

    #[test]
    fn test_origin_policy_exact_match() {
        let config = AppConfig::default();
        assert!(config.cors.permits(Some("http://localhost:3000")));
        assert!(config.cors.permits(Some("http://localhost:3001")));
        assert!(!config.cors.permits(Some("http://evil.example.com")));
    }

    #[test]
    fn test_origin_policy_suffix_match() {
        let config = AppConfig::default();
        assert!(config.cors.permits(Some("https://preview-abc123.vercel.app")));
        assert!(!config.cors.permits(Some("https://vercel.app.evil.com")));
    }

    #[test]
    fn test_origin_policy_allows_missing_origin() {
        let config = AppConfig::default();
        assert!(config.cors.permits(None));
    }
}
