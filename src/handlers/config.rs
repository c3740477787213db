//! Runtime configuration endpoints.
//!
//! `GET /api/v1/config` exposes the running configuration for debugging;
//! `PUT /api/v1/config` adjusts the runtime tunables (VAD thresholds, client
//! cadence). Listener and upstream addresses come from the environment at
//! startup and are reported read-only.

use crate::{error::RelayError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn get_config(state: web::Data<AppState>) -> Result<HttpResponse, RelayError> {
    let config = state.get_config();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": {
            "server": {
                "host": config.server.host,
                "port": config.server.port
            },
            "upstream": {
                "url": config.upstream.url
            },
            "cors": {
                "allowed_origins": config.cors.allowed_origins,
                "allowed_origin_suffixes": config.cors.allowed_origin_suffixes
            },
            "client": {
                "relay_url": config.client.relay_url,
                "reconnect_delay_secs": config.client.reconnect_delay_secs,
                "chunk_interval_ms": config.client.chunk_interval_ms
            },
            "vad": {
                "silence_threshold": config.vad.silence_threshold,
                "silence_duration_ms": config.vad.silence_duration_ms
            }
        }
    })))
}

pub async fn update_config(
    state: web::Data<AppState>,
    body: web::Json<serde_json::Value>,
) -> Result<HttpResponse, RelayError> {
    let json_str = serde_json::to_string(&body.into_inner())?;

    let mut current_config = state.get_config();
    current_config
        .update_from_json(&json_str)
        .map_err(|e| RelayError::Config(e.to_string()))?;

    state
        .update_config(current_config.clone())
        .map_err(RelayError::Config)?;

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "updated": {
            "client": {
                "reconnect_delay_secs": current_config.client.reconnect_delay_secs,
                "chunk_interval_ms": current_config.client.chunk_interval_ms
            },
            "vad": {
                "silence_threshold": current_config.vad.silence_threshold,
                "silence_duration_ms": current_config.vad.silence_duration_ms
            }
        }
    })))
}
