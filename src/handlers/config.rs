use crate::{config::AppConfig, error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::{json, Value};

/// Secrets are reported as configured or not, never echoed.
fn masked(secret: &str) -> Value {
    json!({ "configured": !secret.trim().is_empty() })
}

fn config_json(config: &AppConfig) -> Value {
    json!({
        "server": {
            "host": config.server.host,
            "port": config.server.port
        },
        "audio": {
            "sample_rate": config.audio.sample_rate,
            "frame_size": config.audio.frame_size,
            "silence_threshold": config.audio.silence_threshold,
            "target_rms": config.audio.target_rms,
            "max_gain": config.audio.max_gain
        },
        "sync": {
            "target_latency_ms": config.sync.target_latency_ms,
            "drift_check_interval_ms": config.sync.drift_check_interval_ms,
            "drift_poll_ms": config.sync.drift_poll_ms,
            "track_retry_ms": config.sync.track_retry_ms
        },
        "tools": {
            "fallback_debounce_ms": config.tools.fallback_debounce_ms,
            "success_banner_ms": config.tools.success_banner_ms,
            "fallback_keywords": config.tools.fallback_keywords
        },
        "avatar": {
            "api_key": masked(&config.avatar.api_key),
            "face_id": config.avatar.face_id
        },
        "engine": {
            "public_key": masked(&config.engine.public_key),
            "assistant_id": config.engine.assistant_id,
            "model": config.engine.model,
            "voice_id": config.engine.voice_id
        },
        "signing": {
            "api_key": masked(&config.signing.api_key),
            "template_id": config.signing.template_id,
            "provider_base_url": config.signing.provider_base_url,
            "frontend_url": config.signing.frontend_url,
            "gateway_url": config.signing.gateway_url
        },
        "performance": {
            "max_concurrent_sessions": config.performance.max_concurrent_sessions
        }
    })
}

pub async fn get_config(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let config = state.get_config();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": config_json(&config)
    })))
}

pub async fn update_config(
    state: web::Data<AppState>,
    body: web::Json<serde_json::Value>,
) -> Result<HttpResponse, AppError> {
    let json_str = serde_json::to_string(&body.into_inner())?;

    let mut current_config = state.get_config();
    current_config
        .update_from_json(&json_str)
        .map_err(|e| AppError::ValidationError(e.to_string()))?;

    state
        .update_config(current_config.clone())
        .map_err(AppError::ValidationError)?;

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "message": "Configuration updated successfully",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "updated_config": config_json(&current_config)
    })))
}
