use crate::{config::AppConfig, error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

/// Config as exposed over HTTP. API keys stay out; only whether one is set.
fn config_view(config: &AppConfig) -> serde_json::Value {
    json!({
        "server": {
            "host": config.server.host,
            "port": config.server.port
        },
        "audio": {
            "sample_rate": config.audio.sample_rate,
            "inbound_encoding": config.audio.inbound_encoding,
            "segment_duration_ms": config.audio.segment_duration_ms,
            "outbound_chunk_bytes": config.audio.outbound_chunk_bytes,
            "outbound_chunk_delay_ms": config.audio.outbound_chunk_delay_ms,
            "segment_queue_capacity": config.audio.segment_queue_capacity,
            "outbound_queue_capacity": config.audio.outbound_queue_capacity
        },
        "speech": {
            "transcription_url": config.speech.transcription_url,
            "transcription_model": config.speech.transcription_model,
            "openai_api_key_set": !config.speech.openai_api_key.is_empty(),
            "voice_id": config.speech.voice_id,
            "synthesis_model": config.speech.synthesis_model,
            "elevenlabs_api_key_set": !config.speech.elevenlabs_api_key.is_empty(),
            "responder_url": config.speech.responder_url,
            "greeting": config.speech.greeting,
            "fallback_message": config.speech.fallback_message,
            "request_timeout_secs": config.speech.request_timeout_secs
        },
        "performance": {
            "max_concurrent_sessions": config.performance.max_concurrent_sessions
        },
        "cache": {
            "max_entries": config.cache.max_entries,
            "ttl_secs": config.cache.ttl_secs
        }
    })
}

pub async fn get_config(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let config = state.get_config();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": config_view(&config)
    })))
}

/// Applies a partial update. Changes take effect for calls started afterwards.
pub async fn update_config(
    state: web::Data<AppState>,
    body: web::Json<serde_json::Value>,
) -> Result<HttpResponse, AppError> {
    let json_str = serde_json::to_string(&body.into_inner())?;

    let mut current_config = state.get_config();
    current_config
        .update_from_json(&json_str)
        .map_err(|e| AppError::ValidationError(e.to_string()))?;

    state.update_config(current_config.clone())
        .map_err(AppError::ValidationError)?;

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "message": "Configuration updated successfully",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "updated_config": config_view(&current_config)
    })))
}
