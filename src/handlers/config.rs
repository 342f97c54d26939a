use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

/// GET /api/v1/config
pub async fn get_config(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let config = state.get_config();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": config
    })))
}

/// PUT /api/v1/config
///
/// Accepts a partial document, e.g. `{"vad": {"end_debounce_ms": 500}}`.
/// New values apply to sessions created after the update.
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

    tracing::info!("Configuration updated at runtime");

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "message": "Configuration updated successfully",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "updated_config": current_config
    })))
}
