//! Session management API under `/api/v1`.
//!
//! Sessions created here have no transport attached yet; a WebSocket client
//! attaches by sending `start` with the returned `session_id`.

use crate::{error::AppResult, session::SessionCallbacks, state::AppState};
use actix_web::{web, HttpResponse};
use serde::Deserialize;
use serde_json::json;

#[derive(Debug, Default, Deserialize)]
pub struct CreateSessionRequest {
    pub session_id: Option<String>,
}

/// POST /api/v1/sessions
pub async fn create_session(
    state: web::Data<AppState>,
    body: Option<web::Json<CreateSessionRequest>>,
) -> AppResult<HttpResponse> {
    let request = body.map(|b| b.into_inner()).unwrap_or_default();
    let session = state
        .sessions
        .create_session(request.session_id, SessionCallbacks::new())?;

    Ok(HttpResponse::Created().json(session.info()))
}

/// GET /api/v1/sessions
pub async fn list_sessions(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let sessions = state.sessions.list_sessions();
    Ok(HttpResponse::Ok().json(json!({
        "count": sessions.len(),
        "max_sessions": state.sessions.max_concurrent_sessions(),
        "sessions": sessions
    })))
}

/// GET /api/v1/sessions/{session_id}
pub async fn get_session(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> AppResult<HttpResponse> {
    let session = state.sessions.require_session(&path)?;
    Ok(HttpResponse::Ok().json(session.info()))
}

/// GET /api/v1/sessions/{session_id}/stats
pub async fn get_session_stats(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> AppResult<HttpResponse> {
    let session = state.sessions.require_session(&path)?;
    let stats = session.info().status.stats;
    Ok(HttpResponse::Ok().json(json!({
        "session_id": session.id(),
        "stats": stats
    })))
}

/// DELETE /api/v1/sessions/{session_id}
///
/// Closing an unknown or already closed session is not an error.
pub async fn close_session(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> AppResult<HttpResponse> {
    let removed = state.sessions.remove_session(&path);
    Ok(HttpResponse::Ok().json(json!({
        "session_id": path.into_inner(),
        "closed": removed
    })))
}

/// GET /api/v1/stats
pub async fn aggregate_stats(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "sessions": state.sessions.summary()
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::buffer::AudioChunk;
    use crate::config::AppConfig;
    use actix_web::{test, App};

    fn app_state(max_sessions: usize) -> web::Data<AppState> {
        let mut config = AppConfig::default();
        config.performance.max_concurrent_sessions = max_sessions;
        web::Data::new(AppState::new(config))
    }

    macro_rules! sessions_app {
        ($state:expr) => {
            test::init_service(
                App::new().app_data($state.clone()).service(
                    web::scope("/api/v1")
                        .route("/sessions", web::post().to(create_session))
                        .route("/sessions", web::get().to(list_sessions))
                        .route("/sessions/{session_id}", web::get().to(get_session))
                        .route("/sessions/{session_id}", web::delete().to(close_session))
                        .route("/sessions/{session_id}/stats", web::get().to(get_session_stats))
                        .route("/stats", web::get().to(aggregate_stats)),
                ),
            )
            .await
        };
    }

    #[actix_web::test]
    async fn test_session_lifecycle() {
        let state = app_state(4);
        let app = sessions_app!(state);

        let req = test::TestRequest::post()
            .uri("/api/v1/sessions")
            .set_json(json!({"session_id": "call-1"}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 201);

        let req = test::TestRequest::get().uri("/api/v1/sessions/call-1").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["session_id"], "call-1");
        assert_eq!(body["state"], "idle");

        let req = test::TestRequest::delete().uri("/api/v1/sessions/call-1").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["closed"], true);

        // idempotent
        let req = test::TestRequest::delete().uri("/api/v1/sessions/call-1").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["closed"], false);

        let req = test::TestRequest::get().uri("/api/v1/sessions/call-1").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 404);
    }

    #[actix_web::test]
    async fn test_duplicate_and_capacity_errors() {
        let state = app_state(1);
        let app = sessions_app!(state);

        let req = test::TestRequest::post()
            .uri("/api/v1/sessions")
            .set_json(json!({"session_id": "a"}))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), 201);

        let req = test::TestRequest::post()
            .uri("/api/v1/sessions")
            .set_json(json!({"session_id": "a"}))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), 409);

        let req = test::TestRequest::post().uri("/api/v1/sessions").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 503);
        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["error"]["type"], "unavailable");
    }

    #[actix_web::test]
    async fn test_stats_endpoints() {
        let state = app_state(4);
        let session = state
            .sessions
            .create_session(Some("talker".into()), SessionCallbacks::new())
            .unwrap();
        for ms in (0..300).step_by(20) {
            session
                .process_audio_chunk(AudioChunk::new(ms as f64 / 1000.0, vec![0.5; 320], 16_000))
                .unwrap();
        }
        let app = sessions_app!(state);

        let req = test::TestRequest::get().uri("/api/v1/sessions/talker/stats").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["stats"]["chunks_processed"], 15);

        let req = test::TestRequest::get().uri("/api/v1/stats").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["sessions"]["total_sessions"], 1);
        assert_eq!(body["sessions"]["state_counts"]["user_speaking"], 1);
    }
}
