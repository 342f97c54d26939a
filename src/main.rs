//! # EVA Realtime Backend - Main Application Entry Point
//!
//! Real-time conversational turn-taking server. Clients stream microphone
//! audio over a WebSocket; the server decides when the user has finished
//! speaking, runs the reply pipeline, streams the agent's speech back and
//! stops it the moment the user talks over it.
//!
//! ## Application Architecture:
//! - **audio**: rolling buffer, PCM decoding, voice activity scoring
//! - **conversation**: speech tracking, barge-in detection, state machine, stats
//! - **session**: per-user orchestrator and the session registry
//! - **downstream**: STT → response → TTS collaborators and the turn pipeline
//! - **websocket**: the `/ws/conversation` actor
//! - **handlers**: session management and runtime config API
//! - **config** / **state** / **health** / **middleware** / **error**: server plumbing
//!
//! ## Lifecycle:
//! 1. Load `.env`, start tracing, load and validate configuration
//! 2. Build shared state (session registry + pipeline)
//! 3. Start the idle-session cleanup task and the HTTP server
//! 4. On SIGINT/SIGTERM: stop the server gracefully, then drain all sessions

mod audio;
mod config;
mod conversation;
mod downstream;
mod error;
mod handlers;
mod health;
mod middleware;
mod session;
mod state;
mod websocket;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use config::AppConfig;
use state::AppState;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{error, info};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Set once SIGINT or SIGTERM arrives.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting eva-realtime-backend v{}", env!("CARGO_PKG_VERSION"));
    info!(
        host = %config.server.host,
        port = config.server.port,
        sample_rate = config.audio.sample_rate,
        max_sessions = config.performance.max_concurrent_sessions,
        "Configuration loaded"
    );

    let app_state = AppState::new(config.clone());
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    setup_signal_handlers();
    spawn_idle_cleanup(app_state.clone());

    info!("Starting HTTP server on {}", bind_addr);

    let server_state = app_state.clone();
    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(server_state.clone()))
            // Middleware runs in reverse registration order on the way in.
            .wrap(cors)
            .wrap(TracingLogger::default())
            .wrap(middleware::MetricsMiddleware)
            .wrap(middleware::RequestLogging)
            .route("/ws/conversation", web::get().to(websocket::conversation_websocket))
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config))
                    .route("/sessions", web::post().to(handlers::create_session))
                    .route("/sessions", web::get().to(handlers::list_sessions))
                    .route("/sessions/{session_id}", web::get().to(handlers::get_session))
                    .route("/sessions/{session_id}", web::delete().to(handlers::close_session))
                    .route(
                        "/sessions/{session_id}/stats",
                        web::get().to(handlers::get_session_stats),
                    )
                    .route("/stats", web::get().to(handlers::aggregate_stats)),
            )
            .route("/health", web::get().to(health::health_check))
    })
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    let drained = app_state.sessions.drain();
    info!(drained, "Server stopped gracefully");
    Ok(())
}

/// Initialize tracing.
///
/// ## Environment Variables:
/// - `RUST_LOG`: log filter; defaults to "eva_realtime_backend=debug,actix_web=info"
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "eva_realtime_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Periodically remove sessions that have seen no audio or control traffic
/// for longer than `performance.idle_timeout_seconds`.
///
/// Both values are read from the live config on every tick.
fn spawn_idle_cleanup(state: AppState) {
    tokio::spawn(async move {
        loop {
            let interval = state.get_config().performance.cleanup_interval_seconds;
            tokio::time::sleep(Duration::from_secs(interval)).await;
            if SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
                break;
            }

            let max_idle = state.get_config().performance.idle_timeout_seconds;
            let removed = state.sessions.cleanup_idle(max_idle);
            for session_id in &removed {
                info!(session_id = %session_id, "Removed idle session");
            }
        }
    });
}

/// Listen for SIGTERM and SIGINT and raise the shutdown flag.
fn setup_signal_handlers() {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async {
        let (mut sigterm, mut sigint) = match (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        ) {
            (Ok(term), Ok(int)) => (term, int),
            (Err(e), _) | (_, Err(e)) => {
                error!("Failed to install signal handlers: {}", e);
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

/// Resolve once the shutdown flag is set.
async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
