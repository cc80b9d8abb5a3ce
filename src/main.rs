//! # Avatar Sync Backend - Main Application Entry Point
//!
//! Serves the real-time avatar session and the signing gateway from one
//! Actix-web server.
//!
//! ## Application Architecture:
//! - **audio**: gate, gain, jitter buffer and drift correction for lip-sync
//! - **engine**: conversational engine events and the ports sessions talk through
//! - **tools**: tool-call normalization and the signing-link mediator
//! - **session**: per-session state machine and controller actor
//! - **websocket**: the browser-facing session socket
//! - **gateway**: signing provider client, record stores, completion broadcast
//! - **handlers**: HTTP routes for signing, conversations and config
//! - **config / state / health / middleware / error**: the ambient service plumbing

mod audio;
mod config;
mod engine;
mod error;
mod gateway;
mod handlers;
mod health;
mod middleware;
mod session;
mod state;
mod tools;
mod websocket;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use config::AppConfig;
use state::AppState;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Set once SIGTERM or SIGINT arrives.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

#[actix_web::main]
async fn main() -> Result<()> {
    // A missing .env file is fine
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting {} v{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);
    log_integrations(&config);

    let app_state = AppState::new(config.clone());
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    setup_signal_handlers();

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            // Middleware runs in reverse order of registration for responses
            .wrap(cors)
            .wrap(middleware::MetricsMiddleware)
            .wrap(TracingLogger::default())
            .service(
                web::scope("/api/boldsign")
                    .route("/create-signing-link", web::post().to(handlers::create_signing_link))
                    .route("/update-signing-status", web::post().to(handlers::update_signing_status)),
            )
            .route("/api/conversations/save", web::post().to(handlers::save_conversation))
            .route("/signing/complete", web::get().to(handlers::signing_complete))
            .route("/ws/session", web::get().to(websocket::session_websocket))
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config)),
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

    info!("Server stopped gracefully");
    Ok(())
}

/// `RUST_LOG` wins; otherwise debug for this crate and info for actix.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "avatar_sync_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

/// Missing credentials are not fatal: sessions report them to the user instead.
fn log_integrations(config: &AppConfig) {
    if config.avatar.api_key.trim().is_empty() || config.engine.public_key.trim().is_empty() {
        warn!("Avatar or voice engine keys are not configured; sessions will not start");
    }
    if config.signing.api_key.trim().is_empty() || config.signing.template_id.trim().is_empty() {
        warn!("Signing provider is not configured; signing links will fail");
    }
}

fn setup_signal_handlers() {
    tokio::spawn(async {
        use tokio::signal::unix::{signal, SignalKind};

        let (mut sigterm, mut sigint) = match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
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

async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}
