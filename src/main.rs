//! # Realtime Voice Bridge - Main Application Entry Point
//!
//! Bridges a voice channel transport to a realtime speech-to-speech service
//! and exposes the voice commands over HTTP.
//!
//! ## Key Rust Concepts Used:
//! - **Two runtimes**: actix-web serves HTTP on its own single-threaded
//!   workers; the audio pipeline runs on a separate multi-threaded tokio runtime
//! - **modules**: Code is organized into separate modules (mod statements)
//! - **Result<T, E>**: Error handling using Rust's Result type
//! - **Arc & RwLock**: Thread-safe shared state management
//! - **static**: Global variables that live for the entire program duration
//!
//! ## Application Architecture:
//! - **config**: Application configuration (TOML file + environment variables)
//! - **voice**: Voice transport traits and the loopback transport
//! - **audio**: Frame formats, conversion, capture and playback
//! - **realtime**: The WebSocket client for the realtime service
//! - **session**: Per-guild session lifecycle (join, converse, leave)
//! - **state**: Shared HTTP state and metrics
//! - **health**: Health and metrics endpoints
//! - **middleware**: Request logging and metrics
//! - **handlers**: HTTP handlers for the voice commands
//! - **error**: Error types and HTTP error responses

mod audio;       // PCM formats, conversion, capture and playback (audio/ directory)
mod config;      // Configuration management (config.rs)
mod error;       // Error handling types (error.rs)
mod handlers;    // HTTP request handlers (handlers/ directory)
mod health;      // Health check endpoints (health.rs)
mod middleware;  // Custom middleware (middleware/ directory)
mod realtime;    // Realtime service client (realtime/ directory)
mod session;     // Session controller (session/ directory)
mod state;       // Application state management (state.rs)
mod voice;       // Voice transport abstraction (voice/ directory)

use actix_cors::Cors;
use actix_web::{middleware::Logger, web, App, HttpServer};
use anyhow::Result;
use config::{AppConfig, SharedConfigProvider};
use session::SessionController;
use state::AppState;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tokio::runtime::Handle;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use voice::LoopbackConnector;

/// Set by the signal task; polled by the server loop.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

/// The main application entry point.
///
/// ## What this function does:
/// 1. **Loads configuration** from files and environment variables
/// 2. **Sets up logging** for debugging and monitoring
/// 3. **Builds the pipeline runtime** that every voice session runs on
/// 4. **Runs the HTTP server** on the actix system until a shutdown signal
/// 5. **Shuts the pipeline runtime down** after sessions are torn down
///
/// The pipeline runtime is created and dropped outside the actix system
/// because a tokio runtime cannot be dropped from inside async code.
fn main() -> Result<()> {
    // .ok() means "ignore errors" - it's fine if there's no .env file
    dotenv::dotenv().ok();

    init_tracing()?;

    // Must run before the first wss:// connection is attempted
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install default crypto provider"))?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting {} v{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
    info!(
        host = %config.server.host,
        port = config.server.port,
        model = %config.realtime.model,
        credential_configured = config.realtime.api_key.is_some(),
        "Configuration loaded"
    );

    let pipeline = tokio::runtime::Builder::new_multi_thread()
        .thread_name("voice-pipeline")
        .enable_all()
        .build()?;

    let result = actix_web::rt::System::new().block_on(serve(config, pipeline.handle().clone()));

    pipeline.shutdown_background();
    info!("Server stopped gracefully");
    result
}

/// Wire the controller into the HTTP server and run until shutdown.
async fn serve(config: AppConfig, pipeline: Handle) -> Result<()> {
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    let loopback = Arc::new(LoopbackConnector::new(
        config.loopback.frame_interval(),
        config.loopback.recording_seconds,
    ));
    let shared_config = Arc::new(RwLock::new(config));
    let controller = SessionController::new(
        pipeline,
        loopback.clone(),
        Arc::new(SharedConfigProvider::new(shared_config.clone())),
    );
    let app_state = AppState::new(shared_config, controller.clone(), loopback);

    setup_signal_handlers()?;

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            // Middleware executes in reverse order for responses
            .wrap(cors)
            .wrap(Logger::default())
            .wrap(middleware::MetricsMiddleware)
            .wrap(middleware::RequestLogging)
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config))
                    .route("/sessions", web::get().to(handlers::list_sessions))
                    .service(
                        web::scope("/guilds/{guild_id}")
                            .route("", web::get().to(handlers::get_session))
                            .route("", web::delete().to(handlers::leave))
                            .route("/join", web::post().to(handlers::join))
                            .route("/conversation", web::post().to(handlers::start_conversation))
                            .route("/conversation", web::delete().to(handlers::stop_conversation))
                            .route("/say", web::post().to(handlers::say))
                            .route("/loopback/capture", web::post().to(handlers::inject_capture))
                            .route(
                                "/loopback/playback.wav",
                                web::get().to(handlers::export_playback),
                            ),
                    ),
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

    // Voice connections and realtime sockets close before the runtime goes away.
    controller.teardown_all().await;
    Ok(())
}

/// Initialize the tracing (logging) system for the application.
///
/// ## Environment Variables:
/// - `RUST_LOG`: Controls what gets logged (e.g., "debug", "realtime_voice_bridge=trace")
/// - If not set, defaults to "realtime_voice_bridge=debug,actix_web=info"
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "realtime_voice_bridge=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

/// Install SIGTERM/SIGINT handlers that set the global shutdown flag.
///
/// Installation happens before the task is spawned so a failure surfaces
/// as a startup error instead of a server that can't be stopped.
fn setup_signal_handlers() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }
        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });

    Ok(())
}

/// Wait for the shutdown signal to be set, checking every 100ms.
async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}
