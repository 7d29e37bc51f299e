//! Voice service entry point.
//!
//! Startup order: configuration, database (with migrations), KV store,
//! key ring (first-boot signing key), then the HTTP/WebSocket server with
//! its background schedulers. Exit codes: 1 for any startup failure, 2 when
//! the first-boot key rotation fails.

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Context;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};
use voice_service::config::Settings;
use voice_service::middleware::{AbuseControl, RateLimitEngine, RateLimitMiddleware, RequireAuth};
use voice_service::pipeline::{
    spawn_event_pump, HttpAnalysisProvider, HttpTranscriptionProvider, PipelineCoordinator,
};
use voice_service::security::{AppleIdentityVerifier, KeyRing, SessionTokenService};
use voice_service::services::{HttpEntitlementChecker, QuotaGate};
use voice_service::state::AppState;
use voice_service::websocket::buffer::PushBuffer;
use voice_service::websocket::ChannelManager;
use voice_service::{db, logging, routes};

enum StartupError {
    /// Configuration, database, or KV failure: exit code 1.
    General(anyhow::Error),
    /// First-boot signing-key provisioning failed: exit code 2.
    FirstBootRotation(anyhow::Error),
}

#[actix_web::main]
async fn main() -> ExitCode {
    logging::init_tracing();

    match run().await {
        Ok(()) => {
            info!("voice service shutdown complete");
            ExitCode::SUCCESS
        }
        Err(StartupError::General(err)) => {
            error!(error = ?err, "startup failed");
            ExitCode::from(1)
        }
        Err(StartupError::FirstBootRotation(err)) => {
            error!(error = ?err, "first-boot key rotation failed");
            ExitCode::from(2)
        }
    }
}

async fn run() -> Result<(), StartupError> {
    info!("starting voice service");

    let settings = Arc::new(
        Settings::load()
            .context("failed to load configuration")
            .map_err(StartupError::General)?,
    );
    info!("configuration loaded");

    // Database
    let db_pool = db::init_pool(&settings.database.url, settings.database.max_connections)
        .await
        .context("failed to connect to PostgreSQL")
        .map_err(StartupError::General)?;
    sqlx::migrate!("./migrations")
        .run(&db_pool)
        .await
        .context("failed to run database migrations")
        .map_err(StartupError::General)?;
    info!("database pool initialized");

    // KV store
    let kv: Arc<dyn kv_store::KeyValueStore> = Arc::new(
        kv_store::RedisKvStore::connect(&settings.redis.url)
            .await
            .context("failed to connect to KV store")
            .map_err(StartupError::General)?,
    );
    info!("kv store connected");

    // Key ring and session tokens
    let crypto = Arc::new(
        crypto_core::EncryptionService::new(&settings.encryption.server_secret)
            .context("failed to derive encryption keys")
            .map_err(StartupError::General)?,
    );
    let keyring = Arc::new(KeyRing::new(
        kv.clone(),
        crypto,
        settings.key_rotation.clone(),
    ));
    keyring
        .ensure_signing_key()
        .await
        .context("cannot provision the initial signing key")
        .map_err(|e| StartupError::FirstBootRotation(e))?;
    info!("signing key ready");

    let sessions = Arc::new(SessionTokenService::new(
        keyring.clone(),
        settings.jwt.secret.clone(),
        settings.jwt.expires_in_secs,
    ));
    let _invalidation_handle = sessions.spawn_invalidation_listener(kv.clone());

    // Identity verification
    let identity = Arc::new(AppleIdentityVerifier::new(
        settings.apple.clone(),
        settings.providers.timeout(),
    ));

    // Rate limiting and abuse control
    let rate_limits = Arc::new(RateLimitEngine::new(&settings.rate_limit));
    let _sweeper_handle =
        rate_limits.spawn_sweeper(Duration::from_secs(settings.rate_limit.sweep_interval_secs));
    let abuse = Arc::new(AbuseControl::new(kv.clone(), settings.abuse.clone()));

    // Quota gate
    let entitlements = Arc::new(HttpEntitlementChecker::new(
        settings.providers.subscription_url.clone(),
        settings.providers.timeout(),
    ));
    let quota = Arc::new(QuotaGate::new(
        kv.clone(),
        entitlements,
        settings.free_tier.weekly_conversation_limit,
    ));

    // Push channel
    let push = Arc::new(ChannelManager::new(PushBuffer::new(
        kv.clone(),
        &settings.push,
    )));

    // Pipeline
    let transcriber = Arc::new(HttpTranscriptionProvider::new(
        settings.providers.transcription_url.clone(),
        settings.providers.transcription_api_key.clone(),
        settings.providers.timeout(),
    ));
    let analyst = Arc::new(HttpAnalysisProvider::new(
        settings.providers.analysis_url.clone(),
        settings.providers.analysis_api_key.clone(),
        settings.providers.analysis_model.clone(),
        settings.providers.timeout(),
    ));
    let (events_tx, events_rx) = tokio::sync::mpsc::unbounded_channel();
    let pipeline = Arc::new(PipelineCoordinator::new(
        db_pool.clone(),
        transcriber,
        analyst,
        events_tx,
    ));
    let _pump_handle = spawn_event_pump(push.clone(), events_rx);

    // Schedulers
    let _rotation_handle = spawn_rotation_scheduler(
        keyring.clone(),
        Duration::from_secs(settings.key_rotation.check_interval_secs),
    );

    let state = AppState {
        db: db_pool,
        kv,
        settings: settings.clone(),
        keyring,
        sessions: sessions.clone(),
        identity,
        rate_limits: rate_limits.clone(),
        abuse,
        quota,
        push: push.clone(),
        pipeline,
    };

    let bind_addr = (settings.server.host.clone(), settings.server.port);
    info!(host = %bind_addr.0, port = bind_addr.1, "starting HTTP server");

    let server = {
        let state = state.clone();
        HttpServer::new(move || {
            let public_limits = RateLimitMiddleware::new(state.rate_limits.clone());
            let protected_limits = RateLimitMiddleware::new(state.rate_limits.clone());

            App::new()
                .app_data(web::Data::new(state.clone()))
                .wrap(Cors::permissive())
                .service(routes::health::health)
                .service(
                    web::scope("/v1")
                        .service(
                            web::scope("/auth")
                                .wrap(public_limits)
                                .service(routes::auth::apple_sign_in),
                        )
                        .service(routes::ws::push_channel)
                        .service(
                            web::scope("")
                                // Registration order matters: auth runs first so
                                // limits key on the user id.
                                .wrap(protected_limits)
                                .wrap(RequireAuth::new(state.sessions.clone()))
                                .service(routes::conversations::create_conversation)
                                .service(routes::conversations::list_conversations)
                                .service(routes::conversations::get_conversation)
                                .service(routes::conversations::upload_audio)
                                .service(routes::users::me)
                                .service(routes::users::update_me),
                        ),
                )
        })
        .bind(bind_addr)
        .context("failed to bind server address")
        .map_err(StartupError::General)?
        .disable_signals()
        .run()
    };

    // Graceful shutdown: stop accepting, tell every push connection, give
    // them two seconds, then stop the workers.
    let server_handle = server.handle();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received");
        push.shutdown().await;
        tokio::time::sleep(Duration::from_secs(2)).await;
        // Whatever is still open after the drain window gets cut off.
        server_handle.stop(false).await;
    });

    server
        .await
        .context("server error")
        .map_err(StartupError::General)
}

fn spawn_rotation_scheduler(
    keyring: Arc<KeyRing>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick fires immediately; the startup path already ensured
        // a signing key, so skip it.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(err) = keyring.check_and_rotate_keys().await {
                warn!(error = %err, "scheduled key-rotation check failed");
            }
        }
    })
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("received Ctrl+C signal");
        },
        _ = terminate => {
            info!("received SIGTERM signal");
        },
    }
}
