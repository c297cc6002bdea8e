//! # whisper-pool-backend - Server Entry Point
//!
//! Starts the actix-web host around a [`TranscriptionService`].
//!
//! ## Output channels:
//! - **stdout**: transcription results only, one `!START` ... `!DONE` block per job
//! - **stderr**: all logging
//!
//! On SIGINT or SIGTERM the HTTP server stops first, then the service joins the
//! job in flight and destroys every loaded context.

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use whisper_pool_backend::config::AppConfig;
use whisper_pool_backend::device::DeviceManager;
use whisper_pool_backend::state::AppState;
use whisper_pool_backend::transcription::{CandleEngine, ResultStreamer, TranscriptionService};
use whisper_pool_backend::{handlers, health, middleware};

/// Set once a termination signal arrives.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting whisper-pool-backend v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);

    let preference = config.device_preference()?;
    let device = DeviceManager::get_device(preference);
    let summary = DeviceManager::get_device_summary(preference, &device);
    if summary.fell_back_to_cpu {
        warn!(preference = %summary.preference, "Requested GPU backend is not available, using CPU");
    }
    info!(
        device = %summary.current_device,
        cuda_available = summary.cuda_available,
        metal_available = summary.metal_available,
        "Compute device selected"
    );

    let service = TranscriptionService::new(
        CandleEngine::new(device),
        config.pool.capacity,
        config.context_params()?,
        ResultStreamer::stdout(),
    );
    info!(
        capacity = config.pool.capacity,
        aheads_preset = %config.engine.aheads_preset,
        "Context pool ready"
    );

    let app_state = AppState::new(config.clone(), Box::new(service), summary);
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    setup_signal_handlers();

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
            .wrap(cors)
            .wrap(TracingLogger::default())
            .wrap(middleware::MetricsMiddleware)
            .wrap(middleware::RequestLogging)
            .service(web::scope("/api/v1").configure(handlers::configure_api))
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

    // Joins the job in flight, so its output block is complete before exit
    let shutdown_state = app_state.clone();
    if let Err(e) = web::block(move || shutdown_state.with_service(|service| service.shutdown())).await {
        error!("Transcription service shutdown failed: {}", e);
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// `RUST_LOG` controls the filter. Logs go to stderr, stdout is reserved for results.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "whisper_pool_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()?;

    Ok(())
}

fn setup_signal_handlers() {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async {
        let (mut sigterm, mut sigint) = match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
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
