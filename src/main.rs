use clap::{Parser, ValueEnum};
use dotenvy::dotenv;
use gallery_storage::config::StorageConfig;
use gallery_storage::infrastructure::{database, storage};
use gallery_storage::{AppState, create_app};
use std::net::SocketAddr;
use tokio::signal;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// HTTP API only; archives are generated by a separate worker process
    Api,
    /// Archive workers and sweeper only
    Worker,
    /// Everything in one process
    All,
}

#[derive(Parser, Debug)]
#[command(name = "gallery-storage", version, about = "Photo gallery file storage and archive delivery")]
struct Cli {
    #[arg(long, value_enum, default_value_t = Mode::All, env = "APP_MODE")]
    mode: Mode,

    #[arg(long, default_value_t = 3000, env = "PORT")]
    port: u16,

    #[arg(long, default_value = "127.0.0.1", env = "BIND_ADDRESS")]
    host: std::net::IpAddr,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    // Initialize tracing with EnvFilter
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gallery_storage=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    info!("🚀 Starting Gallery Storage ({:?} mode)...", cli.mode);

    let config = StorageConfig::from_env();
    info!(
        "⚙️  Storage Config: Chunk Threshold={}MB, Chunk Size={}KB, Archive Limit={}GB, Archive Expiry={}d, Workers={}",
        config.large_file_threshold / 1024 / 1024,
        config.chunk_size / 1024,
        config.archive_max_size / 1024 / 1024 / 1024,
        config.archive_expiration_days,
        config.archive_workers
    );

    // Setup Infrastructure
    let db = database::setup_database().await?;
    let blobs = storage::setup_storage(&config).await?;

    let (state, job_receiver) = AppState::new(db, blobs, config);

    // Setup Shutdown Channel
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let mut background: Vec<JoinHandle<()>> = Vec::new();
    if cli.mode != Mode::Api {
        let pool = state.archive_pool(job_receiver, shutdown_rx.clone());
        background.push(tokio::spawn(pool.run()));

        let sweeper = state.sweeper(shutdown_rx.clone());
        background.push(tokio::spawn(sweeper.run()));
    } else {
        drop(job_receiver);
    }

    if cli.mode == Mode::Worker {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    } else {
        let app = create_app(state).layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &axum::http::Request<_>| {
                    let request_id = request
                        .headers()
                        .get("x-request-id")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("unknown");
                    tracing::info_span!(
                        "http_request",
                        method = %request.method(),
                        uri = %request.uri(),
                        request_id = %request_id,
                    )
                })
                .on_request(|request: &axum::http::Request<_>, _span: &tracing::Span| {
                    info!("📥 {} {}", request.method(), request.uri());
                })
                .on_response(
                    |response: &axum::http::Response<_>,
                     latency: std::time::Duration,
                     _span: &tracing::Span| {
                        info!(
                            "📤 Finished in {:?} with status {}",
                            latency,
                            response.status()
                        );
                    },
                ),
        );

        let addr = SocketAddr::from((cli.host, cli.port));
        info!("✅ Server ready at http://{}", addr);
        info!("📖 Swagger UI: http://{}/swagger-ui", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown_signal().await;
                let _ = shutdown_tx.send(true);
            })
            .await?;
    }

    for handle in background {
        if let Err(e) = handle.await {
            tracing::error!("Background task ended abnormally: {}", e);
        }
    }

    info!("🛑 Server shut down gracefully.");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("⌨️  Ctrl+C received, starting graceful shutdown...");
        },
        _ = terminate => {
            info!("💤 SIGTERM received, starting graceful shutdown...");
        },
    }
}
