//! NLP Trigger
//!
//! Receives document change events, detects the `status -> scraper_ok`
//! transition, audits each invocation and calls the NLP service.
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `API_NLP_SERVICE_URL` | - | NLP service base URL (required) |
//! | `NT_CONFIG_PATH` | - | Optional TOML config file |
//! | `PORT` / `NT_PORT` | `8080` | HTTP port |
//! | `NT_AUDIT_BACKEND` | `mongo` | Audit store: `mongo`, `memory` |
//! | `NT_MONGO_URI` | `mongodb://localhost:27017` | MongoDB connection URI |
//! | `NT_AUTH_PROVIDER` | `auto` | Token provider: `auto`, `metadata`, `service-account`, `static` |
//! | `NT_SOURCE_MODE` | `push` | Event source: `push`, `change-stream` |
//! | `NT_LOG_FORMAT` | `text` | `json` for structured log output |
//! | `RUST_LOG` | `info` | Log level |

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use nt_api::{create_router, AppState};
use nt_config::{AuditBackendKind, RelayConfig, SourceMode};
use nt_relay::{
    create_provider, AuditBackend, AuditLogger, AuditStore, HttpDispatcher, HttpDispatcherConfig,
    InMemoryAuditStore, MongoAuditStore, RelayHandler,
};
use nt_stream::{ChangeSource, MongoChangeSource, MongoCheckpointStore, StreamConfig};

/// Extra drain time beyond the longest dispatch
const SHUTDOWN_GRACE_SECS: u64 = 30;

fn init_logging() {
    let filter = EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into());

    if std::env::var("NT_LOG_FORMAT").map(|v| v == "json").unwrap_or(false) {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    info!("Starting NLP Trigger");

    let config = RelayConfig::load()?;
    info!(
        url = %config.nlp_service_url,
        audit = ?config.audit.backend,
        auth = ?config.auth.provider,
        source = ?config.source.mode,
        "Configuration loaded"
    );

    // Setup shutdown signal
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let metrics = match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!("Prometheus recorder not installed: {}", e);
            None
        }
    };

    let (audit, mongo_client) = init_audit_backend(&config).await;

    let tokens = create_provider(&config.auth)?;
    info!("Token provider initialized ({})", tokens.name());

    let dispatcher = HttpDispatcher::new(HttpDispatcherConfig::new(
        config.nlp_service_url.clone(),
        &config.dispatch,
    ))?;

    let handler = Arc::new(RelayHandler::new(
        audit,
        tokens,
        Arc::new(dispatcher),
        config.nlp_service_url.clone(),
    ));

    // Start change-stream source
    let stream_handle = match (config.source.mode, mongo_client) {
        (SourceMode::ChangeStream, Some(client)) => {
            let checkpoints = Arc::new(MongoCheckpointStore::new(
                &client,
                &config.audit.database,
                &config.source.checkpoint_collection,
            ));
            let source = MongoChangeSource::new(
                client,
                StreamConfig::from_source(&config.source),
                handler.clone(),
                checkpoints,
            );
            let shutdown_rx = shutdown_tx.subscribe();
            Some(tokio::spawn(async move {
                if let Err(e) = source.watch(shutdown_rx).await {
                    error!("Change stream source stopped: {}", e);
                }
            }))
        }
        (SourceMode::ChangeStream, None) => {
            error!("CRITICAL: change-stream source requires a reachable MongoDB, source not started");
            None
        }
        (SourceMode::Push, _) => None,
    };

    // Start HTTP server
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    let app = create_router(AppState {
        handler,
        metrics,
    });

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("HTTP server listening on http://{}", addr);

    let server_handle = {
        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.recv().await;
                })
                .await
                .ok();
        })
    };

    info!("NLP Trigger started");

    // Wait for shutdown
    shutdown_signal().await;
    info!("Shutdown signal received...");

    let _ = shutdown_tx.send(());

    // In-flight invocations run to their audited end, so the drain must outlast a dispatch
    let drain = Duration::from_secs(
        config.dispatch.connect_timeout_secs + config.dispatch.request_timeout_secs + SHUTDOWN_GRACE_SECS,
    );
    let drained = tokio::time::timeout(drain, async {
        let _ = server_handle.await;
        if let Some(handle) = stream_handle {
            let _ = handle.await;
        }
    }).await;
    if drained.is_err() {
        warn!("Shutdown drain timed out after {}s", drain.as_secs());
    }

    info!("NLP Trigger shutdown complete");
    Ok(())
}

/// Connect the audit store once at startup.
///
/// A failure does not stop the process: it keeps serving, reports NOT_READY
/// and aborts every invocation until restarted.
async fn init_audit_backend(config: &RelayConfig) -> (AuditBackend, Option<mongodb::Client>) {
    match config.audit.backend {
        AuditBackendKind::Memory => {
            warn!("Using in-memory audit store, records are not persisted");
            let store = Arc::new(InMemoryAuditStore::new());
            (AuditBackend::Ready(AuditLogger::new(store)), None)
        }
        AuditBackendKind::Mongo => match connect_mongo(config).await {
            Ok((store, client)) => {
                info!(
                    "Audit store initialized: {}/{}",
                    config.audit.database, config.audit.collection
                );
                (AuditBackend::Ready(AuditLogger::new(store)), Some(client))
            }
            Err(e) => {
                error!("CRITICAL: failed to initialize audit store: {}", e);
                (AuditBackend::Unavailable(e.to_string()), None)
            }
        },
    }
}

async fn connect_mongo(config: &RelayConfig) -> Result<(Arc<MongoAuditStore>, mongodb::Client)> {
    let client = mongodb::Client::with_uri_str(&config.audit.mongo_uri).await?;
    let store = MongoAuditStore::new(&client, &config.audit.database, &config.audit.collection);
    store.ping().await?;
    Ok((Arc::new(store), client))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
