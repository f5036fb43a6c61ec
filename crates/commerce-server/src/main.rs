//! Transport Adapter binary: wires the `commerce_core::Orchestrator` to an
//! axum HTTP + WebSocket surface and runs it to completion or a signal.

mod api;
mod connectors;
mod reaper;

use commerce_core::{AuditLog, Config, FileCheckpointJournal, InMemoryCheckpointJournal, Orchestrator, Registry};
use connectors::SimulatedConnector;
use std::process::ExitCode;
use std::sync::Arc;

#[tokio::main]
async fn main() -> ExitCode {
    let rust_log = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt().with_env_filter(rust_log).init();

    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::error!("configuration error: {e}");
            return ExitCode::from(2);
        }
    };

    if let Err(e) = config.require_connectors() {
        tracing::error!("{e}");
        return ExitCode::from(4);
    }

    let journal: Arc<dyn commerce_core::CheckpointJournal> = match std::env::var("JOURNAL_PATH") {
        Ok(path) => match FileCheckpointJournal::open(&path) {
            Ok(journal) => {
                tracing::info!(path, "using file-backed checkpoint journal");
                Arc::new(journal)
            }
            Err(e) => {
                tracing::error!("journal unwritable: {e}");
                return ExitCode::from(3);
            }
        },
        Err(_) => {
            tracing::info!("JOURNAL_PATH unset, using in-memory checkpoint journal");
            InMemoryCheckpointJournal::shared()
        }
    };

    let registry = Registry::new();
    for id in &config.connectors {
        registry.add(Arc::new(SimulatedConnector::for_id(id)));
    }
    tracing::info!(connectors = ?config.connectors, dry_run = config.dry_run, "connectors registered");

    let audit = match std::env::var("AUDIT_LOG_PATH") {
        Ok(path) => match AuditLog::file(&path) {
            Ok(audit) => {
                tracing::info!(path, "using file-backed audit log");
                audit
            }
            Err(e) => {
                tracing::error!("audit log unwritable: {e}");
                return ExitCode::from(3);
            }
        },
        Err(_) => {
            tracing::info!("AUDIT_LOG_PATH unset, using in-memory audit log");
            AuditLog::new()
        }
    };

    let orchestrator = Arc::new(Orchestrator::new(
        config,
        journal,
        registry,
        audit,
        Arc::new(commerce_core::KeywordClassifier),
        Arc::new(commerce_core::FixedPlanner),
        Arc::new(commerce_core::StubKnowledgeLookup),
    ));

    tokio::spawn(reaper::run(orchestrator.clone()));

    let app = api::routes::create_router(orchestrator);

    let port = std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse::<u16>().ok())
        .unwrap_or(8080);
    let host = std::env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let addr = format!("{host}:{port}");

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("failed to bind {addr}: {e}");
            return ExitCode::from(1);
        }
    };

    tracing::info!("commerce-server listening on {addr}");
    if let Err(e) = axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        tracing::error!("server error: {e}");
        return ExitCode::from(1);
    }

    tracing::info!("commerce-server shut down gracefully");
    ExitCode::SUCCESS
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install CTRL-C signal handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received CTRL-C, shutting down"),
        _ = terminate => tracing::info!("received SIGTERM, shutting down"),
    }
}
