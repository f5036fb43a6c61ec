//! API route definitions (§6).

use crate::api::{handlers, middleware, ws};
use axum::routing::{get, post};
use axum::Router;
use commerce_core::Orchestrator;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
}

pub fn create_router(orchestrator: Arc<Orchestrator>) -> Router {
    let state = AppState { orchestrator };

    Router::new()
        .route("/api/chat/process", post(handlers::process))
        .route("/api/order/confirm", post(handlers::confirm))
        .route("/api/order/otp", post(handlers::submit_otp))
        .route("/api/cancel", post(handlers::cancel))
        .route("/api/session/:id", get(handlers::get_session))
        .route("/api/health", get(handlers::health))
        .route("/ws/events/:session_id", get(ws::ws_handler))
        .layer(middleware::logging::logging_layer())
        .layer(middleware::cors::cors_layer())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use commerce_core::{AuditLog, Config, InMemoryCheckpointJournal, Registry};

    #[test]
    fn router_builds_without_panicking() {
        let orchestrator = Arc::new(Orchestrator::new(
            Config::default(),
            InMemoryCheckpointJournal::shared(),
            Registry::new(),
            AuditLog::new(),
            Arc::new(commerce_core::KeywordClassifier),
            Arc::new(commerce_core::FixedPlanner),
            Arc::new(commerce_core::StubKnowledgeLookup),
        ));
        let _router = create_router(orchestrator);
    }
}
