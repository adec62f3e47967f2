use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};
use uuid::Uuid;

use super::handlers;
use super::middleware::idempotency_middleware;
use super::responses::OrderResponse;
use crate::idempotency::Coordinator;
use crate::observability::HealthChecker;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<Coordinator>,
    pub health_checker: Arc<HealthChecker>,
    pub orders: Arc<RwLock<HashMap<Uuid, OrderResponse>>>,
    pub metrics_handle: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(coordinator: Arc<Coordinator>, health_checker: Arc<HealthChecker>) -> Self {
        Self {
            coordinator,
            health_checker,
            orders: Arc::default(),
            metrics_handle: None,
        }
    }

    /// Adds metrics handle to the state.
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics_handle = Some(handle);
        self
    }

    pub async fn order_count(&self) -> usize {
        self.orders.read().await.len()
    }
}

/// Creates the main API router. Only the order routes go through the
/// idempotency layer; every handler behind it must skip its side effects
/// when `HitStatus(true)` is set.
pub fn create_router(state: AppState) -> Router {
    let orders = Router::new()
        .route("/orders", post(handlers::create_order))
        .route("/orders/:id", get(handlers::get_order))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state.coordinator),
            idempotency_middleware,
        ));

    Router::new()
        // Health endpoints
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .route("/live", get(handlers::liveness_check))
        // Metrics endpoints
        .route("/metrics", get(handlers::metrics_endpoint))
        .route("/idempotency/stats", get(handlers::idempotency_stats))
        .merge(orders)
        .layer(TraceLayer::new_for_http())
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .with_state(state)
}
