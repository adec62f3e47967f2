use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Extension, Json,
};
use uuid::Uuid;

use crate::api::requests::CreateOrderRequest;
use crate::api::responses::{
    ApiResponse, ErrorResponse, HealthResponse, OrderResponse, StatsResponse,
};
use crate::error::AppError;
use crate::idempotency::HitStatus;

use super::routes::AppState;

/// Health check endpoint.
pub async fn health_check(State(state): State<AppState>) -> Json<ApiResponse<HealthResponse>> {
    let health = state.health_checker.check_all().await;

    Json(ApiResponse::success(HealthResponse {
        timestamp: chrono::Utc::now(),
        health,
    }))
}

/// Readiness check endpoint.
pub async fn readiness_check(State(state): State<AppState>) -> StatusCode {
    if state.health_checker.is_ready().await {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// Liveness check endpoint.
pub async fn liveness_check() -> StatusCode {
    StatusCode::OK
}

/// Prometheus scrape endpoint.
pub async fn metrics_endpoint(State(state): State<AppState>) -> Response {
    match &state.metrics_handle {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Coordinator counters.
pub async fn idempotency_stats(State(state): State<AppState>) -> Json<ApiResponse<StatsResponse>> {
    let stats = state.coordinator.stats().snapshot();
    Json(ApiResponse::success(StatsResponse::from(stats)))
}

// ============================================================================
// Order Handlers
// ============================================================================

/// Place an order. Replays are answered by the idempotency layer, so a hit
/// must not create a second order.
pub async fn create_order(
    State(state): State<AppState>,
    hit: Option<Extension<HitStatus>>,
    Json(request): Json<CreateOrderRequest>,
) -> Result<Response, AppError> {
    if matches!(hit, Some(Extension(HitStatus(true)))) {
        return Ok(StatusCode::NO_CONTENT.into_response());
    }

    if let Some(details) = request.validation_errors() {
        return Ok((
            StatusCode::BAD_REQUEST,
            Json(ApiResponse::<()>::error(
                ErrorResponse::new("VALIDATION_ERROR", "Request validation failed")
                    .with_details(details),
            )),
        )
            .into_response());
    }

    let order = OrderResponse {
        id: Uuid::new_v4(),
        item: request.item,
        quantity: request.quantity,
        created_at: chrono::Utc::now(),
    };
    state.orders.write().await.insert(order.id, order.clone());
    tracing::info!(order_id = %order.id, "Order created");

    Ok((
        StatusCode::CREATED,
        [(header::LOCATION, format!("/orders/{}", order.id))],
        Json(ApiResponse::success(order)),
    )
        .into_response())
}

/// Get order by ID.
pub async fn get_order(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<OrderResponse>>, AppError> {
    let orders = state.orders.read().await;
    match orders.get(&id) {
        Some(order) => Ok(Json(ApiResponse::success(order.clone()))),
        None => Err(AppError::NotFound(format!("Order {} not found", id))),
    }
}
