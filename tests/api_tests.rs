mod common;

use axum::body::{to_bytes, Body};
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use idempotency_engine::api::responses::{ApiResponse, ErrorResponse, OrderResponse};
use idempotency_engine::api::{create_router, AppState, REPLAYED_HEADER};
use idempotency_engine::idempotency::{Coordinator, InMemoryResourceStore};
use idempotency_engine::observability::HealthChecker;
use std::sync::Arc;
use tower::ServiceExt;

fn setup_app() -> (Router, AppState, Arc<Coordinator>) {
    let store = Arc::new(InMemoryResourceStore::new());
    let coordinator = Arc::new(Coordinator::new(store.clone()));
    let health_checker = Arc::new(HealthChecker::new(store, "memory"));
    let state = AppState::new(Arc::clone(&coordinator), health_checker);
    (create_router(state.clone()), state, coordinator)
}

fn order_request(uri: &str, key: Option<&str>, body: &str) -> Request<Body> {
    let mut builder = Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(key) = key {
        builder = builder.header(common::KEY_HEADER, key);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

async fn body_json<T: serde::de::DeserializeOwned>(response: axum::response::Response) -> T {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_api_response_success_serialization() {
    let response: ApiResponse<String> = ApiResponse::success("test data".to_string());
    let json = serde_json::to_string(&response).unwrap();
    assert!(json.contains("\"success\":true"));
    assert!(json.contains("\"data\":\"test data\""));
}

#[tokio::test]
async fn test_api_response_error_serialization() {
    let error = ErrorResponse::new("IDEMPOTENCY_CONFLICT", "still in progress");
    let response: ApiResponse<()> = ApiResponse::<()>::error(error);
    let json = serde_json::to_string(&response).unwrap();
    assert!(json.contains("\"success\":false"));
    assert!(json.contains("\"code\":\"IDEMPOTENCY_CONFLICT\""));
}

#[tokio::test]
async fn test_retried_order_is_replayed() {
    let (app, state, _) = setup_app();
    let body = r#"{"item":"book","quantity":2}"#;

    let first = app
        .clone()
        .oneshot(order_request("/orders", Some("K1"), body))
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::CREATED);
    assert!(first.headers().get(REPLAYED_HEADER).is_none());
    let location = first.headers().get(header::LOCATION).cloned().unwrap();
    let created: ApiResponse<OrderResponse> = body_json(first).await;

    let second = app
        .oneshot(order_request("/orders", Some("K1"), body))
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::CREATED);
    assert_eq!(second.headers().get(REPLAYED_HEADER).unwrap(), "true");
    assert_eq!(second.headers().get(header::LOCATION), Some(&location));
    let replayed: ApiResponse<OrderResponse> = body_json(second).await;

    assert_eq!(replayed.data, created.data);
    assert_eq!(state.order_count().await, 1);
}

#[tokio::test]
async fn test_requests_without_key_are_not_deduplicated() {
    let (app, state, _) = setup_app();
    let body = r#"{"item":"book","quantity":1}"#;

    for _ in 0..2 {
        let response = app
            .clone()
            .oneshot(order_request("/orders", None, body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
    }

    assert_eq!(state.order_count().await, 2);
}

#[tokio::test]
async fn test_key_reused_on_other_url_is_rejected() {
    let (app, _, _) = setup_app();
    let body = r#"{"item":"book","quantity":1}"#;

    app.clone()
        .oneshot(order_request("/orders", Some("K1"), body))
        .await
        .unwrap();

    let response = app
        .oneshot(order_request("/orders?express=true", Some("K1"), body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let error: ApiResponse<()> = body_json(response).await;
    assert_eq!(error.error.unwrap().code, "IDEMPOTENCY_KEY_MISUSE");
}

#[tokio::test]
async fn test_in_flight_key_is_conflict() {
    let (app, state, coordinator) = setup_app();

    // Claim the key as if another request were still being handled.
    let in_flight = common::request(Method::POST, "/orders", Some("K1"), "");
    coordinator.decide(&in_flight).await.unwrap();

    let response = app
        .oneshot(order_request("/orders", Some("K1"), r#"{"item":"book","quantity":1}"#))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
    let error: ApiResponse<()> = body_json(response).await;
    assert_eq!(error.error.unwrap().code, "IDEMPOTENCY_CONFLICT");
    assert_eq!(state.order_count().await, 0);
}

#[tokio::test]
async fn test_failed_attempt_can_be_retried() {
    let (app, state, _) = setup_app();

    let rejected = app
        .clone()
        .oneshot(order_request("/orders", Some("K1"), r#"{"item":"","quantity":0}"#))
        .await
        .unwrap();
    assert_eq!(rejected.status(), StatusCode::BAD_REQUEST);

    let accepted = app
        .oneshot(order_request("/orders", Some("K1"), r#"{"item":"book","quantity":1}"#))
        .await
        .unwrap();
    assert_eq!(accepted.status(), StatusCode::CREATED);
    assert!(accepted.headers().get(REPLAYED_HEADER).is_none());
    assert_eq!(state.order_count().await, 1);
}

#[tokio::test]
async fn test_get_order_round_trip() {
    let (app, _, _) = setup_app();

    let created = app
        .clone()
        .oneshot(order_request("/orders", None, r#"{"item":"pen","quantity":3}"#))
        .await
        .unwrap();
    let location = created.headers()[header::LOCATION].to_str().unwrap().to_string();

    let fetched = app
        .clone()
        .oneshot(Request::get(location.as_str()).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(fetched.status(), StatusCode::OK);
    let order: ApiResponse<OrderResponse> = body_json(fetched).await;
    assert_eq!(order.data.unwrap().item, "pen");

    let missing = app
        .oneshot(
            Request::get(format!("/orders/{}", uuid::Uuid::new_v4()))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_health_endpoints() {
    let (app, _, _) = setup_app();

    let health = app
        .clone()
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(health.status(), StatusCode::OK);
    assert!(health.headers().contains_key("x-request-id"));

    let live = app
        .clone()
        .oneshot(Request::get("/live").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(live.status(), StatusCode::OK);

    let ready = app
        .clone()
        .oneshot(Request::get("/ready").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(ready.status(), StatusCode::OK);

    // No exporter installed in this state.
    let metrics = app
        .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(metrics.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_stats_endpoint_counts_replays() {
    let (app, _, _) = setup_app();
    let body = r#"{"item":"book","quantity":1}"#;

    for _ in 0..3 {
        app.clone()
            .oneshot(order_request("/orders", Some("K1"), body))
            .await
            .unwrap();
    }

    let response = app
        .oneshot(Request::get("/idempotency/stats").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let stats: serde_json::Value = body_json(response).await;
    assert_eq!(stats["data"]["misses"], 1);
    assert_eq!(stats["data"]["hits"], 2);
}

#[tokio::test]
async fn test_oversized_body_is_rejected_before_claiming() {
    let store = Arc::new(InMemoryResourceStore::new());
    let coordinator = Arc::new(
        Coordinator::builder()
            .with_data_adapter(store.clone())
            .with_max_body_bytes(16)
            .build()
            .unwrap(),
    );
    let health_checker = Arc::new(HealthChecker::new(store.clone(), "memory"));
    let state = AppState::new(coordinator, health_checker);
    let app = create_router(state.clone());

    let response = app
        .oneshot(order_request("/orders", Some("K1"), &"x".repeat(64)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    let body: ApiResponse<()> = body_json(response).await;
    assert_eq!(body.error.unwrap().code, "PAYLOAD_TOO_LARGE");

    assert!(store.is_empty().await);
    assert_eq!(state.order_count().await, 0);
}
