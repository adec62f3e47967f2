use axum::{
    body::Body,
    extract::{MatchedPath, Request, State},
    http::HeaderValue,
    middleware::Next,
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use http_body_util::{BodyExt, LengthLimitError, Limited};
use std::sync::Arc;

use crate::error::AppError;
use crate::idempotency::{
    BufferedResponder, Coordinator, MiddlewareOutcome, ResponseWriter,
};
use crate::observability::{get_metrics, LatencyTimer};

/// Header set on responses served from the store.
pub const REPLAYED_HEADER: &str = "x-idempotent-replayed";

/// Axum middleware running every request through the coordinator.
///
/// With [`ReplayMode::Continue`](crate::idempotency::ReplayMode) the handler
/// still runs on a replay and its response is discarded. Handlers with side
/// effects must check [`HitStatus`](crate::idempotency::HitStatus) in the
/// request extensions, or the coordinator must use `ReplayMode::ShortCircuit`.
///
/// ```ignore
/// let app = Router::new()
///     .route("/orders", post(create_order))
///     .layer(middleware::from_fn_with_state(coordinator, idempotency_middleware));
/// ```
pub async fn idempotency_middleware(
    State(coordinator): State<Arc<Coordinator>>,
    request: Request,
    next: Next,
) -> Response {
    let timer = LatencyTimer::new();
    let method = request.method().to_string();
    let path = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| request.uri().path().to_string(), |p| p.as_str().to_string());

    let response = coordinate(coordinator, request, next).await;

    get_metrics().record_http_request(&method, &path, response.status().as_u16(), timer.elapsed_ms());
    response
}

async fn coordinate(coordinator: Arc<Coordinator>, request: Request, next: Next) -> Response {
    let limit = coordinator.options().max_body_bytes;
    let (parts, body) = request.into_parts();
    let bytes = match Limited::new(body, limit).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) if e.is::<LengthLimitError>() => {
            return AppError::PayloadTooLarge { limit }.into_response()
        }
        Err(e) => {
            return AppError::Validation(format!("Failed to read request body: {}", e))
                .into_response()
        }
    };
    let request = http::Request::from_parts(parts, bytes);

    let outcome = coordinator
        .provide_middleware_function(request, BufferedResponder::new(), |error, request, mut response| {
            let coordinator = Arc::clone(&coordinator);
            async move {
                if let Some(error) = error {
                    return error.into_response();
                }

                // Keep the headers so a failure can still be reported after
                // the request has moved downstream.
                let mut reported = http::Request::new(());
                *reported.headers_mut() = request.headers().clone();

                let downstream = next.run(request.map(Body::from)).await;
                let downstream = match buffer_response(downstream).await {
                    Ok(downstream) => downstream,
                    // Only the request that claimed the key may release it.
                    Err(e) if response.is_captured() => {
                        let cleanup = coordinator.report_error(&reported).await;
                        return e.with_cleanup(cleanup).into_response();
                    }
                    Err(e) => return e.into_response(),
                };

                let replayed = response.is_replayed();
                if let Err(failure) = response.finalize(downstream).await {
                    match failure.error {
                        AppError::ResponseAlreadySent => {
                            tracing::debug!("Discarding downstream response, replay already sent");
                        }
                        e => return e.into_response(),
                    }
                }

                match response.into_inner().take() {
                    Some(finalized) => into_axum_response(finalized, replayed),
                    None => AppError::Internal(anyhow::anyhow!("No response was finalized"))
                        .into_response(),
                }
            }
        })
        .await;

    match outcome {
        MiddlewareOutcome::Continued(response) => response,
        MiddlewareOutcome::Replayed { mut response, .. } => match response.take() {
            Some(replay) => into_axum_response(replay, true),
            None => AppError::Internal(anyhow::anyhow!("Replay was not written")).into_response(),
        },
    }
}

async fn buffer_response(response: Response) -> Result<http::Response<Bytes>, AppError> {
    let (parts, body) = response.into_parts();
    let bytes = body
        .collect()
        .await
        .map_err(|e| AppError::Internal(anyhow::anyhow!("Failed to read response body: {}", e)))?
        .to_bytes();
    Ok(http::Response::from_parts(parts, bytes))
}

fn into_axum_response(response: http::Response<Bytes>, replayed: bool) -> Response {
    let mut response = response.map(Body::from);
    if replayed {
        response
            .headers_mut()
            .insert(REPLAYED_HEADER, HeaderValue::from_static("true"));
    }
    response
}
