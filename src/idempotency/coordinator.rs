use crate::error::{AppError, Result};
use crate::idempotency::capture::{CaptureHook, IdempotentResponse, ResponseWriter};
use crate::idempotency::filters::{redact_header_map, whitelist_response_headers};
use crate::idempotency::storage::ResourceStore;
use crate::idempotency::validators::{
    DefaultIntentValidator, IntentValidator, ResponseValidator, SuccessResponseValidator,
};
use crate::models::{IdempotencyResource, RequestSnapshot, ResponseSnapshot};
use crate::observability::{get_metrics, mask_key};
use bytes::Bytes;
use http::header::{HeaderName, HeaderValue};
use http::{Request, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Default header carrying the idempotency key.
pub const DEFAULT_KEY_HEADER: &str = "idempotency-key";

/// Largest request body buffered for a snapshot (2 MiB, as axum's default).
pub const DEFAULT_MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

/// In-process counters for coordinator decisions.
#[derive(Debug, Default)]
pub struct IdempotencyStats {
    pub total_requests: AtomicU64,
    pub pass_through: AtomicU64,
    pub misses: AtomicU64,
    pub hits: AtomicU64,
    pub conflicts: AtomicU64,
    pub misuses: AtomicU64,
    pub store_errors: AtomicU64,
    pub reported_errors: AtomicU64,
}

impl IdempotencyStats {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, counter: &AtomicU64, outcome: &str) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        counter.fetch_add(1, Ordering::Relaxed);
        get_metrics().record_decision(outcome);
    }

    pub fn record_pass_through(&self) {
        self.record(&self.pass_through, "pass_through");
    }

    pub fn record_miss(&self) {
        self.record(&self.misses, "miss");
    }

    pub fn record_hit(&self) {
        self.record(&self.hits, "hit");
    }

    pub fn record_conflict(&self) {
        self.record(&self.conflicts, "conflict");
    }

    pub fn record_misuse(&self) {
        self.record(&self.misuses, "misuse");
    }

    pub fn record_store_error(&self) {
        self.record(&self.store_errors, "store_error");
    }

    pub fn record_reported_error(&self) {
        self.reported_errors.fetch_add(1, Ordering::Relaxed);
        get_metrics().record_reported_error();
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            pass_through: self.pass_through.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
            misuses: self.misuses.load(Ordering::Relaxed),
            store_errors: self.store_errors.load(Ordering::Relaxed),
            reported_errors: self.reported_errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub total_requests: u64,
    pub pass_through: u64,
    pub misses: u64,
    pub hits: u64,
    pub conflicts: u64,
    pub misuses: u64,
    pub store_errors: u64,
    pub reported_errors: u64,
}

impl StatsSnapshot {
    /// Share of keyed requests answered from the store.
    pub fn hit_rate(&self) -> f64 {
        let keyed = self.total_requests - self.pass_through;
        if keyed == 0 {
            0.0
        } else {
            self.hits as f64 / keyed as f64
        }
    }
}

/// What happens after a replay has been written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayMode {
    /// Still invoke the continuation, with no error.
    #[default]
    Continue,
    /// Stop; the continuation is not invoked.
    ShortCircuit,
}

/// Coordinator options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdempotencyOptions {
    pub key_header: String,
    pub replay_mode: ReplayMode,
    pub max_body_bytes: usize,
}

impl Default for IdempotencyOptions {
    fn default() -> Self {
        Self {
            key_header: DEFAULT_KEY_HEADER.to_string(),
            replay_mode: ReplayMode::default(),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

/// Request extension recording whether the last processing was a replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HitStatus(pub bool);

/// Outcome of the key-state decision for one request.
#[derive(Debug)]
pub enum Decision {
    /// No key, or the intent validator declined.
    PassThrough,
    /// The key was claimed with this pending resource.
    Claimed(IdempotencyResource),
    /// A completed resource matched; this is the response to replay.
    Replay(Response<Bytes>),
}

/// Result of [`Coordinator::provide_middleware_function`].
pub enum MiddlewareOutcome<T, W: ResponseWriter> {
    /// The continuation ran and returned this.
    Continued(T),
    /// A replay was written to `response` and the continuation was skipped.
    Replayed { response: W, output: W::Output },
}

impl<T, W: ResponseWriter> MiddlewareOutcome<T, W> {
    pub fn continued(self) -> Option<T> {
        match self {
            MiddlewareOutcome::Continued(value) => Some(value),
            MiddlewareOutcome::Replayed { .. } => None,
        }
    }
}

/// Builder wiring the coordinator's collaborators.
#[derive(Default)]
pub struct CoordinatorBuilder {
    options: IdempotencyOptions,
    intent_validator: Option<Arc<dyn IntentValidator>>,
    data_adapter: Option<Arc<dyn ResourceStore>>,
    response_validator: Option<Arc<dyn ResponseValidator>>,
}

impl CoordinatorBuilder {
    pub fn with_options(mut self, options: IdempotencyOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_key_header(mut self, header: impl Into<String>) -> Self {
        self.options.key_header = header.into();
        self
    }

    pub fn with_replay_mode(mut self, mode: ReplayMode) -> Self {
        self.options.replay_mode = mode;
        self
    }

    pub fn with_max_body_bytes(mut self, limit: usize) -> Self {
        self.options.max_body_bytes = limit;
        self
    }

    pub fn with_intent_validator(mut self, validator: Arc<dyn IntentValidator>) -> Self {
        self.intent_validator = Some(validator);
        self
    }

    pub fn with_data_adapter(mut self, adapter: Arc<dyn ResourceStore>) -> Self {
        self.data_adapter = Some(adapter);
        self
    }

    pub fn with_response_validator(mut self, validator: Arc<dyn ResponseValidator>) -> Self {
        self.response_validator = Some(validator);
        self
    }

    pub fn build(self) -> Result<Coordinator> {
        let data_adapter = self
            .data_adapter
            .ok_or_else(|| AppError::Validation("A data adapter is required".to_string()))?;

        let key_header = self.options.key_header.trim().to_ascii_lowercase();
        HeaderName::from_bytes(key_header.as_bytes()).map_err(|_| {
            AppError::Validation(format!(
                "Invalid idempotency key header name: {:?}",
                self.options.key_header
            ))
        })?;

        Ok(Coordinator {
            options: IdempotencyOptions {
                key_header,
                replay_mode: self.options.replay_mode,
                max_body_bytes: self.options.max_body_bytes,
            },
            intent_validator: self
                .intent_validator
                .unwrap_or_else(|| Arc::new(DefaultIntentValidator)),
            data_adapter,
            response_validator: self
                .response_validator
                .unwrap_or_else(|| Arc::new(SuccessResponseValidator)),
            stats: Arc::new(IdempotencyStats::new()),
        })
    }
}

/// Decides, per request, between pass-through, replay, conflict and misuse,
/// and owns the resource lifecycle for keys it claims.
pub struct Coordinator {
    options: IdempotencyOptions,
    intent_validator: Arc<dyn IntentValidator>,
    data_adapter: Arc<dyn ResourceStore>,
    response_validator: Arc<dyn ResponseValidator>,
    stats: Arc<IdempotencyStats>,
}

impl Coordinator {
    pub fn builder() -> CoordinatorBuilder {
        CoordinatorBuilder::default()
    }

    /// Coordinator with default options and validators.
    pub fn new(data_adapter: Arc<dyn ResourceStore>) -> Self {
        Self {
            options: IdempotencyOptions::default(),
            intent_validator: Arc::new(DefaultIntentValidator),
            data_adapter,
            response_validator: Arc::new(SuccessResponseValidator),
            stats: Arc::new(IdempotencyStats::new()),
        }
    }

    pub fn options(&self) -> &IdempotencyOptions {
        &self.options
    }

    pub fn data_adapter(&self) -> Arc<dyn ResourceStore> {
        Arc::clone(&self.data_adapter)
    }

    pub fn stats(&self) -> Arc<IdempotencyStats> {
        Arc::clone(&self.stats)
    }

    /// The trimmed, non-empty key from the configured header.
    pub fn extract_idempotency_key_from_req<B>(&self, request: &Request<B>) -> Option<String> {
        request
            .headers()
            .get(self.options.key_header.as_str())
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .map(str::to_string)
    }

    /// Whether the last processing of this request object was a replay.
    pub fn is_hit<B>(&self, request: &Request<B>) -> bool {
        request
            .extensions()
            .get::<HitStatus>()
            .map_or(false, |status| status.0)
    }

    /// Releases the key of a request whose downstream processing failed.
    /// Requests without a key are ignored.
    pub async fn report_error<B>(&self, request: &Request<B>) -> Result<()> {
        let Some(key) = self.extract_idempotency_key_from_req(request) else {
            return Ok(());
        };

        self.stats.record_reported_error();
        tracing::info!(key = %mask_key(&key), "Downstream failure reported, releasing key");
        self.data_adapter.delete(&key).await
    }

    /// Runs the key-state decision. Claims the key on a miss.
    pub async fn decide(&self, request: &Request<Bytes>) -> Result<Decision> {
        let Some(key) = self.extract_idempotency_key_from_req(request) else {
            self.stats.record_pass_through();
            return Ok(Decision::PassThrough);
        };

        if !self.intent_validator.should_process(request) {
            self.stats.record_pass_through();
            return Ok(Decision::PassThrough);
        }

        let masked = mask_key(&key);
        let existing = match self.data_adapter.find_by_idempotency_key(&key).await {
            Ok(existing) => existing,
            Err(e) => {
                self.stats.record_store_error();
                tracing::error!(key = %masked, "Idempotency lookup failed: {}", e);
                return Err(e);
            }
        };

        let Some(resource) = existing else {
            return self.claim(key, request).await;
        };

        let completed = resource
            .response
            .as_ref()
            .and_then(|response| response.status().map(|status| (status, response)));

        let Some((status, cached)) = completed else {
            self.stats.record_conflict();
            tracing::info!(key = %masked, "Request conflicts with one still in progress");
            return Err(AppError::Conflict { key });
        };

        let (method, url) = (request.method().as_str(), request_url(request));
        if !resource.request.matches(method, &url) {
            self.stats.record_misuse();
            tracing::warn!(
                key = %masked,
                expected = %resource.request.signature(),
                fingerprint = %resource.request.fingerprint(),
                method,
                url = %url,
                "Idempotency key reused for a different request"
            );
            return Err(AppError::Misuse {
                key,
                expected: resource.request.signature(),
                actual: format!("{} {}", method, url),
            });
        }

        self.stats.record_hit();
        tracing::debug!(key = %masked, status = status.as_u16(), "Replaying cached response");
        Ok(Decision::Replay(restore_response(status, cached)))
    }

    async fn claim(&self, key: String, request: &Request<Bytes>) -> Result<Decision> {
        let resource = IdempotencyResource::pending(key, snapshot_request(request));

        match self.data_adapter.create(&resource).await {
            Ok(()) => {
                self.stats.record_miss();
                tracing::debug!(key = %mask_key(&resource.idempotency_key), "Claimed idempotency key");
                Ok(Decision::Claimed(resource))
            }
            Err(AppError::DuplicateKey(key)) => {
                self.stats.record_conflict();
                tracing::info!(key = %mask_key(&key), "Lost the race to claim idempotency key");
                Err(AppError::Conflict { key })
            }
            Err(e) => {
                self.stats.record_store_error();
                tracing::error!("Failed to claim idempotency key: {}", e);
                Err(e)
            }
        }
    }

    /// Middleware entry point.
    ///
    /// `next` is the continuation: it receives the decision error (if any),
    /// the request, and the response to finalize. On a hit the replay is
    /// written first; in [`ReplayMode::ShortCircuit`] `next` is then skipped.
    pub async fn provide_middleware_function<W, N, Fut>(
        &self,
        mut request: Request<Bytes>,
        mut response: W,
        next: N,
    ) -> MiddlewareOutcome<Fut::Output, W>
    where
        W: ResponseWriter,
        N: FnOnce(Option<AppError>, Request<Bytes>, IdempotentResponse<W>) -> Fut,
        Fut: Future,
    {
        let decision = self.decide(&request).await;
        let hit = matches!(decision, Ok(Decision::Replay(_)));
        request.extensions_mut().insert(HitStatus(hit));

        match decision {
            Ok(Decision::PassThrough) => MiddlewareOutcome::Continued(
                next(None, request, IdempotentResponse::PassThrough(response)).await,
            ),
            Ok(Decision::Claimed(resource)) => {
                let hook = CaptureHook::new(
                    response,
                    resource,
                    Arc::clone(&self.data_adapter),
                    Arc::clone(&self.response_validator),
                );
                MiddlewareOutcome::Continued(
                    next(None, request, IdempotentResponse::Captured(hook)).await,
                )
            }
            Ok(Decision::Replay(replay)) => {
                let output = response.finalize(replay).await;
                match self.options.replay_mode {
                    ReplayMode::ShortCircuit => MiddlewareOutcome::Replayed { response, output },
                    ReplayMode::Continue => MiddlewareOutcome::Continued(
                        next(None, request, IdempotentResponse::Replayed(response)).await,
                    ),
                }
            }
            Err(e) => MiddlewareOutcome::Continued(
                next(Some(e), request, IdempotentResponse::PassThrough(response)).await,
            ),
        }
    }
}

/// Path and query as received.
pub fn request_url<B>(request: &Request<B>) -> String {
    request
        .uri()
        .path_and_query()
        .map_or_else(|| request.uri().path().to_string(), |pq| pq.to_string())
}

/// Snapshot with sensitive headers removed.
pub fn snapshot_request(request: &Request<Bytes>) -> RequestSnapshot {
    let query = request
        .uri()
        .query()
        .and_then(|query| serde_urlencoded::from_str::<BTreeMap<String, String>>(query).ok())
        .unwrap_or_default();

    RequestSnapshot {
        method: request.method().as_str().to_string(),
        url: request_url(request),
        headers: redact_header_map(request.headers()),
        body: request.body().to_vec(),
        query,
    }
}

/// Rebuilds a cached response; headers are whitelisted again on the way out.
pub fn restore_response(status: StatusCode, cached: &ResponseSnapshot) -> Response<Bytes> {
    let mut response = Response::new(Bytes::from(cached.body.clone()));
    *response.status_mut() = status;

    let headers = cached
        .headers
        .iter()
        .map(|(name, value)| (name.as_str(), value.as_str()));
    for (name, value) in whitelist_response_headers(headers) {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            response.headers_mut().append(name, value);
        }
    }

    response
}
