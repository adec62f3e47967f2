//! Response capture around the single finalization call of a response.

use async_trait::async_trait;
use bytes::Bytes;
use http::Response;
use std::sync::Arc;

use crate::error::{AppError, Result};
use crate::idempotency::filters::whitelist_header_map;
use crate::idempotency::storage::ResourceStore;
use crate::idempotency::validators::ResponseValidator;
use crate::models::{IdempotencyResource, ResponseSnapshot};
use crate::observability::{get_metrics, mask_key};

/// The operation that commits status, headers and body of an outgoing response.
#[async_trait]
pub trait ResponseWriter: Send {
    type Output: Send;

    async fn finalize(&mut self, response: Response<Bytes>) -> Self::Output;
}

/// A finalization that failed. `output` holds what the wrapped writer
/// returned when it ran; it is `None` only if it never ran.
#[derive(Debug)]
pub struct FinalizeError<O> {
    pub error: AppError,
    pub output: Option<O>,
}

impl<O> FinalizeError<O> {
    pub fn into_parts(self) -> (AppError, Option<O>) {
        (self.error, self.output)
    }
}

impl<O> From<AppError> for FinalizeError<O> {
    fn from(error: AppError) -> Self {
        Self { error, output: None }
    }
}

pub type FinalizeResult<O> = std::result::Result<O, FinalizeError<O>>;

/// Wraps a writer for the one request that claimed a key.
///
/// The first `finalize` captures the response, persists or discards it,
/// then delegates. Later calls delegate directly.
pub struct CaptureHook<W> {
    inner: W,
    pending: Option<IdempotencyResource>,
    store: Arc<dyn ResourceStore>,
    validator: Arc<dyn ResponseValidator>,
}

impl<W: ResponseWriter> CaptureHook<W> {
    pub(crate) fn new(
        inner: W,
        pending: IdempotencyResource,
        store: Arc<dyn ResourceStore>,
        validator: Arc<dyn ResponseValidator>,
    ) -> Self {
        Self {
            inner,
            pending: Some(pending),
            store,
            validator,
        }
    }

    pub fn has_fired(&self) -> bool {
        self.pending.is_none()
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

async fn persist(
    store: &Arc<dyn ResourceStore>,
    validator: &Arc<dyn ResponseValidator>,
    pending: IdempotencyResource,
    response: &Response<Bytes>,
) -> Result<()> {
    let key = pending.idempotency_key.clone();

    if !validator.is_valid_for_persistence(response) {
        get_metrics().record_capture("discarded");
        tracing::debug!(
            key = %mask_key(&key),
            status = response.status().as_u16(),
            "Response not eligible for replay, releasing key"
        );
        return store.delete(&key).await;
    }

    let snapshot = ResponseSnapshot::new(
        response.status(),
        whitelist_header_map(response.headers()),
        response.body().clone(),
    );

    match store.update(&pending.complete(snapshot)).await {
        Ok(()) => {
            get_metrics().record_capture("persisted");
            tracing::debug!(key = %mask_key(&key), "Captured response for replay");
            Ok(())
        }
        Err(e) => {
            get_metrics().record_capture("failed");
            tracing::error!(key = %mask_key(&key), "Failed to persist captured response: {}", e);
            let cleanup = store.delete(&key).await;
            Err(e.with_cleanup(cleanup))
        }
    }
}

#[async_trait]
impl<W: ResponseWriter> ResponseWriter for CaptureHook<W> {
    type Output = FinalizeResult<W::Output>;

    async fn finalize(&mut self, response: Response<Bytes>) -> Self::Output {
        let persisted = match self.pending.take() {
            Some(pending) => persist(&self.store, &self.validator, pending, &response).await,
            None => Ok(()),
        };

        let output = self.inner.finalize(response).await;
        match persisted {
            Ok(()) => Ok(output),
            Err(error) => Err(FinalizeError {
                error,
                output: Some(output),
            }),
        }
    }
}

/// The response handed to downstream processing.
pub enum IdempotentResponse<W> {
    /// No idempotency handling applies.
    PassThrough(W),
    /// This request claimed the key; finalizing captures the outcome.
    Captured(CaptureHook<W>),
    /// A cached response was already written.
    Replayed(W),
}

impl<W: ResponseWriter> IdempotentResponse<W> {
    pub fn is_replayed(&self) -> bool {
        matches!(self, IdempotentResponse::Replayed(_))
    }

    pub fn is_captured(&self) -> bool {
        matches!(self, IdempotentResponse::Captured(_))
    }

    pub fn into_inner(self) -> W {
        match self {
            IdempotentResponse::PassThrough(writer) | IdempotentResponse::Replayed(writer) => writer,
            IdempotentResponse::Captured(hook) => hook.into_inner(),
        }
    }
}

#[async_trait]
impl<W: ResponseWriter> ResponseWriter for IdempotentResponse<W> {
    type Output = FinalizeResult<W::Output>;

    async fn finalize(&mut self, response: Response<Bytes>) -> Self::Output {
        match self {
            IdempotentResponse::PassThrough(writer) => Ok(writer.finalize(response).await),
            IdempotentResponse::Captured(hook) => hook.finalize(response).await,
            IdempotentResponse::Replayed(_) => Err(AppError::ResponseAlreadySent.into()),
        }
    }
}

/// Writer that keeps the finalized response, for embeddings that return
/// responses by value (axum, tower).
#[derive(Debug, Default)]
pub struct BufferedResponder {
    response: Option<Response<Bytes>>,
}

impl BufferedResponder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn response(&self) -> Option<&Response<Bytes>> {
        self.response.as_ref()
    }

    pub fn take(&mut self) -> Option<Response<Bytes>> {
        self.response.take()
    }
}

#[async_trait]
impl ResponseWriter for BufferedResponder {
    type Output = http::StatusCode;

    async fn finalize(&mut self, response: Response<Bytes>) -> Self::Output {
        let status = response.status();
        self.response = Some(response);
        status
    }
}
