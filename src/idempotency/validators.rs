use bytes::Bytes;
use http::{Request, Response};

/// Decides whether a keyed request goes through idempotency handling.
pub trait IntentValidator: Send + Sync {
    fn should_process(&self, request: &Request<Bytes>) -> bool;
}

/// Decides whether a finished response becomes the canonical replay.
pub trait ResponseValidator: Send + Sync {
    fn is_valid_for_persistence(&self, response: &Response<Bytes>) -> bool;
}

/// Processes every request that carries a key.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultIntentValidator;

impl IntentValidator for DefaultIntentValidator {
    fn should_process(&self, _request: &Request<Bytes>) -> bool {
        true
    }
}

/// Persists 2xx responses only.
#[derive(Debug, Clone, Copy, Default)]
pub struct SuccessResponseValidator;

impl ResponseValidator for SuccessResponseValidator {
    fn is_valid_for_persistence(&self, response: &Response<Bytes>) -> bool {
        response.status().is_success()
    }
}

/// Restricts idempotency handling to the listed methods.
#[derive(Debug, Clone)]
pub struct MethodIntentValidator {
    methods: Vec<http::Method>,
}

impl MethodIntentValidator {
    pub fn new(methods: impl IntoIterator<Item = http::Method>) -> Self {
        Self {
            methods: methods.into_iter().collect(),
        }
    }

    /// POST and PATCH, the methods that are not idempotent by definition.
    pub fn non_idempotent() -> Self {
        Self::new([http::Method::POST, http::Method::PATCH])
    }
}

impl IntentValidator for MethodIntentValidator {
    fn should_process(&self, request: &Request<Bytes>) -> bool {
        self.methods.contains(request.method())
    }
}
