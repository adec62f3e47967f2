use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use http::StatusCode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Ordered header list; duplicates are kept so replays stay exact.
pub type HeaderList = Vec<(String, String)>;

/// Snapshot of the first request seen for a key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestSnapshot {
    pub method: String,
    pub url: String,
    pub headers: HeaderList,
    #[serde(with = "hex_body")]
    pub body: Vec<u8>,
    pub query: BTreeMap<String, String>,
}

impl RequestSnapshot {
    /// `METHOD url`, as used in misuse reports.
    pub fn signature(&self) -> String {
        format!("{} {}", self.method, self.url)
    }

    /// True if method and URL both match.
    pub fn matches(&self, method: &str, url: &str) -> bool {
        self.method.eq_ignore_ascii_case(method) && self.url == url
    }

    /// SHA-256 over method, url and body.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.method.as_bytes());
        hasher.update(b"|");
        hasher.update(self.url.as_bytes());
        hasher.update(b"|");
        hasher.update(&self.body);
        hex::encode(hasher.finalize())
    }
}

/// Captured outcome. `status_code` stays optional so that records written by
/// other processes (or corrupted) decode instead of failing the lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseSnapshot {
    #[serde(default)]
    pub status_code: Option<u16>,
    #[serde(default)]
    pub headers: HeaderList,
    #[serde(default, with = "hex_body")]
    pub body: Vec<u8>,
}

impl ResponseSnapshot {
    pub fn new(status: StatusCode, headers: HeaderList, body: Bytes) -> Self {
        Self {
            status_code: Some(status.as_u16()),
            headers,
            body: body.to_vec(),
        }
    }

    /// The stored status, if it is a valid HTTP status code.
    pub fn status(&self) -> Option<StatusCode> {
        self.status_code
            .and_then(|code| StatusCode::from_u16(code).ok())
    }
}

/// Lifecycle state derived from the stored response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceState {
    Pending,
    Completed,
}

/// One persisted idempotency record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyResource {
    pub idempotency_key: String,
    pub request: RequestSnapshot,
    #[serde(default)]
    pub response: Option<ResponseSnapshot>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl IdempotencyResource {
    /// A fresh pending resource.
    pub fn pending(idempotency_key: impl Into<String>, request: RequestSnapshot) -> Self {
        Self {
            idempotency_key: idempotency_key.into(),
            request,
            response: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Returns the resource with `response` attached.
    pub fn complete(mut self, response: ResponseSnapshot) -> Self {
        self.response = Some(response);
        self.completed_at = Some(Utc::now());
        self
    }

    /// Completed only when a valid status code was captured; anything else,
    /// malformed records included, counts as pending.
    pub fn state(&self) -> ResourceState {
        match self.response.as_ref().and_then(ResponseSnapshot::status) {
            Some(_) => ResourceState::Completed,
            None => ResourceState::Pending,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.state() == ResourceState::Pending
    }

    pub fn is_completed(&self) -> bool {
        self.state() == ResourceState::Completed
    }

    pub fn expires_at(&self, ttl_seconds: i64) -> DateTime<Utc> {
        self.created_at + Duration::seconds(ttl_seconds)
    }
}

/// Serializes byte bodies as hex strings.
mod hex_body {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        hex::decode(encoded).map_err(serde::de::Error::custom)
    }
}
