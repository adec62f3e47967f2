use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::idempotency::ResourceStore;

/// Key probed by the store health check; never claimed by real traffic.
pub const HEALTH_PROBE_KEY: &str = "__idempotency_health_probe__";

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const SLOW_PROBE_MS: f64 = 100.0;

/// Ordered from best to worst, so the worst of several is their maximum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }

    pub fn is_unhealthy(&self) -> bool {
        matches!(self, HealthStatus::Unhealthy)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyHealth {
    pub name: String,
    pub status: HealthStatus,
    pub latency_ms: Option<f64>,
    pub message: Option<String>,
}

impl DependencyHealth {
    /// A dependency that answered; slower than `slow_ms` counts as degraded.
    pub fn answered(name: impl Into<String>, latency_ms: f64, slow_ms: f64) -> Self {
        let slow = latency_ms > slow_ms;
        Self {
            name: name.into(),
            status: if slow { HealthStatus::Degraded } else { HealthStatus::Healthy },
            latency_ms: Some(latency_ms),
            message: slow.then(|| format!("Latency {:.1}ms above {:.0}ms", latency_ms, slow_ms)),
        }
    }

    pub fn unhealthy(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Unhealthy,
            latency_ms: None,
            message: Some(message.into()),
        }
    }
}

/// Service health, as served on `/health`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatedHealth {
    pub status: HealthStatus,
    pub version: String,
    pub uptime_seconds: u64,
    pub dependencies: Vec<DependencyHealth>,
}

impl AggregatedHealth {
    pub fn new(version: String, uptime_seconds: u64, dependencies: Vec<DependencyHealth>) -> Self {
        let status = dependencies
            .iter()
            .map(|dependency| dependency.status)
            .max()
            .unwrap_or(HealthStatus::Healthy);

        Self {
            status,
            version,
            uptime_seconds,
            dependencies,
        }
    }
}

/// Checks the resource store backing the coordinator.
pub struct HealthChecker {
    store: Arc<dyn ResourceStore>,
    backend: String,
    start_time: Instant,
}

impl HealthChecker {
    pub fn new(store: Arc<dyn ResourceStore>, backend: impl Into<String>) -> Self {
        Self {
            store,
            backend: backend.into(),
            start_time: Instant::now(),
        }
    }

    pub async fn check_all(&self) -> AggregatedHealth {
        AggregatedHealth::new(
            env!("CARGO_PKG_VERSION").to_string(),
            self.uptime_seconds(),
            vec![self.check_store().await],
        )
    }

    /// Looks up [`HEALTH_PROBE_KEY`]; found or not, an answer is healthy.
    pub async fn check_store(&self) -> DependencyHealth {
        let name = format!("idempotency_store:{}", self.backend);
        let start = Instant::now();

        match tokio::time::timeout(PROBE_TIMEOUT, self.store.find_by_idempotency_key(HEALTH_PROBE_KEY)).await {
            Ok(Ok(_)) => DependencyHealth::answered(name, start.elapsed().as_secs_f64() * 1000.0, SLOW_PROBE_MS),
            Ok(Err(e)) => DependencyHealth::unhealthy(name, format!("Lookup failed: {}", e)),
            Err(_) => DependencyHealth::unhealthy(name, "Lookup timeout"),
        }
    }

    /// A slow store is still ready.
    pub async fn is_ready(&self) -> bool {
        !self.check_store().await.status.is_unhealthy()
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
