pub mod logging;
pub mod metrics;
pub mod health;

pub use self::logging::{init_logging, mask_key, mask_sensitive, LogConfig, LogFormat};
pub use self::metrics::{init_metrics, get_metrics, Metrics, LatencyTimer, METRICS};
pub use self::health::{HealthChecker, HealthStatus, DependencyHealth, AggregatedHealth, HEALTH_PROBE_KEY};
