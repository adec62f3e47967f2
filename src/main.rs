use idempotency_engine::api::{create_router, AppState};
use idempotency_engine::config::{Settings, StoreBackend};
use idempotency_engine::idempotency::{
    Coordinator, ExpiringStore, IdempotencyCleanupJob, InMemoryResourceStore,
    PostgresResourceStore, RedisResourceStore, ResourceStore,
};
use idempotency_engine::observability::{init_logging, init_metrics, HealthChecker, LogConfig};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let settings = Settings::new()?;

    // Initialize logging
    init_logging(&LogConfig::from_settings(
        &settings.application.log_level,
        &settings.application.log_format,
    ));
    info!("Configuration loaded");

    let metrics_handle = init_metrics()?;
    let idem = &settings.idempotency;

    let (store, expiring) = match idem.backend {
        StoreBackend::Memory => {
            info!("Using in-memory idempotency store");
            let store = Arc::new(InMemoryResourceStore::with_ttl(idem.ttl_seconds));
            (store.clone() as Arc<dyn ResourceStore>, Some(store as Arc<dyn ExpiringStore>))
        }
        StoreBackend::Redis => {
            info!("Connecting to Redis at {}...", settings.redis.url);
            let client = redis::Client::open(settings.redis.url.as_str())?;
            let mut con = client.get_multiplexed_async_connection().await?;
            let _: () = redis::cmd("PING").query_async(&mut con).await?;
            info!("Redis connection established");
            let store = RedisResourceStore::new(client, &settings.redis.key_prefix, idem.ttl_seconds);
            // Redis expires keys on its own.
            (Arc::new(store) as Arc<dyn ResourceStore>, None)
        }
        StoreBackend::Postgres => {
            info!("Connecting to database...");
            let pool = PgPoolOptions::new()
                .max_connections(settings.database.pool_size)
                .acquire_timeout(Duration::from_secs(5))
                .connect(&settings.database.url)
                .await?;
            let store = Arc::new(PostgresResourceStore::new(pool, idem.ttl_seconds));
            store.migrate().await?;
            info!("Database connection established, migrations applied");
            (store.clone() as Arc<dyn ResourceStore>, Some(store as Arc<dyn ExpiringStore>))
        }
    };

    if let Some(expiring) = expiring {
        IdempotencyCleanupJob::new(expiring, idem.cleanup_interval_seconds).start();
    }

    let coordinator = Arc::new(
        Coordinator::builder()
            .with_options(idem.options())
            .with_data_adapter(Arc::clone(&store))
            .build()?,
    );
    let backend = format!("{:?}", idem.backend).to_lowercase();
    let health_checker = Arc::new(HealthChecker::new(store, backend));

    let state = AppState::new(coordinator, health_checker).with_metrics(metrics_handle);
    let app = create_router(state);

    let addr = format!("{}:{}", settings.application.host, settings.application.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Listening on {}", addr);
    axum::serve(listener, app).await?;

    Ok(())
}
