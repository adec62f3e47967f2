pub mod capture;
pub mod cleanup;
pub mod coordinator;
pub mod filters;
pub mod storage;
pub mod validators;

pub use capture::{
    BufferedResponder, CaptureHook, FinalizeError, FinalizeResult, IdempotentResponse, ResponseWriter,
};
pub use cleanup::IdempotencyCleanupJob;
pub use coordinator::{
    Coordinator, CoordinatorBuilder, Decision, HitStatus, IdempotencyOptions, IdempotencyStats,
    MiddlewareOutcome, ReplayMode, StatsSnapshot, DEFAULT_KEY_HEADER, DEFAULT_MAX_BODY_BYTES,
};
pub use storage::{
    ExpiringStore, InMemoryResourceStore, PostgresResourceStore, RedisResourceStore,
    ResourceStore,
};
pub use validators::{
    DefaultIntentValidator, IntentValidator, MethodIntentValidator, ResponseValidator,
    SuccessResponseValidator,
};
