pub mod api;
pub mod config;
pub mod error;
pub mod idempotency;
pub mod models;
pub mod observability;
