pub mod idempotency_resource;

pub use idempotency_resource::{
    HeaderList, IdempotencyResource, RequestSnapshot, ResourceState, ResponseSnapshot,
};
