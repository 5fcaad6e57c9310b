//! Storage service class user coordinator.
//!
//! This crate wraps the upper layer and DIMSE crates
//! with the machinery a production store pipeline needs:
//!
//! - The [`error`] module defines the user-facing error taxonomy
//!   with categories, retryability and recovery hints.
//! - The [`retry`] module executes operations
//!   under a backoff policy with jitter.
//! - The [`breaker`] module holds one circuit breaker per endpoint.
//! - The [`bandwidth`] module shapes outbound traffic
//!   with a token bucket and scheduled configurations.
//! - The [`pool`] module owns the server pool
//!   and its selection strategies.
//! - The [`coordinator`] module performs stores with failover
//!   across the pool.
//! - The [`queue`] module provides the durable
//!   store-and-forward queue.
//! - The [`filemeta`] module extracts the routed attributes
//!   from the file meta information group.
//! - The [`config`] module declares the configuration surface.

pub mod bandwidth;
pub mod breaker;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod filemeta;
pub mod pool;
pub mod queue;
pub mod retry;

pub use breaker::CircuitBreaker;
pub use coordinator::{StorageClient, StoreReport};
pub use error::{Error, ErrorCategory, RecoveryHint};
pub use pool::{SelectionStrategy, ServerEntry, ServerPool};
pub use retry::{RetryExecutor, RetryPolicy};
