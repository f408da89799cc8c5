//! Queue store boundary.
//!
//! The store is the only shared mutable resource of the queue. Every state
//! change a worker makes goes through a conditional update, so concurrent
//! workers never process the same item twice.

pub mod in_memory;
pub mod postgres;
pub mod query;
pub mod r#trait;

pub use in_memory::InMemoryQueueStore;
pub use postgres::PostgresQueueStore;
pub use query::{Pagination, QueueFilter, QueuePage};
pub use r#trait::{ClaimBatch, QueueStore, StoreError};
