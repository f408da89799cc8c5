//! Infrastructure for the notification delivery queue: storage, admission,
//! dispatch, processing, housekeeping and configuration.
//!
//! ## Components
//!
//! - `QueueStore`: single source of truth for queue items (in-memory or Postgres)
//! - `Producer`: admits new items (single, batch, atomic batch)
//! - `ChannelDispatcher`: hands a notification to an email/push transport
//! - `QueueProcessor`: claims due items, dispatches them, applies the retry policy
//! - `QueueRunner`: periodic trigger for processing and housekeeping
//! - `Maintenance`: stats, listing, manual retry, cancellation, cleanup

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod maintenance;
pub mod producer;
pub mod store;
pub mod worker;

pub use config::{ConfigError, QueueConfig};
pub use dispatcher::{ChannelDispatcher, ChannelRouter, ChannelSender, DispatchError};
pub use error::QueueError;
pub use maintenance::{CANCELLED_MESSAGE, Maintenance};
pub use producer::Producer;
pub use store::{
    ClaimBatch, InMemoryQueueStore, Pagination, PostgresQueueStore, QueueFilter, QueuePage,
    QueueStore, StoreError,
};
pub use worker::{ProcessReport, QueueProcessor, QueueRunner, QueueRunnerHandle, RunnerConfig, RunnerStats};
