//! `notiq-delivery`: the notification delivery queue domain.
//!
//! Pure types and policies, no I/O:
//!
//! - `QueueItem`: one pending delivery of a notification over one channel
//! - `RetryPolicy`: maps an attempt outcome to the item's next state
//! - `QueueStats`: per-status counters with a stable shape

pub mod item;
pub mod retry;
pub mod stats;

pub use item::{Channel, DEFAULT_MAX_ATTEMPTS, NewQueueItem, QueueItem, QueueStatus};
pub use retry::{Decision, DeliveryOutcome, RetryPolicy, Transition};
pub use stats::QueueStats;
