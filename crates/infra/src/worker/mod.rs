//! Queue processing: a single bounded pass ([`QueueProcessor`]) and the
//! periodic trigger that drives it ([`QueueRunner`]).

mod processor;
mod runner;

pub use processor::{DEFAULT_BATCH_SIZE, DEFAULT_DISPATCH_TIMEOUT, ProcessReport, QueueProcessor};
pub use runner::{QueueRunner, QueueRunnerHandle, RunnerConfig, RunnerStats};
