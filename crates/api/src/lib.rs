//! Operator binary for the notification queue: configuration, service wiring,
//! the periodic runner and a small HTTP surface for inspection and repair.

pub mod app;
