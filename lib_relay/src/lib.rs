//! # lib_relay
//!
//! Building blocks for relaying live sim-racing telemetry to many consumers.
//!
//! - **`core`**: values, the `LiveSource` contract, the per-session cache with
//!   its staleness-driven refresh, the callback workers fed on every tick and
//!   the scheduler that drives them.
//! - **`sources`**: concrete `LiveSource` implementations (live feed, recorded
//!   playback) plus the path registry and unit conversion they share.
//! - **`transports`**: pull / push-on-demand / push-continuous adapters that turn
//!   session diffs into wire payloads.
//! - **`loggers`**: console + rolling file logging bootstrap.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

pub mod core;
pub mod sources;
pub mod transports;

#[cfg(feature = "loggers")]
pub mod loggers;

// Re-export the types most callers need.
pub use crate::core::{
    CallbackDispatcher, CallbackWorker, Diff, LiveSource, OperationMode, QueryRequest, SessionCache,
    SharedSource, SnapshotId, SourceError, SubscriptionRequest, Tick, TickHandler, TickScheduler,
    Value, ValueState,
};
