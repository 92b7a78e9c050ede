//! # Core Engine Module
//!
//! The relay engine proper:
//!
//! - **`value`**: the reading type every component exchanges.
//! - **`source`**: the `LiveSource` contract and the single exclusive lock
//!   (`SharedSource`) every access goes through.
//! - **`worker`** / **`dispatcher`**: plugin-style callback workers with
//!   two-slot mailboxes and the non-blocking fan-out that feeds them.
//! - **`session`** / **`registry`**: subscription sessions, the synchronized
//!   refresh algorithm and the process-wide `SessionCache`.
//! - **`scheduler`**: the tick loop driving the source and the dispatcher.

pub mod dispatcher;
pub mod registry;
pub mod scheduler;
pub mod session;
pub mod source;
pub mod value;
pub mod worker;

// --- Public API Re-exports ---
pub use dispatcher::{CallbackDispatcher, DispatchReport};
pub use registry::SessionCache;
pub use scheduler::{CycleOutcome, CycleState, OperationMode, SchedulerConfig, TickScheduler};
pub use session::{
    Diff, ItemSpec, RefreshOutcome, SubscriptionGroup, SubscriptionItem, SubscriptionRequest,
    SubscriptionSession,
};
pub use source::{LiveSource, QueryRequest, SharedSource, SourceError, TickPoll};
pub use value::{SnapshotId, Value, ValueState, ValueView};
pub use worker::{handler_fn, CallbackWorker, Delivery, Tick, TickHandler, WorkerStats, MAILBOX_CAPACITY};
