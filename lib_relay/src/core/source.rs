//! # Live Source Contract
//!
//! The telemetry source is an external collaborator. The core only needs three
//! things from it: advance to the newest tick, report which tick it is on, and
//! answer point queries by path.
//!
//! Every access goes through [`SharedSource`], a single exclusive lock around the
//! installed source. The lock is held for one query or one tick-snapshot build and
//! is never held across an `.await`.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;

use crate::core::value::{SnapshotId, Value};

/// Errors a point query can produce.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    /// The source is not running (simulator disconnected, playback finished,
    /// nothing installed). Callers keep whatever they cached before.
    #[error("telemetry source is not running")]
    NotAvailable,
    /// No handler is registered for the path, or the current frame lacks it.
    #[error("unknown telemetry path '{0}'")]
    UnknownPath(String),
    /// Any other source-specific fault.
    #[error("{0}")]
    Fault(String),
}

/// Parameters of one point query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryRequest<'a> {
    pub path: &'a str,
    /// Requested unit; empty keeps the source's native unit.
    pub unit: &'a str,
    /// Requested format (`"0"`, `"0.0"`, ...); empty picks the shortest form.
    pub format: &'a str,
    /// Requested display locale; empty formats with a decimal point.
    pub locale: &'a str,
}

impl<'a> QueryRequest<'a> {
    /// A query with native unit and default formatting.
    pub fn raw(path: &'a str) -> Self {
        Self {
            path,
            unit: "",
            format: "",
            locale: "",
        }
    }
}

/// # LiveSource
///
/// A telemetry source. Implementations are driven by the tick scheduler through
/// [`advance`](LiveSource::advance) and queried by sessions and the dispatcher.
pub trait LiveSource: Send {
    /// Short name used in logs.
    fn name(&self) -> &str {
        "source"
    }

    /// Moves to the newest available tick and returns its id, or `None` when the
    /// source is not running.
    fn advance(&mut self) -> Option<SnapshotId>;

    /// The tick queries are currently answered from.
    fn current_tick(&self) -> Option<SnapshotId>;

    /// Answers one point query against the current tick.
    fn query(&self, request: &QueryRequest<'_>) -> Result<Value, SourceError>;
}

/// Result of one scheduler poll, see [`SharedSource::poll_tick`].
#[derive(Debug, Clone, PartialEq)]
pub enum TickPoll {
    /// The source is not running.
    Down,
    /// Still on the tick that was last seen.
    Unchanged(SnapshotId),
    /// A new tick, with the requested paths read under the same lock hold.
    Fresh(SnapshotId, BTreeMap<String, Value>),
}

/// # Shared Source
///
/// Cloneable handle to the single installed source. The slot may be empty, in
/// which case every query answers [`SourceError::NotAvailable`].
#[derive(Clone, Default)]
pub struct SharedSource {
    slot: Arc<Mutex<Option<Box<dyn LiveSource>>>>,
}

impl SharedSource {
    /// An empty handle; install a source with [`install`](Self::install).
    pub fn new() -> Self {
        Self::default()
    }

    /// A handle with `source` already installed.
    pub fn with_source(source: impl LiveSource + 'static) -> Self {
        let shared = Self::new();
        shared.install(Box::new(source));
        shared
    }

    /// Installs `source`, replacing (and returning) any previous one.
    pub fn install(&self, source: Box<dyn LiveSource>) -> Option<Box<dyn LiveSource>> {
        tracing::info!("Installing telemetry source '{}'", source.name());
        self.lock().replace(source)
    }

    /// Removes the installed source. Subsequent queries answer `NotAvailable`.
    pub fn release(&self) -> Option<Box<dyn LiveSource>> {
        let released = self.lock().take();
        if let Some(source) = &released {
            tracing::info!("Released telemetry source '{}'", source.name());
        }
        released
    }

    pub fn is_installed(&self) -> bool {
        self.lock().is_some()
    }

    /// The current tick, `None` when nothing is installed or the source is down.
    pub fn current_tick(&self) -> Option<SnapshotId> {
        self.lock().as_ref().and_then(|s| s.current_tick())
    }

    /// One point query under the exclusive lock.
    pub fn query(&self, request: &QueryRequest<'_>) -> Result<Value, SourceError> {
        match self.lock().as_ref() {
            Some(source) => source.query(request),
            None => Err(SourceError::NotAvailable),
        }
    }

    /// Advances the source and, when it moved past `last_seen`, reads every path
    /// in `paths` with native units. Advance and read happen under one lock hold
    /// so the returned map belongs to a single tick.
    ///
    /// Paths that fail with anything but `NotAvailable` are reported as error
    /// values; `NotAvailable` mid-read turns the whole poll into [`TickPoll::Down`].
    pub fn poll_tick<'p, I>(&self, last_seen: Option<SnapshotId>, paths: I) -> TickPoll
    where
        I: IntoIterator<Item = &'p String>,
    {
        let mut guard = self.lock();
        let Some(source) = guard.as_mut() else {
            return TickPoll::Down;
        };
        let Some(tick) = source.advance() else {
            return TickPoll::Down;
        };
        if last_seen == Some(tick) {
            return TickPoll::Unchanged(tick);
        }

        let mut values = BTreeMap::new();
        for path in paths {
            let value = match source.query(&QueryRequest::raw(path)) {
                Ok(value) => value,
                Err(SourceError::NotAvailable) => return TickPoll::Down,
                Err(e) => Value::error(e.to_string(), tick),
            };
            values.insert(path.clone(), value);
        }
        TickPoll::Fresh(tick, values)
    }

    fn lock(&self) -> MutexGuard<'_, Option<Box<dyn LiveSource>>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
