//! # Callback Workers
//!
//! A callback worker is a background consumer ("plugin") that wants every tick of
//! a fixed set of paths: shift-light drivers, lap recorders, source watchdogs.
//!
//! Each worker owns a mailbox with room for exactly [`MAILBOX_CAPACITY`] ticks and
//! a dedicated OS thread that blocks on it. Delivery never waits: when the mailbox
//! is full the incoming tick is discarded for that worker only, so a stalled
//! handler cannot hold up the scheduler or any other worker.

use std::collections::BTreeMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;

use tokio::sync::mpsc::{self, error::TrySendError};

use crate::core::value::{SnapshotId, Value};

/// Ticks a worker may have pending before new ones are dropped.
pub const MAILBOX_CAPACITY: usize = 2;

/// # Tick
///
/// One delivery to a worker. A tick without an id is an idle tick: the source is
/// not running and `values` is empty.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Tick {
    pub id: Option<SnapshotId>,
    pub values: BTreeMap<String, Value>,
}

impl Tick {
    pub fn new(id: SnapshotId, values: BTreeMap<String, Value>) -> Self {
        Self {
            id: Some(id),
            values,
        }
    }

    /// The empty tick sent while the source is down.
    pub fn idle() -> Self {
        Self::default()
    }

    pub fn is_idle(&self) -> bool {
        self.id.is_none()
    }

    /// A copy restricted to `paths`.
    pub fn filtered(&self, paths: &[String]) -> Tick {
        let values = paths
            .iter()
            .filter_map(|p| self.values.get(p).map(|v| (p.clone(), v.clone())))
            .collect();
        Tick {
            id: self.id,
            values,
        }
    }
}

/// # Tick Handler
///
/// User code run on the worker's thread for every delivered tick. Returning
/// `false` stops the worker for good.
pub trait TickHandler: Send + 'static {
    fn on_tick(&mut self, tick: Tick) -> bool;

    /// Called once on the worker thread after the loop ends, whatever the reason.
    fn on_stop(&mut self) {}
}

/// Adapter that turns a closure into a [`TickHandler`].
pub struct FnHandler<F>(F);

impl<F> TickHandler for FnHandler<F>
where
    F: FnMut(Tick) -> bool + Send + 'static,
{
    fn on_tick(&mut self, tick: Tick) -> bool {
        (self.0)(tick)
    }
}

/// Wraps `f` so it can be registered as a worker handler.
pub fn handler_fn<F>(f: F) -> FnHandler<F>
where
    F: FnMut(Tick) -> bool + Send + 'static,
{
    FnHandler(f)
}

/// Outcome of offering a tick to one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Enqueued.
    Delivered,
    /// Mailbox full; tick discarded for this worker.
    Dropped,
    /// The worker has stopped.
    Closed,
}

/// Per-worker counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerStats {
    pub name: String,
    pub delivered: u64,
    pub dropped: u64,
    pub running: bool,
}

/// # Callback Worker
pub struct CallbackWorker {
    name: String,
    paths: Vec<String>,
    /// `None` once shut down; dropping the sender wakes the blocked thread.
    sender: Mutex<Option<mpsc::Sender<Tick>>>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
    running: Arc<AtomicBool>,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl CallbackWorker {
    /// Starts a worker thread running `handler` for ticks restricted to `paths`.
    /// Duplicate paths are collapsed, first occurrence wins the ordering.
    pub fn spawn<H: TickHandler>(
        name: impl Into<String>,
        paths: impl IntoIterator<Item = impl Into<String>>,
        mut handler: H,
    ) -> io::Result<Self> {
        let name = name.into();
        let mut list: Vec<String> = Vec::new();
        for path in paths {
            let path = path.into();
            if !list.contains(&path) {
                list.push(path);
            }
        }

        let (tx, mut rx) = mpsc::channel::<Tick>(MAILBOX_CAPACITY);
        let running = Arc::new(AtomicBool::new(true));
        let thread_running = Arc::clone(&running);
        let thread_name = name.clone();

        let handle = thread::Builder::new()
            .name(format!("worker-{name}"))
            .spawn(move || {
                while let Some(tick) = rx.blocking_recv() {
                    if !handler.on_tick(tick) {
                        tracing::debug!("Worker '{}' handler asked to stop", thread_name);
                        break;
                    }
                }
                // Closing the receiver makes further offers report `Closed`.
                rx.close();
                thread_running.store(false, Ordering::Release);
                handler.on_stop();
                tracing::info!("Worker '{}' stopped", thread_name);
            })?;

        tracing::info!("Worker '{}' started with {} path(s)", name, list.len());
        Ok(Self {
            name,
            paths: list,
            sender: Mutex::new(Some(tx)),
            thread: Mutex::new(Some(handle)),
            running,
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The subscription list fixed at construction.
    pub fn paths(&self) -> &[String] {
        &self.paths
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Offers this worker its filtered view of `tick` without blocking.
    pub fn offer(&self, tick: &Tick) -> Delivery {
        let sender = lock(&self.sender);
        let Some(tx) = sender.as_ref() else {
            return Delivery::Closed;
        };
        match tx.try_send(tick.filtered(&self.paths)) {
            Ok(()) => {
                self.delivered.fetch_add(1, Ordering::Relaxed);
                Delivery::Delivered
            }
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("Worker '{}' mailbox full, tick dropped", self.name);
                Delivery::Dropped
            }
            Err(TrySendError::Closed(_)) => Delivery::Closed,
        }
    }

    /// Closes the mailbox, waking the blocked thread. Returns `true` only for the
    /// call that actually closed it; later calls are no-ops.
    pub fn shutdown(&self) -> bool {
        let closed = lock(&self.sender).take().is_some();
        if closed {
            tracing::debug!("Worker '{}' shutdown requested", self.name);
        }
        closed
    }

    /// Shuts down and waits for the thread to finish its current tick.
    /// Returns `false` if the handler panicked.
    pub fn join(&self) -> bool {
        self.shutdown();
        match lock(&self.thread).take() {
            Some(handle) => handle.join().is_ok(),
            None => true,
        }
    }

    pub fn stats(&self) -> WorkerStats {
        WorkerStats {
            name: self.name.clone(),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            running: self.is_running(),
        }
    }
}

impl Drop for CallbackWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
