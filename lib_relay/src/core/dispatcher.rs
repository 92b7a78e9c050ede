//! # Callback Dispatcher
//!
//! Fans every source tick out to the registered [`CallbackWorker`]s.
//!
//! ## Core Design Principles:
//!
//! 1.  **Single Source Pass**: the scheduler reads the union of every worker's
//!     paths once per tick ([`subscribed_paths`](CallbackDispatcher::subscribed_paths));
//!     each worker then gets its own filtered copy of that one map.
//!
//! 2.  **Non-blocking Fan-out**: delivery uses `try_send`. A full mailbox drops
//!     the tick for that worker and nobody else; the scheduler never waits on a
//!     slow plugin.
//!
//! 3.  **Cleanup on Send**: workers whose loop has ended are removed the first
//!     time a delivery to them reports `Closed`, the same way a disconnected
//!     client is retained out of the list.

use std::collections::BTreeSet;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::core::worker::{CallbackWorker, Delivery, Tick, TickHandler, WorkerStats};

/// Counters for a single [`dispatch`](CallbackDispatcher::dispatch) call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub dropped: usize,
    pub removed: usize,
}

/// # Callback Dispatcher
#[derive(Default)]
pub struct CallbackDispatcher {
    workers: Mutex<Vec<Arc<CallbackWorker>>>,
}

impl CallbackDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an already running worker.
    pub fn register(&self, worker: CallbackWorker) -> Arc<CallbackWorker> {
        let worker = Arc::new(worker);
        tracing::info!(
            "Worker '{}' registered for {:?}",
            worker.name(),
            worker.paths()
        );
        self.lock().push(Arc::clone(&worker));
        worker
    }

    /// Spawns and registers a worker in one step.
    pub fn spawn_worker<H: TickHandler>(
        &self,
        name: impl Into<String>,
        paths: impl IntoIterator<Item = impl Into<String>>,
        handler: H,
    ) -> io::Result<Arc<CallbackWorker>> {
        let worker = CallbackWorker::spawn(name, paths, handler)?;
        Ok(self.register(worker))
    }

    /// Union of every registered worker's paths.
    pub fn subscribed_paths(&self) -> BTreeSet<String> {
        self.lock()
            .iter()
            .flat_map(|w| w.paths().iter().cloned())
            .collect()
    }

    /// Offers `tick` to every worker and drops workers that have stopped.
    pub fn dispatch(&self, tick: &Tick) -> DispatchReport {
        let mut report = DispatchReport::default();
        let mut workers = self.lock();
        workers.retain(|worker| match worker.offer(tick) {
            Delivery::Delivered => {
                report.delivered += 1;
                true
            }
            Delivery::Dropped => {
                report.dropped += 1;
                true
            }
            Delivery::Closed => {
                tracing::info!("Worker '{}' has stopped. Removing from dispatcher.", worker.name());
                report.removed += 1;
                false
            }
        });
        report
    }

    /// Shuts down and removes the worker called `name`.
    pub fn remove(&self, name: &str) -> bool {
        let mut workers = self.lock();
        let before = workers.len();
        workers.retain(|w| {
            if w.name() == name {
                w.shutdown();
                false
            } else {
                true
            }
        });
        let removed = workers.len() != before;
        if removed {
            tracing::info!("Worker '{}' explicitly removed.", name);
        }
        removed
    }

    /// Signals every worker to stop and empties the list. Threads are not joined
    /// here; the removed workers are returned so the caller can
    /// [`join`](CallbackWorker::join) them within its own time limit.
    pub fn shutdown_all(&self) -> Vec<Arc<CallbackWorker>> {
        let workers: Vec<_> = self.lock().drain(..).collect();
        for worker in &workers {
            worker.shutdown();
        }
        tracing::info!("Dispatcher shut down {} worker(s)", workers.len());
        workers
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> Vec<WorkerStats> {
        self.lock().iter().map(|w| w.stats()).collect()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Arc<CallbackWorker>>> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::value::{Value, ValueState};
    use crate::core::worker::handler_fn;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::mpsc as std_mpsc;
    use std::time::Duration;

    fn tick(id: u64) -> Tick {
        let mut values = BTreeMap::new();
        values.insert(
            "/Car/ME/Rpm".to_string(),
            Value::new(json!(id * 100), "rpm", "", ValueState::Normal, id),
        );
        Tick::new(id, values)
    }

    #[test]
    fn subscribed_paths_is_the_union() {
        let dispatcher = CallbackDispatcher::new();
        dispatcher
            .spawn_worker("a", ["/Car/ME/Rpm", "/Car/ME/Gear"], handler_fn(|_t: Tick| true))
            .unwrap();
        dispatcher
            .spawn_worker("b", ["/Car/ME/Gear", "/Session/Flag"], handler_fn(|_t: Tick| true))
            .unwrap();

        let paths: Vec<_> = dispatcher.subscribed_paths().into_iter().collect();
        assert_eq!(paths, vec!["/Car/ME/Gear", "/Car/ME/Rpm", "/Session/Flag"]);
        dispatcher.shutdown_all();
        assert!(dispatcher.is_empty());
    }

    #[test]
    fn stopped_workers_are_removed_on_dispatch() {
        let dispatcher = CallbackDispatcher::new();
        let worker = dispatcher
            .spawn_worker("quitter", ["/Car/ME/Rpm"], handler_fn(|_t: Tick| true))
            .unwrap();
        worker.shutdown();

        let report = dispatcher.dispatch(&tick(1));
        assert_eq!(report.removed, 1);
        assert!(dispatcher.is_empty());
    }

    #[test]
    fn idle_tick_reaches_every_worker() {
        let dispatcher = CallbackDispatcher::new();
        let (tx, rx) = std_mpsc::channel();
        for name in ["lights", "recorder"] {
            let tx = tx.clone();
            dispatcher
                .spawn_worker(name, ["/Car/ME/Rpm"], handler_fn(move |t: Tick| {
                    tx.send((name, t.is_idle())).is_ok()
                }))
                .unwrap();
        }

        let report = dispatcher.dispatch(&Tick::idle());
        assert_eq!(report.delivered, 2);
        let mut seen = vec![
            rx.recv_timeout(Duration::from_secs(2)).unwrap(),
            rx.recv_timeout(Duration::from_secs(2)).unwrap(),
        ];
        seen.sort();
        assert_eq!(seen, vec![("lights", true), ("recorder", true)]);
        assert!(dispatcher.remove("lights"));
        assert!(!dispatcher.remove("lights"));
        assert_eq!(dispatcher.len(), 1);
    }
}
