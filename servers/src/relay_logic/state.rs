use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use lib_relay::core::{CallbackDispatcher, CallbackWorker, SessionCache, SharedSource};
use tokio_util::sync::CancellationToken;

/// Everything the tasks and handlers share. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub cache: Arc<SessionCache>,
    pub dispatcher: Arc<CallbackDispatcher>,
    pub source: SharedSource,
    /// Cancelled once when the server starts shutting down.
    pub cancel: CancellationToken,
    /// Default cadence of /stream connections.
    pub stream_cadence: Duration,
    /// Fastest cadence a /stream client may ask for.
    pub min_stream_cadence: Duration,
    next_connection: Arc<AtomicU64>,
}

impl AppState {
    pub fn new(source: SharedSource, idle_timeout: Option<Duration>, stream_cadence: Duration) -> Self {
        let cache = SessionCache::new(source.clone()).with_idle_timeout(idle_timeout);
        Self {
            cache: Arc::new(cache),
            dispatcher: Arc::new(CallbackDispatcher::new()),
            source,
            cancel: CancellationToken::new(),
            stream_cadence,
            min_stream_cadence: Duration::from_millis(1),
            next_connection: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn with_min_stream_cadence(mut self, floor: Duration) -> Self {
        self.min_stream_cadence = floor.max(Duration::from_millis(1));
        self
    }

    /// A fresh per-connection session id.
    pub fn next_anonymous_session(&self) -> String {
        format!("anon-{}", self.next_connection.fetch_add(1, Ordering::Relaxed))
    }

    /// Tears everything down: stops the loops, the workers and the source, and
    /// forgets every session. Safe to call more than once.
    pub fn stop(&self) {
        self.teardown();
    }

    /// [`stop`](Self::stop), then gives the worker threads up to `limit` to run
    /// their stop hooks (the recorder flushes there). Returns `false` when some
    /// worker was still busy at the deadline.
    pub async fn stop_and_join(&self, limit: Duration) -> bool {
        let workers = self.teardown();
        let count = workers.len();
        let joining = tokio::task::spawn_blocking(move || {
            workers.iter().fold(true, |clean, worker| worker.join() && clean)
        });
        match tokio::time::timeout(limit, joining).await {
            Ok(Ok(true)) => {
                tracing::info!("Joined {} worker(s)", count);
                true
            }
            Ok(Ok(false)) => {
                tracing::warn!("A worker handler panicked during shutdown");
                true
            }
            Ok(Err(e)) => {
                tracing::error!("Worker join task failed: {}", e);
                false
            }
            Err(_) => {
                tracing::warn!("Workers still running after {:?}; not waiting any longer", limit);
                false
            }
        }
    }

    fn teardown(&self) -> Vec<Arc<CallbackWorker>> {
        self.cancel.cancel();
        let workers = self.dispatcher.shutdown_all();
        self.source.release();
        self.cache.clear();
        workers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anonymous_sessions_are_unique() {
        let state = AppState::new(SharedSource::new(), None, Duration::from_millis(100));
        let a = state.next_anonymous_session();
        let b = state.clone().next_anonymous_session();
        assert_ne!(a, b);
        assert!(a.starts_with("anon-"));
    }

    #[test]
    fn stop_is_repeatable() {
        let state = AppState::new(SharedSource::new(), None, Duration::from_millis(100));
        state.cache.get_snapshot("s1", None);
        state.stop();
        state.stop();
        assert!(state.cancel.is_cancelled());
        assert!(state.cache.is_empty());
    }

    #[tokio::test]
    async fn stop_and_join_flushes_the_recording() {
        use crate::relay_logic::config::Config;
        use crate::relay_logic::plugins::register_plugins;
        use lib_relay::core::{QueryRequest, Tick, Value, ValueState};
        use lib_relay::sources::{PathRegistry, PlaybackSource, SeekRange};
        use lib_relay::LiveSource;
        use std::collections::BTreeMap;

        let dir = tempfile::tempdir().unwrap();
        let state = AppState::new(SharedSource::new(), None, Duration::from_millis(100));
        let config = Config {
            record_path: Some(dir.path().to_path_buf()),
            record_paths: Some(vec!["/Car/ME/Speed".into()]),
            ..Default::default()
        };
        register_plugins(&config, &state.dispatcher).unwrap();

        for id in 1..=2u64 {
            let mut values = BTreeMap::new();
            values.insert(
                "/Car/ME/Speed".to_string(),
                Value::new(serde_json::json!(100 + id), "km/h", "", ValueState::Normal, id),
            );
            let report = state.dispatcher.dispatch(&Tick::new(id, values));
            assert_eq!(report.dropped, 0);
        }

        assert!(state.stop_and_join(Duration::from_secs(5)).await);

        let recording = std::fs::read_dir(dir.path()).unwrap().next().unwrap().unwrap().path();
        let mut playback =
            PlaybackSource::open(&recording, Arc::new(PathRegistry::with_defaults()), SeekRange::default()).unwrap();
        assert_eq!(playback.len(), 2);
        playback.advance();
        playback.advance();
        let speed = playback.query(&QueryRequest::raw("/Car/ME/Speed")).unwrap();
        assert_eq!(speed.raw, serde_json::json!(102));
    }

    #[test]
    fn stream_cadence_floor_is_at_least_a_millisecond() {
        let state = AppState::new(SharedSource::new(), None, Duration::from_millis(100))
            .with_min_stream_cadence(Duration::ZERO);
        assert_eq!(state.min_stream_cadence, Duration::from_millis(1));
    }
}
