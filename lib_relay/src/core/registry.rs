//! # Session Cache
//!
//! Process-wide registry of [`SubscriptionSession`]s keyed by caller session id.
//! Created at service start, handed to every transport adapter, cleared at stop.
//!
//! Two lock scopes live here: the registry map (held only to look up, insert or
//! remove an entry) and one lock per session (held for a whole
//! refresh-and-serialize pass). When both are needed the session lock is taken
//! first. `get_snapshot` checks the registry under its session lock so it never
//! works on a session that was removed while it waited.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::core::session::{Diff, RefreshOutcome, SubscriptionRequest, SubscriptionSession};
use crate::core::source::SharedSource;

type SessionHandle = Arc<Mutex<SubscriptionSession>>;

/// # Session Cache
pub struct SessionCache {
    sessions: Mutex<HashMap<String, SessionHandle>>,
    source: SharedSource,
    idle_timeout: Option<Duration>,
}

impl SessionCache {
    pub fn new(source: SharedSource) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            source,
            idle_timeout: None,
        }
    }

    /// Sessions untouched for longer than `timeout` become eligible for
    /// [`evict_idle`](Self::evict_idle). `None` keeps sessions forever.
    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout.filter(|t| !t.is_zero());
        self
    }

    pub fn source(&self) -> &SharedSource {
        &self.source
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout
    }

    /// Merges `subscriptions` (if any) into the session, refreshes it and returns
    /// the groups that changed since the previous call.
    pub fn get_snapshot(&self, session_id: &str, subscriptions: Option<&SubscriptionRequest>) -> Diff {
        self.get_snapshot_at(session_id, subscriptions, Instant::now())
    }

    /// [`get_snapshot`](Self::get_snapshot) with an explicit clock.
    pub fn get_snapshot_at(
        &self,
        session_id: &str,
        subscriptions: Option<&SubscriptionRequest>,
        now: Instant,
    ) -> Diff {
        loop {
            let handle = self.session(session_id, now);
            let mut session = lock(&handle);
            // A delete or eviction may have won the session lock while we waited.
            if !self.is_current(session_id, &handle) {
                tracing::debug!("Session '{}' removed while waiting, retrying", session_id);
                continue;
            }
            return self.serve(&mut session, subscriptions, now);
        }
    }

    fn serve(
        &self,
        session: &mut SubscriptionSession,
        subscriptions: Option<&SubscriptionRequest>,
        now: Instant,
    ) -> Diff {
        session.touch(now);

        if let Some(request) = subscriptions {
            let added = session.merge(request);
            if added > 0 {
                tracing::debug!("Session '{}' gained {} item(s)", session.id(), added);
            }
        }

        match session.refresh(&self.source, now) {
            RefreshOutcome::SourceDown => {
                tracing::trace!("Session '{}' refresh skipped: source down", session.id())
            }
            RefreshOutcome::Refreshed { queried, changed } => tracing::trace!(
                "Session '{}' refreshed {} item(s), {} changed",
                session.id(),
                queried,
                changed
            ),
            RefreshOutcome::Fresh => {}
        }
        session.take_diff()
    }

    /// Removes the session. Waits for a refresh in progress on it to finish first.
    /// Returns `false` if there was no such session.
    pub fn delete_session(&self, session_id: &str) -> bool {
        let Some(handle) = self.lookup(session_id) else {
            return false;
        };
        let _session = lock(&handle);
        let removed = self.remove_if_same(session_id, &handle);
        if removed {
            tracing::info!("Session '{}' deleted", session_id);
        }
        removed
    }

    /// Removes every session idle for longer than the configured timeout.
    /// Returns the evicted ids.
    pub fn evict_idle(&self) -> Vec<String> {
        self.evict_idle_at(Instant::now())
    }

    /// [`evict_idle`](Self::evict_idle) with an explicit clock.
    pub fn evict_idle_at(&self, now: Instant) -> Vec<String> {
        let Some(timeout) = self.idle_timeout else {
            return Vec::new();
        };
        let candidates: Vec<(String, SessionHandle)> = self
            .registry()
            .iter()
            .map(|(id, handle)| (id.clone(), Arc::clone(handle)))
            .collect();

        let mut evicted = Vec::new();
        for (id, handle) in candidates {
            let session = lock(&handle);
            if now.saturating_duration_since(session.last_access()) < timeout {
                continue;
            }
            if self.remove_if_same(&id, &handle) {
                tracing::info!("Session '{}' evicted after {:?} idle", id, timeout);
                evicted.push(id);
            }
        }
        evicted
    }

    /// Runs `f` against the session, if it exists.
    pub fn inspect<R>(&self, session_id: &str, f: impl FnOnce(&SubscriptionSession) -> R) -> Option<R> {
        let handle = self.lookup(session_id)?;
        let session = lock(&handle);
        Some(f(&session))
    }

    pub fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.registry().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.registry().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every session (service teardown).
    pub fn clear(&self) {
        let count = {
            let mut sessions = self.registry();
            let count = sessions.len();
            sessions.clear();
            count
        };
        tracing::info!("Session cache cleared ({} session(s))", count);
    }

    fn session(&self, session_id: &str, now: Instant) -> SessionHandle {
        let mut sessions = self.registry();
        let handle = sessions.entry(session_id.to_string()).or_insert_with(|| {
            tracing::info!("Session '{}' created", session_id);
            Arc::new(Mutex::new(SubscriptionSession::new(session_id, now)))
        });
        Arc::clone(handle)
    }

    fn lookup(&self, session_id: &str) -> Option<SessionHandle> {
        self.registry().get(session_id).cloned()
    }

    fn is_current(&self, session_id: &str, handle: &SessionHandle) -> bool {
        self.registry()
            .get(session_id)
            .is_some_and(|current| Arc::ptr_eq(current, handle))
    }

    /// Removes `session_id` only if it still maps to `handle`; a session re-created
    /// under the same id in the meantime is left alone.
    fn remove_if_same(&self, session_id: &str, handle: &SessionHandle) -> bool {
        let mut sessions = self.registry();
        match sessions.get(session_id) {
            Some(current) if Arc::ptr_eq(current, handle) => {
                sessions.remove(session_id);
                true
            }
            _ => false,
        }
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<String, SessionHandle>> {
        lock(&self.sessions)
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
