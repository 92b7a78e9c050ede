//! # Push Transports
//!
//! [`OnDemandChannel`] answers every inbound message of a connection with one
//! diff. [`ContinuousFeed`] is a server-owned loop that polls a session on a fixed
//! cadence and pushes whatever changed.
//!
//! Inbound messages are `{"SessionId": "...", "Subscribe": {...}, "Reset": true}`
//! with every field optional. A bare non-JSON text frame is taken as a session id.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value as Json;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::core::registry::SessionCache;
use crate::core::session::SubscriptionRequest;
use crate::transports::{encode_diff, RelayError};

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InboundMessage {
    #[serde(default)]
    pub session_id: Option<String>,
    /// Kept raw so a bad subscription does not invalidate the rest of the message.
    #[serde(default)]
    pub subscribe: Option<Json>,
    #[serde(default)]
    pub reset: bool,
}

impl InboundMessage {
    pub fn parse(text: &str) -> Result<Self, RelayError> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Ok(Self::default());
        }
        if !trimmed.starts_with('{') {
            return Ok(Self {
                session_id: Some(trimmed.to_string()),
                ..Self::default()
            });
        }
        serde_json::from_str(trimmed).map_err(RelayError::MalformedMessage)
    }

    /// The subscription part, if present and well formed.
    pub fn subscriptions(&self) -> Result<Option<SubscriptionRequest>, RelayError> {
        match &self.subscribe {
            None | Some(Json::Null) => Ok(None),
            Some(raw) => serde_json::from_value(raw.clone())
                .map(Some)
                .map_err(RelayError::MalformedSubscription),
        }
    }
}

/// Push-on-demand adapter for one connection.
pub struct OnDemandChannel {
    cache: Arc<SessionCache>,
    /// Session used for messages that carry no id; deleted on close.
    fallback_session: String,
}

impl OnDemandChannel {
    pub fn new(cache: Arc<SessionCache>, fallback_session: impl Into<String>) -> Self {
        Self {
            cache,
            fallback_session: fallback_session.into(),
        }
    }

    pub fn fallback_session(&self) -> &str {
        &self.fallback_session
    }

    /// Handles one inbound text frame and returns the outbound diff.
    pub fn handle(&self, text: &str) -> String {
        let message = InboundMessage::parse(text).unwrap_or_else(|e| {
            tracing::warn!("Connection '{}': {}", self.fallback_session, e);
            InboundMessage::default()
        });
        let session_id = message
            .session_id
            .as_deref()
            .filter(|s| !s.is_empty())
            .unwrap_or(self.fallback_session.as_str());

        if message.reset && self.cache.delete_session(session_id) {
            tracing::debug!("Session '{}' reset on request", session_id);
        }
        let subscriptions = message.subscriptions().unwrap_or_else(|e| {
            tracing::warn!("Session '{}': {}", session_id, e);
            None
        });
        encode_diff(&self.cache.get_snapshot(session_id, subscriptions.as_ref()))
    }

    /// Drops the connection's fallback session.
    pub fn close(self) {
        self.cache.delete_session(&self.fallback_session);
    }
}

/// Why a [`ContinuousFeed`] loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedExit {
    /// The server is shutting down.
    Cancelled,
    /// The consumer went away.
    Closed,
}

/// Push-continuous adapter for one connection.
pub struct ContinuousFeed {
    cache: Arc<SessionCache>,
    session_id: String,
    cadence: Duration,
    delete_on_exit: bool,
}

impl ContinuousFeed {
    pub fn new(cache: Arc<SessionCache>, session_id: impl Into<String>, cadence: Duration) -> Self {
        Self {
            cache,
            session_id: session_id.into(),
            cadence: cadence.max(Duration::from_millis(1)),
            delete_on_exit: false,
        }
    }

    /// Deletes the session when the loop ends (per-connection sessions).
    pub fn delete_on_exit(mut self, yes: bool) -> Self {
        self.delete_on_exit = yes;
        self
    }

    /// Pushes non-empty diffs into `outbound` every cadence. Subscriptions arriving
    /// on `inbound` are merged right away and answered immediately. The loop ends
    /// when `cancel` fires or either channel closes; closure is noticed on the
    /// next wake.
    pub async fn run(
        self,
        mut inbound: mpsc::Receiver<SubscriptionRequest>,
        outbound: mpsc::Sender<String>,
        cancel: CancellationToken,
    ) -> FeedExit {
        let mut ticker = tokio::time::interval(self.cadence);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut pushed: u64 = 0;

        let exit = loop {
            let subscriptions = tokio::select! {
                _ = cancel.cancelled() => break FeedExit::Cancelled,
                _ = ticker.tick() => None,
                request = inbound.recv() => match request {
                    Some(request) => Some(request),
                    None => break FeedExit::Closed,
                },
            };
            if outbound.is_closed() {
                break FeedExit::Closed;
            }

            let diff = self.cache.get_snapshot(&self.session_id, subscriptions.as_ref());
            if diff.is_empty() {
                continue;
            }
            if outbound.send(encode_diff(&diff)).await.is_err() {
                break FeedExit::Closed;
            }
            pushed += 1;
        };

        tracing::debug!(
            "Feed for session '{}' ended ({:?}) after {} push(es)",
            self.session_id,
            exit,
            pushed
        );
        if self.delete_on_exit {
            self.cache.delete_session(&self.session_id);
        }
        exit
    }
}
