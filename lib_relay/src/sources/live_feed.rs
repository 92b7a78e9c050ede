//! # Live Feed Source
//!
//! A [`LiveSource`] backed by frames pushed from an ingest task through a
//! `tokio::sync::watch` channel. Only the newest frame matters; anything the
//! scheduler did not get to in time is overwritten.
//!
//! The source counts as running while it holds a frame younger than the silence
//! timeout. Tick ids are assigned here, one per frame observed, so they keep
//! increasing even when the upstream feed restarts its own counter.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;

use crate::core::source::{LiveSource, QueryRequest, SourceError};
use crate::core::value::{SnapshotId, Value};
use crate::sources::frame::TelemetryFrame;
use crate::sources::paths::{PathContext, PathRegistry};

/// A frame plus the instant it arrived.
#[derive(Debug, Clone)]
pub struct FeedFrame {
    pub frame: TelemetryFrame,
    pub received_at: Instant,
}

/// Write side of the feed, held by the ingest task.
#[derive(Clone)]
pub struct FeedPublisher {
    tx: Arc<watch::Sender<Option<FeedFrame>>>,
}

impl FeedPublisher {
    pub fn publish(&self, frame: TelemetryFrame) {
        self.publish_at(frame, Instant::now());
    }

    pub fn publish_at(&self, frame: TelemetryFrame, received_at: Instant) {
        self.tx.send_replace(Some(FeedFrame { frame, received_at }));
    }

    /// Marks the upstream as gone; the source reports not running on its next advance.
    pub fn disconnect(&self) {
        self.tx.send_replace(None);
    }
}

pub struct LiveFeedSource {
    rx: watch::Receiver<Option<FeedFrame>>,
    registry: Arc<PathRegistry>,
    silence_timeout: Option<Duration>,
    current: Option<FeedFrame>,
    counter: SnapshotId,
    running: bool,
}

impl LiveFeedSource {
    /// Creates a connected publisher/source pair. A `silence_timeout` of `None`
    /// keeps the last frame valid indefinitely.
    pub fn channel(registry: Arc<PathRegistry>, silence_timeout: Option<Duration>) -> (FeedPublisher, Self) {
        let (tx, rx) = watch::channel(None);
        let source = Self {
            rx,
            registry,
            silence_timeout: silence_timeout.filter(|t| !t.is_zero()),
            current: None,
            counter: 0,
            running: false,
        };
        (FeedPublisher { tx: Arc::new(tx) }, source)
    }

    /// [`advance`](LiveSource::advance) with an explicit clock.
    pub fn advance_at(&mut self, now: Instant) -> Option<SnapshotId> {
        if self.rx.has_changed().unwrap_or(false) {
            match self.rx.borrow_and_update().clone() {
                Some(latest) => {
                    self.counter += 1;
                    self.current = Some(latest);
                }
                None => self.current = None,
            }
        }

        let alive = match (&self.current, self.silence_timeout) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(feed), Some(limit)) => now.saturating_duration_since(feed.received_at) <= limit,
        };
        if alive != self.running {
            if alive {
                tracing::info!("Live feed is up (tick {})", self.counter);
            } else {
                tracing::warn!("Live feed went silent");
            }
            self.running = alive;
        }
        self.current_tick()
    }
}

impl LiveSource for LiveFeedSource {
    fn name(&self) -> &str {
        "live-feed"
    }

    fn advance(&mut self) -> Option<SnapshotId> {
        self.advance_at(Instant::now())
    }

    fn current_tick(&self) -> Option<SnapshotId> {
        self.running.then_some(self.counter)
    }

    fn query(&self, request: &QueryRequest<'_>) -> Result<Value, SourceError> {
        let feed = self
            .current
            .as_ref()
            .filter(|_| self.running)
            .ok_or(SourceError::NotAvailable)?;
        let ctx = PathContext {
            tick: self.counter,
            frame: &feed.frame,
        };
        self.registry.resolve(&ctx, request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn feed(silence_ms: u64) -> (FeedPublisher, LiveFeedSource) {
        LiveFeedSource::channel(
            Arc::new(PathRegistry::with_defaults()),
            Some(Duration::from_millis(silence_ms)),
        )
    }

    fn speed_frame(tick: SnapshotId, speed: f64) -> TelemetryFrame {
        TelemetryFrame::new(tick).with_value("/Car/ME/Speed", speed, "km/h")
    }

    #[test]
    fn not_running_before_first_frame() {
        let (_publisher, mut source) = feed(500);
        assert_eq!(source.advance(), None);
        assert_eq!(
            source.query(&QueryRequest::raw("/Car/ME/Speed")),
            Err(SourceError::NotAvailable)
        );
    }

    #[test]
    fn ids_increase_per_frame_even_when_upstream_restarts() {
        let (publisher, mut source) = feed(500);
        let t0 = Instant::now();
        publisher.publish_at(speed_frame(900, 120.0), t0);
        assert_eq!(source.advance_at(t0), Some(1));
        // No new frame: same tick.
        assert_eq!(source.advance_at(t0), Some(1));

        publisher.publish_at(speed_frame(1, 121.0), t0);
        assert_eq!(source.advance_at(t0), Some(2));
        let speed = source.query(&QueryRequest::raw("/Car/ME/Speed")).unwrap();
        assert_eq!(speed.raw, json!(121.0));
        assert_eq!(speed.changed_at, 2);
    }

    #[test]
    fn silence_and_disconnect_stop_the_source() {
        let (publisher, mut source) = feed(500);
        let t0 = Instant::now();
        publisher.publish_at(speed_frame(1, 100.0), t0);
        assert!(source.advance_at(t0 + Duration::from_millis(400)).is_some());
        assert_eq!(source.advance_at(t0 + Duration::from_millis(600)), None);

        publisher.publish_at(speed_frame(2, 101.0), t0 + Duration::from_millis(700));
        assert!(source.advance_at(t0 + Duration::from_millis(700)).is_some());

        publisher.disconnect();
        assert_eq!(source.advance_at(t0 + Duration::from_millis(710)), None);
    }
}
