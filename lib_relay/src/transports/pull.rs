//! Pull transport: one request, one diff.

use std::sync::Arc;

use crate::core::registry::SessionCache;
use crate::transports::{encode_diff, parse_subscriptions, ANONYMOUS_SESSION};

#[derive(Clone)]
pub struct PullAdapter {
    cache: Arc<SessionCache>,
}

impl PullAdapter {
    pub fn new(cache: Arc<SessionCache>) -> Self {
        Self { cache }
    }

    /// Serves one pull request. `session` falls back to the shared anonymous
    /// session; `body` may carry new subscriptions. A malformed body adds
    /// nothing and the current diff is still returned.
    pub fn handle(&self, session: Option<&str>, body: &str) -> String {
        let session_id = session.filter(|s| !s.is_empty()).unwrap_or(ANONYMOUS_SESSION);
        let subscriptions = parse_subscriptions(body).unwrap_or_else(|e| {
            tracing::warn!("Session '{}': ignoring subscription body: {}", session_id, e);
            None
        });
        let diff = self.cache.get_snapshot(session_id, subscriptions.as_ref());
        encode_diff(&diff)
    }

    pub fn delete(&self, session: &str) -> bool {
        self.cache.delete_session(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::source::SharedSource;
    use crate::sources::{LiveFeedSource, PathRegistry, TelemetryFrame};
    use crate::LiveSource;
    use serde_json::{json, Value as Json};

    const SUBSCRIBE: &str =
        r#"{"car": {"speed": {"Name": "/Car/ME/Speed", "UOM": "km/h", "Interval": 100}}}"#;

    fn adapter_with_speed(speed: f64) -> PullAdapter {
        let (publisher, mut source) = LiveFeedSource::channel(Arc::new(PathRegistry::with_defaults()), None);
        publisher.publish(TelemetryFrame::new(1).with_value("/Car/ME/Speed", speed, "km/h"));
        source.advance();
        let cache = SessionCache::new(SharedSource::with_source(source));
        PullAdapter::new(Arc::new(cache))
    }

    fn parse(body: &str) -> Json {
        serde_json::from_str(body).unwrap()
    }

    #[test]
    fn first_contact_returns_values_then_empty() {
        let adapter = adapter_with_speed(120.0);
        let first = parse(&adapter.handle(Some("s1"), SUBSCRIBE));
        assert_eq!(first["car"]["speed"]["Value"], json!(120.0));
        assert_eq!(first["car"]["speed"]["UOM"], json!("km/h"));
        assert_eq!(adapter.handle(Some("s1"), ""), "{}");
    }

    #[test]
    fn missing_session_uses_the_anonymous_one() {
        let adapter = adapter_with_speed(90.0);
        let first = parse(&adapter.handle(None, SUBSCRIBE));
        assert_eq!(first["car"]["speed"]["Value"], json!(90.0));
        // Same anonymous session: already served.
        assert_eq!(adapter.handle(Some(""), ""), "{}");
        assert!(adapter.delete(ANONYMOUS_SESSION));
    }

    #[test]
    fn anonymous_clients_consume_each_others_changes() {
        let adapter = adapter_with_speed(90.0);
        let a = parse(&adapter.handle(None, SUBSCRIBE));
        assert_eq!(a["car"]["speed"]["Value"], json!(90.0));
        // A second anonymous client never sees the value the first one took.
        assert_eq!(adapter.handle(None, SUBSCRIBE), "{}");
        // A named session is unaffected.
        let named = parse(&adapter.handle(Some("own"), SUBSCRIBE));
        assert_eq!(named["car"]["speed"]["Value"], json!(90.0));
    }

    #[test]
    fn malformed_body_still_answers() {
        let adapter = adapter_with_speed(90.0);
        adapter.handle(Some("s1"), SUBSCRIBE);
        assert_eq!(adapter.handle(Some("s1"), "{not json"), "{}");
    }
}
