//! # Transport Adapters
//!
//! Turn session diffs into wire payloads for one consumer connection. The
//! adapters are framework-agnostic: they take and return strings and leave
//! sockets and HTTP to the server.
//!
//! - **`pull`**: one request in, one diff out.
//! - **`push`**: push-on-demand (one diff per inbound message) and
//!   push-continuous (server-owned loop on a fixed cadence).

pub mod pull;
pub mod push;

use thiserror::Error;

use crate::core::session::{Diff, SubscriptionRequest};

pub use pull::PullAdapter;
pub use push::{ContinuousFeed, FeedExit, InboundMessage, OnDemandChannel};

/// Session used by pull requests that carry no session id.
///
/// Every anonymous client shares it: one client's pull consumes the change
/// marks another was waiting for, and subscriptions accumulate across all of
/// them. Clients that need their own diffs must send a session id.
pub const ANONYMOUS_SESSION: &str = "";

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("malformed subscription request: {0}")]
    MalformedSubscription(#[source] serde_json::Error),
    #[error("malformed inbound message: {0}")]
    MalformedMessage(#[source] serde_json::Error),
}

/// Parses a subscription request body. Blank bodies and `null` mean "no new
/// subscriptions".
pub fn parse_subscriptions(body: &str) -> Result<Option<SubscriptionRequest>, RelayError> {
    if body.trim().is_empty() {
        return Ok(None);
    }
    serde_json::from_str::<Option<SubscriptionRequest>>(body).map_err(RelayError::MalformedSubscription)
}

/// Serializes a diff. An empty diff is `{}`.
pub fn encode_diff(diff: &Diff) -> String {
    serde_json::to_string(diff).unwrap_or_else(|e| {
        tracing::error!("Failed to serialize diff: {}", e);
        "{}".to_string()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_and_null_bodies_carry_no_subscriptions() {
        assert!(parse_subscriptions("").unwrap().is_none());
        assert!(parse_subscriptions("  \n").unwrap().is_none());
        assert!(parse_subscriptions("null").unwrap().is_none());
    }

    #[test]
    fn parses_the_subscription_shape() {
        let body = r#"{"car": {"speed": {"Name": "/Car/ME/Speed", "UOM": "km/h", "Interval": 200}}}"#;
        let request = parse_subscriptions(body).unwrap().unwrap();
        let speed = &request["car"]["speed"];
        assert_eq!(speed.name, "/Car/ME/Speed");
        assert_eq!(speed.uom, "km/h");
        assert_eq!(speed.interval, 200);
    }

    #[test]
    fn malformed_bodies_are_errors() {
        assert!(matches!(
            parse_subscriptions("{\"car\": [1, 2]}"),
            Err(RelayError::MalformedSubscription(_))
        ));
    }

    #[test]
    fn empty_diff_is_an_empty_object() {
        assert_eq!(encode_diff(&Diff::new()), "{}");
    }
}
