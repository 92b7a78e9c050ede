//! # Telemetry Sources
//!
//! Concrete [`LiveSource`](crate::core::LiveSource) implementations and the
//! pieces they share: the frame format, the path registry that answers point
//! queries, and unit conversion.

pub mod frame;
pub mod live_feed;
pub mod paths;
pub mod playback;
pub mod units;

pub use frame::{Reading, TelemetryFrame};
pub use live_feed::{FeedFrame, FeedPublisher, LiveFeedSource};
pub use paths::{PathContext, PathHandler, PathRegistry};
pub use playback::{PlaybackError, PlaybackSource, SeekRange};
pub use units::UnitError;
