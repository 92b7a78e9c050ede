//! # Playback Source
//!
//! Replays a JSON-lines recording of [`TelemetryFrame`]s, one frame per
//! scheduler cycle. Recordings come from the tick recorder plugin or any tool
//! that writes the same frame format.

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;
use std::sync::Arc;

use thiserror::Error;

use crate::core::source::{LiveSource, QueryRequest, SourceError};
use crate::core::value::{SnapshotId, Value};
use crate::sources::frame::TelemetryFrame;
use crate::sources::paths::{PathContext, PathRegistry};

#[derive(Debug, Error)]
pub enum PlaybackError {
    #[error("failed to read recording: {0}")]
    Io(#[from] io::Error),
    #[error("bad frame on line {line}: {source}")]
    Parse {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("recording has no frames in the selected range")]
    Empty,
}

/// Inclusive range of recorded tick markers to replay. Open ends are unbounded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeekRange {
    pub start: Option<SnapshotId>,
    pub end: Option<SnapshotId>,
}

impl SeekRange {
    pub fn contains(&self, tick: SnapshotId) -> bool {
        self.start.map_or(true, |s| tick >= s) && self.end.map_or(true, |e| tick <= e)
    }
}

pub struct PlaybackSource {
    frames: Vec<TelemetryFrame>,
    registry: Arc<PathRegistry>,
    /// Index of the frame being served; `None` before the first advance.
    position: Option<usize>,
    finished: bool,
}

impl PlaybackSource {
    pub fn open(path: impl AsRef<Path>, registry: Arc<PathRegistry>, seek: SeekRange) -> Result<Self, PlaybackError> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let source = Self::from_reader(BufReader::new(file), registry, seek)?;
        tracing::info!(
            "Loaded {} frame(s) from recording {}",
            source.frames.len(),
            path.display()
        );
        Ok(source)
    }

    /// Parses every frame up front. Blank lines are skipped.
    pub fn from_reader(reader: impl BufRead, registry: Arc<PathRegistry>, seek: SeekRange) -> Result<Self, PlaybackError> {
        let mut frames = Vec::new();
        for (index, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let frame: TelemetryFrame = serde_json::from_str(&line).map_err(|source| PlaybackError::Parse {
                line: index + 1,
                source,
            })?;
            if seek.contains(frame.tick) {
                frames.push(frame);
            }
        }
        if frames.is_empty() {
            return Err(PlaybackError::Empty);
        }
        Ok(Self {
            frames,
            registry,
            position: None,
            finished: false,
        })
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    fn current_frame(&self) -> Option<&TelemetryFrame> {
        if self.finished {
            return None;
        }
        self.position.and_then(|i| self.frames.get(i))
    }
}

impl LiveSource for PlaybackSource {
    fn name(&self) -> &str {
        "playback"
    }

    fn advance(&mut self) -> Option<SnapshotId> {
        if self.finished {
            return None;
        }
        let next = self.position.map_or(0, |i| i + 1);
        if next >= self.frames.len() {
            self.finished = true;
            tracing::info!("Playback finished after {} frame(s)", self.frames.len());
            return None;
        }
        self.position = Some(next);
        self.current_tick()
    }

    /// Ids are 1-based positions in the replayed range, so they increase even if
    /// the recording's own markers do not.
    fn current_tick(&self) -> Option<SnapshotId> {
        if self.finished {
            return None;
        }
        self.position.map(|i| i as SnapshotId + 1)
    }

    fn query(&self, request: &QueryRequest<'_>) -> Result<Value, SourceError> {
        let (frame, tick) = self
            .current_frame()
            .zip(self.current_tick())
            .ok_or(SourceError::NotAvailable)?;
        self.registry.resolve(&PathContext { tick, frame }, request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value as Json};
    use std::io::{Cursor, Write};

    const RECORDING: &str = r#"{"tick": 10, "values": {"/Car/ME/Speed": 120}, "units": {"/Car/ME/Speed": "km/h"}}

{"tick": 11, "values": {"/Car/ME/Speed": 121}, "units": {"/Car/ME/Speed": "km/h"}}
{"tick": 12, "values": {"/Car/ME/Speed": 122}, "units": {"/Car/ME/Speed": "km/h"}}
"#;

    fn registry() -> Arc<PathRegistry> {
        Arc::new(PathRegistry::with_defaults())
    }

    fn speed(source: &PlaybackSource) -> Json {
        source.query(&QueryRequest::raw("/Car/ME/Speed")).unwrap().raw
    }

    #[test]
    fn steps_through_frames_then_stops() {
        let mut source = PlaybackSource::from_reader(Cursor::new(RECORDING), registry(), SeekRange::default()).unwrap();
        assert_eq!(source.len(), 3);
        assert_eq!(source.current_tick(), None);

        assert_eq!(source.advance(), Some(1));
        assert_eq!(speed(&source), json!(120));
        assert_eq!(source.advance(), Some(2));
        assert_eq!(source.advance(), Some(3));
        assert_eq!(speed(&source), json!(122));

        assert_eq!(source.advance(), None);
        assert!(source.is_finished());
        assert_eq!(
            source.query(&QueryRequest::raw("/Car/ME/Speed")),
            Err(SourceError::NotAvailable)
        );
    }

    #[test]
    fn seek_range_limits_replay() {
        let seek = SeekRange {
            start: Some(11),
            end: Some(11),
        };
        let mut source = PlaybackSource::from_reader(Cursor::new(RECORDING), registry(), seek).unwrap();
        assert_eq!(source.len(), 1);
        source.advance();
        assert_eq!(speed(&source), json!(121));

        let nothing = SeekRange {
            start: Some(50),
            end: None,
        };
        assert!(matches!(
            PlaybackSource::from_reader(Cursor::new(RECORDING), registry(), nothing),
            Err(PlaybackError::Empty)
        ));
    }

    #[test]
    fn reports_the_bad_line() {
        let bad = "{\"tick\": 1, \"values\": {}}\nnot json\n";
        match PlaybackSource::from_reader(Cursor::new(bad), registry(), SeekRange::default()) {
            Err(PlaybackError::Parse { line, .. }) => assert_eq!(line, 2),
            other => panic!("unexpected result: {:?}", other.err()),
        }
    }

    #[test]
    fn opens_a_file_on_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(RECORDING.as_bytes()).unwrap();
        let source = PlaybackSource::open(file.path(), registry(), SeekRange::default()).unwrap();
        assert_eq!(source.len(), 3);
    }
}
