//! # Path Registry
//!
//! Maps path prefixes to handler functions. A query is answered by the handler
//! registered under the longest prefix of its path, so `/Command/Ping` can sit
//! next to a catch-all `/Car/` without either knowing about the other.

use std::sync::Arc;

use serde_json::{json, Value as Json};

use crate::core::source::{QueryRequest, SourceError};
use crate::core::value::{SnapshotId, Value, ValueState};
use crate::sources::frame::{Reading, TelemetryFrame};
use crate::sources::units;

/// What a handler gets to look at: the frame a query is answered from and the
/// tick id the source assigned to it.
#[derive(Debug, Clone, Copy)]
pub struct PathContext<'a> {
    pub tick: SnapshotId,
    pub frame: &'a TelemetryFrame,
}

pub type PathHandler =
    Arc<dyn Fn(&PathContext<'_>, &QueryRequest<'_>) -> Result<Value, SourceError> + Send + Sync>;

#[derive(Clone, Default)]
pub struct PathRegistry {
    /// Sorted by prefix length, longest first.
    handlers: Vec<(String, PathHandler)>,
}

impl PathRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry every built-in source uses: frame lookup under `/Car/`,
    /// `/Session/` and `/Track/`, plus the `/Command/Ping` and `/Command/Tick`
    /// one-shot commands.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        for prefix in ["/Car/", "/Session/", "/Track/"] {
            registry.register(prefix, frame_lookup);
        }
        registry.register("/Command/Ping", |ctx, _req| {
            Ok(Value::new(json!("pong"), "", "pong", ValueState::Normal, ctx.tick).into_one_shot())
        });
        registry.register("/Command/Tick", |ctx, _req| {
            Ok(Value::new(
                json!(ctx.tick),
                "",
                ctx.tick.to_string(),
                ValueState::Normal,
                ctx.tick,
            )
            .into_one_shot())
        });
        registry
    }

    /// Registers `handler` under `prefix`, replacing any handler already there.
    pub fn register<F>(&mut self, prefix: impl Into<String>, handler: F)
    where
        F: Fn(&PathContext<'_>, &QueryRequest<'_>) -> Result<Value, SourceError> + Send + Sync + 'static,
    {
        let prefix = prefix.into();
        self.handlers.retain(|(p, _)| *p != prefix);
        self.handlers.push((prefix, Arc::new(handler)));
        self.handlers.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
    }

    pub fn prefixes(&self) -> impl Iterator<Item = &str> {
        self.handlers.iter().map(|(p, _)| p.as_str())
    }

    /// Answers `request` from `ctx`.
    pub fn resolve(&self, ctx: &PathContext<'_>, request: &QueryRequest<'_>) -> Result<Value, SourceError> {
        let handler = self
            .handlers
            .iter()
            .find(|(prefix, _)| request.path.starts_with(prefix.as_str()))
            .map(|(_, h)| h)
            .ok_or_else(|| SourceError::UnknownPath(request.path.to_string()))?;
        handler(ctx, request)
    }
}

/// Handler that reads the full path out of the current frame.
pub fn frame_lookup(ctx: &PathContext<'_>, request: &QueryRequest<'_>) -> Result<Value, SourceError> {
    let reading = ctx
        .frame
        .reading(request.path)
        .ok_or_else(|| SourceError::UnknownPath(request.path.to_string()))?;
    build_value(reading, request, ctx.tick)
}

/// Turns a raw reading into a [`Value`] honoring the requested unit, format and
/// locale. Numbers are converted; other scalars pass through untouched.
pub fn build_value(reading: Reading, request: &QueryRequest<'_>, tick: SnapshotId) -> Result<Value, SourceError> {
    let Some(number) = reading.raw.as_f64() else {
        let formatted = match &reading.raw {
            Json::String(s) => s.clone(),
            Json::Null => String::new(),
            other => other.to_string(),
        };
        return Ok(Value::new(reading.raw, reading.unit, formatted, reading.state, tick));
    };

    let target = match request.unit {
        "" => reading.unit.clone(),
        requested => units::canonical(requested)
            .map(str::to_string)
            .unwrap_or_else(|| requested.to_string()),
    };
    let (raw, shown) = if target == reading.unit {
        (reading.raw, number)
    } else {
        let converted = units::convert(number, &reading.unit, &target)
            .map_err(|e| SourceError::Fault(e.to_string()))?;
        (Json::from(converted), converted)
    };
    let formatted = units::format_number(shown, request.format, request.locale);
    Ok(Value::new(raw, target, formatted, reading.state, tick))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame() -> TelemetryFrame {
        TelemetryFrame::new(10)
            .with_value("/Car/ME/Speed", 30.0, "m/s")
            .with_value("/Car/ME/Gear", 4, "")
            .with_value("/Session/Flag", "green", "")
            .with_state("/Car/ME/Gear", ValueState::Warning)
    }

    fn query(registry: &PathRegistry, request: QueryRequest<'_>) -> Result<Value, SourceError> {
        let frame = frame();
        registry.resolve(&PathContext { tick: 3, frame: &frame }, &request)
    }

    #[test]
    fn frame_paths_resolve_with_native_units() {
        let registry = PathRegistry::with_defaults();
        let speed = query(&registry, QueryRequest::raw("/Car/ME/Speed")).unwrap();
        assert_eq!(speed.raw, json!(30.0));
        assert_eq!(speed.uom, "m/s");
        assert_eq!(speed.formatted, "30");
        assert_eq!(speed.changed_at, 3);

        let gear = query(&registry, QueryRequest::raw("/Car/ME/Gear")).unwrap();
        assert_eq!(gear.raw, json!(4));
        assert_eq!(gear.state, ValueState::Warning);

        let flag = query(&registry, QueryRequest::raw("/Session/Flag")).unwrap();
        assert_eq!(flag.formatted, "green");
    }

    #[test]
    fn requested_unit_format_and_locale_apply() {
        let registry = PathRegistry::with_defaults();
        let request = QueryRequest {
            path: "/Car/ME/Speed",
            unit: "kph",
            format: "0.0",
            locale: "de-DE",
        };
        let speed = query(&registry, request).unwrap();
        assert_eq!(speed.uom, "km/h");
        assert_eq!(speed.formatted, "108,0");
        assert!((speed.raw.as_f64().unwrap() - 108.0).abs() < 1e-9);
    }

    #[test]
    fn incompatible_unit_is_a_fault() {
        let registry = PathRegistry::with_defaults();
        let request = QueryRequest {
            unit: "bar",
            ..QueryRequest::raw("/Car/ME/Speed")
        };
        assert!(matches!(query(&registry, request), Err(SourceError::Fault(_))));
    }

    #[test]
    fn unknown_paths_are_reported() {
        let registry = PathRegistry::with_defaults();
        assert_eq!(
            query(&registry, QueryRequest::raw("/Car/ME/Nope")),
            Err(SourceError::UnknownPath("/Car/ME/Nope".into()))
        );
        assert_eq!(
            query(&registry, QueryRequest::raw("/Weather/Rain")),
            Err(SourceError::UnknownPath("/Weather/Rain".into()))
        );
    }

    #[test]
    fn commands_are_one_shot_and_longest_prefix_wins() {
        let mut registry = PathRegistry::with_defaults();
        registry.register("/Car/ME/Pit", |ctx, _req| {
            Ok(Value::new(json!(true), "", "pit", ValueState::Normal, ctx.tick))
        });

        let pong = query(&registry, QueryRequest::raw("/Command/Ping")).unwrap();
        assert!(pong.one_shot);
        assert_eq!(pong.raw, json!("pong"));

        let tick = query(&registry, QueryRequest::raw("/Command/Tick")).unwrap();
        assert_eq!(tick.raw, json!(3));

        let pit = query(&registry, QueryRequest::raw("/Car/ME/PitLimiter")).unwrap();
        assert_eq!(pit.formatted, "pit");
        assert_eq!(registry.prefixes().next(), Some("/Command/Ping"));
    }
}
