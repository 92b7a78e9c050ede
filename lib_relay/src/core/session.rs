//! # Subscription Sessions
//!
//! A session is a caller's bundle of subscriptions, grouped by caller-chosen
//! group ids, together with the last value served for each item.
//!
//! ## Refresh
//!
//! Items are refreshed on their own interval, but never in isolation: when a
//! refresh pass runs, every item whose interval is at or below the largest
//! interval among the *stale* items is re-read in the same pass. A composite view
//! ("position" next to "gap to leader") therefore always comes from one pass even
//! when the two items poll at different rates. The price is that fast items are
//! sometimes re-read a little before their own interval elapses.
//!
//! A pass is all-or-nothing: values are collected first and applied only when
//! the source answered every query, so a source going down halfway through
//! leaves the session exactly as it was.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::core::source::{QueryRequest, SharedSource, SourceError};
use crate::core::value::{Value, ValueView};

/// Refresh interval used when a subscription does not specify one.
pub const DEFAULT_INTERVAL_MS: u64 = 1000;

/// One requested item as it arrives on the wire:
/// `{"Name": "/Car/ME/Speed", "Format": "0.0", "UOM": "km/h", "Interval": 200}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ItemSpec {
    /// Source path.
    pub name: String,
    #[serde(default)]
    pub format: String,
    #[serde(default, rename = "UOM")]
    pub uom: String,
    /// Refresh interval in milliseconds.
    #[serde(default = "default_interval_ms")]
    pub interval: u64,
    #[serde(default)]
    pub locale: String,
}

fn default_interval_ms() -> u64 {
    DEFAULT_INTERVAL_MS
}

impl ItemSpec {
    pub fn new(path: impl Into<String>, interval_ms: u64) -> Self {
        Self {
            name: path.into(),
            format: String::new(),
            uom: String::new(),
            interval: interval_ms,
            locale: String::new(),
        }
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.uom = unit.into();
        self
    }

    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.format = format.into();
        self
    }

    pub fn with_locale(mut self, locale: impl Into<String>) -> Self {
        self.locale = locale.into();
        self
    }
}

/// group id → item name → spec.
pub type SubscriptionRequest = BTreeMap<String, BTreeMap<String, ItemSpec>>;

/// group id → item name → value. Only groups with a changed item appear.
pub type Diff = BTreeMap<String, BTreeMap<String, ValueView>>;

/// # Subscription Item
#[derive(Debug, Clone)]
pub struct SubscriptionItem {
    path: String,
    unit: String,
    format: String,
    locale: String,
    interval: Duration,
    value: Option<Value>,
    last_refreshed: Option<Instant>,
}

impl SubscriptionItem {
    pub fn from_spec(spec: &ItemSpec) -> Self {
        Self {
            path: spec.name.clone(),
            unit: spec.uom.clone(),
            format: spec.format.clone(),
            locale: spec.locale.clone(),
            interval: Duration::from_millis(spec.interval),
            value: None,
            last_refreshed: None,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// The only mutable part of an item's definition.
    pub fn set_interval(&mut self, interval: Duration) {
        self.interval = interval;
    }

    pub fn value(&self) -> Option<&Value> {
        self.value.as_ref()
    }

    pub fn last_refreshed(&self) -> Option<Instant> {
        self.last_refreshed
    }

    pub fn is_dirty(&self) -> bool {
        self.value.as_ref().is_some_and(|v| v.dirty)
    }

    /// Never refreshed, or its interval has fully elapsed.
    pub fn is_stale(&self, now: Instant) -> bool {
        match self.last_refreshed {
            None => true,
            Some(at) => now.saturating_duration_since(at) >= self.interval,
        }
    }

    fn request(&self) -> QueryRequest<'_> {
        QueryRequest {
            path: &self.path,
            unit: &self.unit,
            format: &self.format,
            locale: &self.locale,
        }
    }

    /// Stores `fresh` if it differs from the cached reading. The refresh time
    /// advances either way. Returns whether the item became dirty.
    fn apply(&mut self, fresh: Value, now: Instant) -> bool {
        self.last_refreshed = Some(now);
        match &self.value {
            Some(cached) if cached.same_reading(&fresh) => false,
            _ => {
                self.value = Some(Value { dirty: true, ..fresh });
                true
            }
        }
    }
}

/// # Subscription Group
///
/// Items refreshed and served together.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionGroup {
    items: BTreeMap<String, SubscriptionItem>,
}

impl SubscriptionGroup {
    pub fn item(&self, name: &str) -> Option<&SubscriptionItem> {
        self.items.get(name)
    }

    pub fn items(&self) -> impl Iterator<Item = (&String, &SubscriptionItem)> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn has_dirty(&self) -> bool {
        self.items.values().any(SubscriptionItem::is_dirty)
    }
}

/// What a refresh pass did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// Nothing was stale; the source was not touched.
    Fresh,
    /// The source is not running; nothing changed.
    SourceDown,
    /// `queried` items were re-read, `changed` of them became dirty.
    Refreshed { queried: usize, changed: usize },
}

/// # Subscription Session
#[derive(Debug, Clone)]
pub struct SubscriptionSession {
    id: String,
    groups: BTreeMap<String, SubscriptionGroup>,
    last_access: Instant,
}

impl SubscriptionSession {
    pub fn new(id: impl Into<String>, now: Instant) -> Self {
        Self {
            id: id.into(),
            groups: BTreeMap::new(),
            last_access: now,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn last_access(&self) -> Instant {
        self.last_access
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_access = now;
    }

    pub fn group(&self, id: &str) -> Option<&SubscriptionGroup> {
        self.groups.get(id)
    }

    pub fn item(&self, group: &str, item: &str) -> Option<&SubscriptionItem> {
        self.groups.get(group).and_then(|g| g.item(item))
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    pub fn item_count(&self) -> usize {
        self.groups.values().map(SubscriptionGroup::len).sum()
    }

    /// Adds every group and item of `request` that the session does not have yet.
    /// Existing items keep their cached value; only their interval follows the
    /// request. Returns the number of items added.
    pub fn merge(&mut self, request: &SubscriptionRequest) -> usize {
        let mut added = 0;
        for (group_id, specs) in request {
            let group = self.groups.entry(group_id.clone()).or_default();
            for (name, spec) in specs {
                match group.items.get_mut(name) {
                    Some(existing) => existing.set_interval(Duration::from_millis(spec.interval)),
                    None => {
                        group.items.insert(name.clone(), SubscriptionItem::from_spec(spec));
                        added += 1;
                    }
                }
            }
        }
        added
    }

    /// Runs one synchronized refresh pass at `now`.
    pub fn refresh(&mut self, source: &SharedSource, now: Instant) -> RefreshOutcome {
        let ceiling = self
            .groups
            .values()
            .flat_map(|g| g.items.values())
            .filter(|item| item.is_stale(now))
            .map(SubscriptionItem::interval)
            .max();
        let Some(ceiling) = ceiling else {
            return RefreshOutcome::Fresh;
        };

        // Read everything first; apply only if the whole pass succeeded.
        let mut fresh = Vec::new();
        for (group_id, group) in &self.groups {
            for (name, item) in &group.items {
                if item.interval > ceiling {
                    continue;
                }
                let value = match source.query(&item.request()) {
                    Ok(value) => value,
                    Err(SourceError::NotAvailable) => return RefreshOutcome::SourceDown,
                    Err(e) => {
                        tracing::debug!("Session '{}': {} failed: {}", self.id, item.path, e);
                        let tick = item.value.as_ref().map_or(0, |v| v.changed_at);
                        Value::error(e.to_string(), tick)
                    }
                };
                fresh.push((group_id.clone(), name.clone(), value));
            }
        }

        let queried = fresh.len();
        let mut changed = 0;
        for (group_id, name, value) in fresh {
            if let Some(item) = self
                .groups
                .get_mut(&group_id)
                .and_then(|g| g.items.get_mut(&name))
            {
                if item.apply(value, now) {
                    changed += 1;
                }
            }
        }
        RefreshOutcome::Refreshed { queried, changed }
    }

    /// Serializes every group holding a dirty item, clears the dirty bits of what
    /// was served and drops one-shot items that have now been surfaced.
    pub fn take_diff(&mut self) -> Diff {
        let mut diff = Diff::new();
        for (group_id, group) in self.groups.iter_mut() {
            if !group.has_dirty() {
                continue;
            }
            let mut served = BTreeMap::new();
            for (name, item) in group.items.iter_mut() {
                if let Some(value) = item.value.as_mut() {
                    served.insert(name.clone(), value.view());
                    value.dirty = false;
                }
            }
            group
                .items
                .retain(|_, item| !item.value.as_ref().is_some_and(|v| v.one_shot));
            diff.insert(group_id.clone(), served);
        }
        self.groups.retain(|_, group| !group.is_empty());
        diff
    }
}
