//! # Tick Scheduler
//!
//! Owns the tick loop. On every cycle it advances the source, reads the paths the
//! callback workers care about and fans the result out through the
//! [`CallbackDispatcher`]. While the source is down it sends an empty tick to
//! every worker once per waiting interval so plugins can reset their outputs.
//!
//! Sessions are not driven from here; they refresh on demand from transport
//! adapters and only share the source lock with this loop.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::core::dispatcher::{CallbackDispatcher, DispatchReport};
use crate::core::source::{SharedSource, TickPoll};
use crate::core::value::SnapshotId;
use crate::core::worker::Tick;

/// Operational states of the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationMode {
    /// The source is producing ticks.
    Streaming,
    /// The source is down; idle ticks go out once per waiting interval.
    Waiting,
    /// The loop has exited.
    Stopped,
}

#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    /// Period of the tick loop.
    pub tick_interval: Duration,
    /// Spacing of idle ticks while the source is down.
    pub waiting_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(16),
            waiting_interval: Duration::from_secs(1),
        }
    }
}

/// What one [`cycle`](TickScheduler::cycle) did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// A new tick went out.
    Dispatched(SnapshotId, DispatchReport),
    /// Same tick as last cycle; nothing sent.
    Unchanged,
    /// Source down; an idle tick went out.
    Idle(DispatchReport),
    /// Source down and the last idle tick is recent; nothing sent.
    Quiet,
}

/// Loop-local bookkeeping carried between cycles.
#[derive(Debug, Default)]
pub struct CycleState {
    last_tick: Option<SnapshotId>,
    last_idle: Option<Instant>,
}

pub struct TickScheduler {
    source: SharedSource,
    dispatcher: Arc<CallbackDispatcher>,
    config: SchedulerConfig,
    mode: RwLock<OperationMode>,
}

impl TickScheduler {
    pub fn new(source: SharedSource, dispatcher: Arc<CallbackDispatcher>, config: SchedulerConfig) -> Self {
        Self {
            source,
            dispatcher,
            config,
            mode: RwLock::new(OperationMode::Waiting),
        }
    }

    /// The main loop. Returns once `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!(
            "Tick scheduler started (tick {:?}, waiting {:?})",
            self.config.tick_interval,
            self.config.waiting_interval
        );
        let mut ticker = tokio::time::interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut state = CycleState::default();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.cycle(&mut state, Instant::now());
                }
            }
        }

        self.set_mode(OperationMode::Stopped);
        tracing::info!("Tick scheduler stopped.");
    }

    /// One scheduler step at `now`.
    pub fn cycle(&self, state: &mut CycleState, now: Instant) -> CycleOutcome {
        let paths = self.dispatcher.subscribed_paths();
        match self.source.poll_tick(state.last_tick, &paths) {
            TickPoll::Fresh(id, values) => {
                self.set_mode(OperationMode::Streaming);
                state.last_tick = Some(id);
                state.last_idle = None;
                let report = self.dispatcher.dispatch(&Tick::new(id, values));
                if report.dropped > 0 {
                    tracing::debug!("Tick {}: {} worker(s) behind, tick dropped for them", id, report.dropped);
                }
                CycleOutcome::Dispatched(id, report)
            }
            TickPoll::Unchanged(_) => {
                self.set_mode(OperationMode::Streaming);
                CycleOutcome::Unchanged
            }
            TickPoll::Down => {
                self.set_mode(OperationMode::Waiting);
                state.last_tick = None;
                let due = state
                    .last_idle
                    .map_or(true, |at| now.saturating_duration_since(at) >= self.config.waiting_interval);
                if !due {
                    return CycleOutcome::Quiet;
                }
                state.last_idle = Some(now);
                CycleOutcome::Idle(self.dispatcher.dispatch(&Tick::idle()))
            }
        }
    }

    pub fn current_mode(&self) -> OperationMode {
        *self.mode.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_mode(&self, new_mode: OperationMode) {
        let mut mode = self.mode.write().unwrap_or_else(PoisonError::into_inner);
        if *mode != new_mode {
            tracing::info!("Transitioning mode: {:?} -> {:?}", *mode, new_mode);
            *mode = new_mode;
        }
    }
}
