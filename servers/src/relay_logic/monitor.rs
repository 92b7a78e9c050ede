use std::time::Duration;

use tokio::time::interval;

use crate::relay_logic::state::AppState;

/// Sweeps idle sessions out of the cache every `sweep_interval` until shutdown.
pub async fn run(app_state: AppState, sweep_interval: Duration) {
    let Some(idle_timeout) = app_state.cache.idle_timeout() else {
        tracing::info!("Idle session eviction disabled.");
        return;
    };
    tracing::info!(
        "Monitor sweeping every {:?} for sessions idle longer than {:?}",
        sweep_interval,
        idle_timeout
    );
    let mut check_interval = interval(sweep_interval);

    loop {
        tokio::select! {
            _ = app_state.cancel.cancelled() => {
                tracing::info!("Monitor service received shutdown signal.");
                break;
            }
            _ = check_interval.tick() => {
                let evicted = app_state.cache.evict_idle();
                if !evicted.is_empty() {
                    tracing::info!(
                        "Evicted {} idle session(s); {} remain",
                        evicted.len(),
                        app_state.cache.len()
                    );
                }
            }
        }
    }
}
