//! Sensor Watchdog: a single periodic task that flags labs with stale
//! sensor data. It never deletes data and never emits commands — staleness
//! is purely advisory, surfaced through `alerts.sensor_offline` for whoever
//! reads State Memory (the HTTP snapshot endpoint, eventually a dashboard).

use std::time::Duration;

use crate::state::SharedStateMemory;

pub async fn run(state: SharedStateMemory, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    let interval_sec = interval.as_secs() as i64;
    loop {
        ticker.tick().await;
        state.run_watchdog_tick(interval_sec).await;
    }
}
