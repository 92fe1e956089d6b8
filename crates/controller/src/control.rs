//! Control Unit: one background task per lab that ticks on a fixed
//! interval, asks the Rules Engine for the commands its lab's current
//! snapshot implies, and publishes any that result. Threshold updates are
//! picked up by re-reading state memory (which is the threshold's source of
//! truth); the device catalog's actuator index is shared read-only via
//! `ArcSwap` so a catalog reload never blocks or races a running tick.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::bridge;
use crate::bus::BusAdapter;
use crate::catalog::{ActuatorIndex, Thresholds};
use crate::rules;
use crate::state::SharedStateMemory;

/// Grace period given to a Control Unit's tick loop to notice the stop
/// signal and exit cleanly before the handle gives up waiting on it.
const STOP_GRACE: Duration = Duration::from_secs(1);

pub struct ControlUnitHandle {
    lab_id: String,
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ControlUnitHandle {
    /// Spawns the tick loop and returns a handle to it. `index` is shared
    /// with every other lab's Control Unit and the Catalog Watcher; only the
    /// watcher ever swaps it.
    pub fn spawn(
        lab_id: String,
        state: SharedStateMemory,
        bus: Arc<BusAdapter>,
        index: Arc<ArcSwap<ActuatorIndex>>,
        tick_interval: Duration,
    ) -> Self {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let task_lab_id = lab_id.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        tick(&task_lab_id, &state, &bus, &index).await;
                    }
                    _ = stop_rx.changed() => {
                        if *stop_rx.borrow() {
                            info!(lab = %task_lab_id, "control unit stopping");
                            break;
                        }
                    }
                }
            }
        });
        Self { lab_id, stop_tx, task }
    }

    /// Persist new thresholds for this lab; picked up by the next tick since
    /// `tick` always re-reads the live snapshot from state memory.
    pub async fn update_thresholds(&self, state: &SharedStateMemory, thresholds: Thresholds) {
        state.set_thresholds(&self.lab_id, thresholds).await;
    }

    /// Signal the tick loop to stop and wait up to [`STOP_GRACE`] for it to
    /// exit; a loop that doesn't notice in time is aborted.
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        match tokio::time::timeout(STOP_GRACE, self.task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(lab = %self.lab_id, "control unit task panicked: {e}"),
            Err(_) => warn!(lab = %self.lab_id, "control unit did not stop within grace period, abandoning"),
        }
    }

    pub fn lab_id(&self) -> &str {
        &self.lab_id
    }
}

async fn tick(lab_id: &str, state: &SharedStateMemory, bus: &Arc<BusAdapter>, index: &Arc<ArcSwap<ActuatorIndex>>) {
    let Some(snapshot) = state.get_lab(lab_id).await else {
        return;
    };
    let thresholds = snapshot.thresholds;
    let index_guard = index.load();
    let commands = rules::decide(lab_id, &snapshot, &thresholds, &index_guard);
    for command in commands {
        info!(
            lab = %command.lab_id,
            actuator = %command.actuator_id,
            action = %command.action,
            "control unit issuing command"
        );
        if let Err(e) = bridge::send_command(bus, &command.lab_id, &command.actuator_id, &command.action, &command.source, command.ts).await {
            warn!(lab = %command.lab_id, actuator = %command.actuator_id, "failed to publish command: {e}");
        }
    }
}
