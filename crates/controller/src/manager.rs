//! Controller Manager: the single per-process object that owns the bus
//! connection, State Memory, the Rules Engine's actuator index, and the
//! fleet of per-lab Control Units. Everything else in the binary talks to
//! the system through this handle.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use arc_swap::ArcSwap;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::bridge;
use crate::bus::BusAdapter;
use crate::catalog::{self, ActuatorIndex, Thresholds};
use crate::control::ControlUnitHandle;
use crate::state::SharedStateMemory;
use crate::watchdog;

pub struct Manager {
    catalog_dir: String,
    state: SharedStateMemory,
    bus: Arc<BusAdapter>,
    index: Arc<ArcSwap<ActuatorIndex>>,
    tick_interval: Duration,
    watchdog_interval: Duration,
    units: Mutex<HashMap<String, ControlUnitHandle>>,
    started: AtomicBool,
    watchdog_task: Mutex<Option<JoinHandle<()>>>,
}

impl Manager {
    pub fn new(
        catalog_dir: impl Into<String>,
        state: SharedStateMemory,
        bus: Arc<BusAdapter>,
        tick_interval: Duration,
        watchdog_interval: Duration,
    ) -> Self {
        Self {
            catalog_dir: catalog_dir.into(),
            state,
            bus,
            index: Arc::new(ArcSwap::from_pointee(ActuatorIndex::new())),
            tick_interval,
            watchdog_interval,
            units: Mutex::new(HashMap::new()),
            started: AtomicBool::new(false),
            watchdog_task: Mutex::new(None),
        }
    }

    /// Loads the catalog, wires the bridges, spawns one Control Unit per
    /// known lab, and starts the Sensor Watchdog. Calling `start` a second
    /// time is a no-op, not an error — the catalog lifecycle relies on being
    /// able to call it unconditionally at process startup.
    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            info!("manager start() called again — already running, ignoring");
            return Ok(());
        }

        let labs = catalog::load_labs(&self.catalog_dir).context("loading labs catalog at startup")?;
        let devices = catalog::load_devices(&self.catalog_dir).context("loading device catalog at startup")?;
        let thresholds_map =
            catalog::load_thresholds(&self.catalog_dir).context("loading thresholds catalog at startup")?;

        self.index.store(Arc::new(catalog::build_actuator_index(&devices)));

        let lab_ids: Vec<String> = labs.iter().map(|l| l.lab_id.clone()).collect();
        self.state.init_labs(&lab_ids).await;

        bridge::install_sensor_bridge(&self.bus, self.state.clone())
            .await
            .context("installing sensor bridge")?;
        bridge::install_actuator_bridge(&self.bus, self.state.clone())
            .await
            .context("installing actuator bridge")?;

        for lab_id in &lab_ids {
            let thresholds = catalog::resolve_thresholds(lab_id, &thresholds_map);
            self.state.set_thresholds(lab_id, thresholds).await;
            self.spawn_unit(lab_id.clone()).await;
        }

        let watchdog_state = self.state.clone();
        let interval = self.watchdog_interval;
        let handle = tokio::spawn(async move {
            watchdog::run(watchdog_state, interval).await;
        });
        *self.watchdog_task.lock().await = Some(handle);

        info!(labs = lab_ids.len(), "manager started");
        Ok(())
    }

    async fn spawn_unit(&self, lab_id: String) {
        let handle = ControlUnitHandle::spawn(
            lab_id.clone(),
            self.state.clone(),
            self.bus.clone(),
            self.index.clone(),
            self.tick_interval,
        );
        self.units.lock().await.insert(lab_id, handle);
    }

    /// Idempotent: spawns a Control Unit if `lab_id` has none yet, otherwise
    /// just updates its thresholds. Must be called after `start()`.
    pub async fn ensure_lab(&self, lab_id: &str, thresholds: Thresholds) -> Result<()> {
        if !self.started.load(Ordering::SeqCst) {
            bail!("ensure_lab called before start()");
        }
        self.state.set_thresholds(lab_id, thresholds).await;
        let exists = self.units.lock().await.contains_key(lab_id);
        if !exists {
            self.state.init_labs(&[lab_id.to_string()]).await;
            self.spawn_unit(lab_id.to_string()).await;
            info!(lab = lab_id, "control unit created");
        }
        Ok(())
    }

    /// Stops and drops the Control Unit for `lab_id`, if any is running.
    pub async fn remove_lab(&self, lab_id: &str) {
        let handle = self.units.lock().await.remove(lab_id);
        if let Some(handle) = handle {
            handle.stop().await;
            info!(lab = lab_id, "control unit removed");
        }
    }

    /// Manual command path: publishes straight to the bus, bypassing the
    /// Rules Engine. `source` identifies who issued the override (operator
    /// tooling, a future API, etc) and is published on the `cmd` topic
    /// alongside `action`/`ts`, not just logged.
    pub async fn send_command(&self, lab_id: &str, actuator_id: &str, action: &str, source: &str) -> Result<()> {
        let ts = crate::state::now_unix();
        info!(lab = lab_id, actuator = actuator_id, action, source, "manual command issued");
        bridge::send_command(&self.bus, lab_id, actuator_id, action, source, ts).await
    }

    /// Updates both the running Control Unit (if any) and State Memory for
    /// `lab_id`.
    pub async fn update_thresholds(&self, lab_id: &str, thresholds: Thresholds) -> Result<()> {
        self.state.set_thresholds(lab_id, thresholds).await;
        if let Some(handle) = self.units.lock().await.get(lab_id) {
            handle.update_thresholds(&self.state, thresholds).await;
        }
        Ok(())
    }

    /// Re-reads `devices.json` and swaps in a fresh actuator index; running
    /// Control Units pick it up on their next tick with no interruption.
    pub async fn reload_devices(&self) -> Result<()> {
        let devices = catalog::load_devices(&self.catalog_dir).context("reloading device catalog")?;
        self.index.store(Arc::new(catalog::build_actuator_index(&devices)));
        Ok(())
    }

    pub async fn running_labs(&self) -> Vec<String> {
        self.units.lock().await.keys().cloned().collect()
    }

    pub fn state(&self) -> SharedStateMemory {
        self.state.clone()
    }

    pub fn catalog_dir(&self) -> &str {
        &self.catalog_dir
    }

    /// Reconciliation step for the Catalog Watcher: ensure every lab in
    /// `wanted` is running with `merged_thresholds`, and stop every running
    /// lab not in `wanted`.
    pub async fn reconcile(&self, wanted: &HashSet<String>, merged_thresholds: &HashMap<String, Thresholds>) {
        let current: HashSet<String> = self.running_labs().await.into_iter().collect();

        for lab_id in wanted {
            let thresholds = merged_thresholds.get(lab_id).copied().unwrap_or(catalog::DEFAULT_THRESHOLDS);
            if let Err(e) = self.ensure_lab(lab_id, thresholds).await {
                warn!(lab = %lab_id, "reconcile: ensure_lab failed: {e}");
            }
        }
        for lab_id in current.difference(wanted) {
            self.remove_lab(lab_id).await;
        }
        for lab_id in wanted.intersection(&current) {
            let thresholds = merged_thresholds.get(lab_id).copied().unwrap_or(catalog::DEFAULT_THRESHOLDS);
            if let Err(e) = self.update_thresholds(lab_id, thresholds).await {
                warn!(lab = %lab_id, "reconcile: update_thresholds failed: {e}");
            }
        }
    }

    /// Stops every Control Unit (1s grace each, per unit) and disconnects
    /// the bus.
    pub async fn stop(&self) {
        if let Some(handle) = self.watchdog_task.lock().await.take() {
            handle.abort();
        }
        let units: Vec<(String, ControlUnitHandle)> = self.units.lock().await.drain().collect();
        for (lab_id, handle) in units {
            info!(lab = %lab_id, "stopping control unit");
            handle.stop().await;
        }
        self.bus.disconnect().await;
        info!("manager stopped");
    }
}
