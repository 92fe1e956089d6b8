//! State Memory: the thread-safe, in-process store of the most recent
//! sensor readings, actuator feedback, thresholds, and staleness flags for
//! every lab. Every mutation and read is serialized by one exclusive lock;
//! every accessor returns a deep copy so callers never hold references into
//! the internal structure.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;

use crate::catalog::Thresholds;

/// Trailing-window size for the sensor moving average (§3: avg_t/avg_h over
/// the last 3 readings).
const HISTORY_WINDOW: usize = 3;

pub fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

// ---------------------------------------------------------------------------
// Snapshot types (returned by value — deep copies of internal state)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SensorReading {
    pub t: f64,
    pub h: f64,
    pub ts: i64,
    pub avg_t: f64,
    pub avg_h: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ActuatorState {
    pub state: String,
    pub ts: i64,
}

impl ActuatorState {
    pub fn is_on(&self) -> bool {
        self.state == "ON"
    }
}

#[derive(Debug, Clone, Serialize, Default, PartialEq)]
pub struct Alerts {
    pub sensor_offline: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct LabRuntime {
    pub sensors: HashMap<String, SensorReading>,
    pub actuators: HashMap<String, ActuatorState>,
    pub last_sensor_seen: i64,
    pub alerts: Alerts,
    pub thresholds: Thresholds,
}

impl LabRuntime {
    fn new(thresholds: Thresholds) -> Self {
        Self {
            sensors: HashMap::new(),
            actuators: HashMap::new(),
            last_sensor_seen: 0,
            alerts: Alerts::default(),
            thresholds,
        }
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

struct Inner {
    labs: HashMap<String, LabRuntime>,
    /// Per (lab_id, sensor_id) ring of the last `HISTORY_WINDOW` (t, h)
    /// samples, used only to compute avg_t/avg_h; not itself exposed.
    history: HashMap<String, HashMap<String, VecDeque<(f64, f64)>>>,
}

pub struct StateMemory {
    inner: Mutex<Inner>,
}

pub type SharedStateMemory = Arc<StateMemory>;

impl StateMemory {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                labs: HashMap::new(),
                history: HashMap::new(),
            }),
        }
    }

    /// Idempotently ensure runtime entries exist for every id in `ids`.
    pub async fn init_labs(&self, ids: &[String]) {
        let mut guard = self.inner.lock().await;
        for id in ids {
            guard
                .labs
                .entry(id.clone())
                .or_insert_with(|| LabRuntime::new(crate::catalog::DEFAULT_THRESHOLDS));
        }
    }

    /// Replace a lab's thresholds atomically, creating the lab if missing.
    pub async fn set_thresholds(&self, lab_id: &str, thresholds: Thresholds) {
        let mut guard = self.inner.lock().await;
        guard
            .labs
            .entry(lab_id.to_string())
            .or_insert_with(|| LabRuntime::new(thresholds))
            .thresholds = thresholds;
    }

    /// Feed a sensor reading: creates the lab if missing, recomputes the
    /// 3-sample trailing average, updates `last_sensor_seen`, and clears the
    /// sensor-offline alert.
    pub async fn update_sensor(&self, lab_id: &str, sensor_id: &str, t: f64, h: f64, ts: i64) {
        let mut guard = self.inner.lock().await;
        if !guard.labs.contains_key(lab_id) {
            guard
                .labs
                .insert(lab_id.to_string(), LabRuntime::new(crate::catalog::DEFAULT_THRESHOLDS));
        }

        let hist = guard
            .history
            .entry(lab_id.to_string())
            .or_default()
            .entry(sensor_id.to_string())
            .or_default();
        hist.push_back((t, h));
        if hist.len() > HISTORY_WINDOW {
            hist.pop_front();
        }
        let n = hist.len() as f64;
        let avg_t = hist.iter().map(|(t, _)| t).sum::<f64>() / n;
        let avg_h = hist.iter().map(|(_, h)| h).sum::<f64>() / n;

        let lab = guard.labs.get_mut(lab_id).expect("just inserted above");
        lab.sensors.insert(
            sensor_id.to_string(),
            SensorReading { t, h, ts, avg_t, avg_h },
        );
        lab.last_sensor_seen = lab.last_sensor_seen.max(ts);
        lab.alerts.sensor_offline = false;
        tracing::info!(lab = lab_id, sensor = sensor_id, t, h, ts, "sensor update");
    }

    /// Upsert device-reported actuator feedback, creating the lab if
    /// missing.
    pub async fn update_actuator_state(&self, lab_id: &str, actuator_id: &str, state: &str, ts: i64) {
        let mut guard = self.inner.lock().await;
        let lab = guard
            .labs
            .entry(lab_id.to_string())
            .or_insert_with(|| LabRuntime::new(crate::catalog::DEFAULT_THRESHOLDS));
        lab.actuators.insert(
            actuator_id.to_string(),
            ActuatorState { state: state.to_string(), ts },
        );
        tracing::info!(lab = lab_id, actuator = actuator_id, state, ts, "actuator feedback");
    }

    /// Deep-copy snapshot of one lab's runtime, or `None` if unknown.
    pub async fn get_lab(&self, lab_id: &str) -> Option<LabRuntime> {
        let guard = self.inner.lock().await;
        guard.labs.get(lab_id).cloned()
    }

    /// Deep-copy snapshot of every lab's runtime.
    pub async fn get_snapshot(&self) -> HashMap<String, LabRuntime> {
        let guard = self.inner.lock().await;
        guard.labs.clone()
    }

    /// `true` if `now - last_sensor_seen > max_age_sec`, or if the lab is
    /// unknown (treated conservatively as stale).
    pub async fn stale(&self, lab_id: &str, max_age_sec: i64) -> bool {
        let guard = self.inner.lock().await;
        match guard.labs.get(lab_id) {
            Some(lab) => now_unix() - lab.last_sensor_seen > max_age_sec,
            None => true,
        }
    }

    /// One watchdog tick: flips `alerts.sensor_offline` for every lab based
    /// on `now - last_sensor_seen > 2*interval_sec`. Called periodically by
    /// the Sensor Watchdog task.
    pub async fn run_watchdog_tick(&self, interval_sec: i64) {
        let now = now_unix();
        let mut guard = self.inner.lock().await;
        for (lab_id, lab) in guard.labs.iter_mut() {
            let offline = now - lab.last_sensor_seen > 2 * interval_sec;
            if offline && !lab.alerts.sensor_offline {
                tracing::warn!(lab = lab_id.as_str(), last_seen = lab.last_sensor_seen, now, "sensor offline detected");
            }
            lab.alerts.sensor_offline = offline;
        }
    }

    pub async fn lab_ids(&self) -> Vec<String> {
        let guard = self.inner.lock().await;
        guard.labs.keys().cloned().collect()
    }
}

impl Default for StateMemory {
    fn default() -> Self {
        Self::new()
    }
}
