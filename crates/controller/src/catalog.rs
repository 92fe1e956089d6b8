//! Catalog types and file I/O: labs, sensors, actuators, and per-lab
//! thresholds, loaded from the JSON catalog files and validated the way the
//! (out-of-scope) registry collaborator is expected to have written them.

use std::collections::HashMap;
use std::sync::OnceLock;

use anyhow::{bail, Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};

fn identifier_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z0-9_]+$").unwrap())
}

pub fn is_valid_identifier(s: &str) -> bool {
    identifier_re().is_match(s)
}

// ---------------------------------------------------------------------------
// Labs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Lab {
    pub lab_id: String,
    #[serde(default, rename = "name")]
    pub display_name: String,
    #[serde(default)]
    pub notes: String,
}

#[derive(Debug, Deserialize, Serialize, Default)]
struct LabsFile {
    #[serde(default)]
    last_update: Option<String>,
    #[serde(default)]
    labs: Vec<Lab>,
}

pub fn load_labs(catalog_dir: &str) -> Result<Vec<Lab>> {
    let path = format!("{catalog_dir}/labs.json");
    let raw = std::fs::read_to_string(&path).with_context(|| format!("reading {path}"))?;
    let file: LabsFile = serde_json::from_str(&raw).with_context(|| format!("parsing {path}"))?;
    for lab in &file.labs {
        if !is_valid_identifier(&lab.lab_id) {
            bail!("invalid lab_id '{}' in {path}", lab.lab_id);
        }
    }
    Ok(file.labs)
}

// ---------------------------------------------------------------------------
// Sensors / actuators
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorType {
    Temp,
    Hum,
    Other,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SensorDef {
    pub sensor_id: String,
    pub lab_id: String,
    #[serde(rename = "type")]
    pub kind: SensorType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ActuatorType {
    Fan,
    Humidifier,
    Dehumidifier,
    Heater,
}

impl ActuatorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fan => "fan",
            Self::Humidifier => "humidifier",
            Self::Dehumidifier => "dehumidifier",
            Self::Heater => "heater",
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ActuatorDef {
    pub actuator_id: String,
    pub lab_id: String,
    #[serde(rename = "type")]
    pub kind: ActuatorType,
}

#[derive(Debug, Deserialize, Serialize, Default)]
struct DevicesFile {
    #[serde(default)]
    last_update: Option<String>,
    #[serde(default)]
    sensors: Vec<SensorDef>,
    #[serde(default)]
    actuators: Vec<ActuatorDef>,
}

#[derive(Debug, Clone, Default)]
pub struct DeviceCatalog {
    pub sensors: Vec<SensorDef>,
    pub actuators: Vec<ActuatorDef>,
}

pub fn load_devices(catalog_dir: &str) -> Result<DeviceCatalog> {
    let path = format!("{catalog_dir}/devices.json");
    let raw = std::fs::read_to_string(&path).with_context(|| format!("reading {path}"))?;
    let file: DevicesFile = serde_json::from_str(&raw).with_context(|| format!("parsing {path}"))?;
    for s in &file.sensors {
        if !is_valid_identifier(&s.sensor_id) || !is_valid_identifier(&s.lab_id) {
            bail!("invalid identifier on sensor '{}' in {path}", s.sensor_id);
        }
    }
    for a in &file.actuators {
        if !is_valid_identifier(&a.actuator_id) || !is_valid_identifier(&a.lab_id) {
            bail!("invalid identifier on actuator '{}' in {path}", a.actuator_id);
        }
    }
    Ok(DeviceCatalog {
        sensors: file.sensors,
        actuators: file.actuators,
    })
}

/// `lab_id -> actuator_type -> [actuator_id]`, the Rules Engine's precomputed
/// lookup table. Swapped atomically behind an `ArcSwap` so readers never
/// observe a torn update (see the concurrency model).
pub type ActuatorIndex = HashMap<String, HashMap<ActuatorType, Vec<String>>>;

pub fn build_actuator_index(devices: &DeviceCatalog) -> ActuatorIndex {
    let mut index: ActuatorIndex = HashMap::new();
    for actuator in &devices.actuators {
        index
            .entry(actuator.lab_id.clone())
            .or_default()
            .entry(actuator.kind)
            .or_default()
            .push(actuator.actuator_id.clone());
    }
    index
}

// ---------------------------------------------------------------------------
// Thresholds
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct Thresholds {
    pub t_high: f64,
    pub t_low: f64,
    pub h_high: f64,
    pub h_low: f64,
    pub off_delay_sec: i64,
    pub hysteresis: f64,
}

pub const DEFAULT_THRESHOLDS: Thresholds = Thresholds {
    t_high: 28.0,
    t_low: 26.5,
    h_high: 70.0,
    h_low: 40.0,
    off_delay_sec: 60,
    hysteresis: 2.0,
};

/// A partial override merged on top of [`DEFAULT_THRESHOLDS`] or another
/// threshold set; mirrors `thresholds.json`'s per-field overrides.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct ThresholdsPatch {
    pub t_high: Option<f64>,
    pub t_low: Option<f64>,
    pub h_high: Option<f64>,
    pub h_low: Option<f64>,
    pub off_delay_sec: Option<i64>,
    pub hysteresis: Option<f64>,
}

impl ThresholdsPatch {
    fn apply(&self, base: Thresholds) -> Thresholds {
        Thresholds {
            t_high: self.t_high.unwrap_or(base.t_high),
            t_low: self.t_low.unwrap_or(base.t_low),
            h_high: self.h_high.unwrap_or(base.h_high),
            h_low: self.h_low.unwrap_or(base.h_low),
            off_delay_sec: self.off_delay_sec.unwrap_or(base.off_delay_sec),
            hysteresis: self.hysteresis.unwrap_or(base.hysteresis),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Default)]
struct ThresholdsFile {
    #[serde(default)]
    last_update: Option<String>,
    #[serde(default)]
    default: ThresholdsPatch,
    #[serde(default)]
    per_lab: HashMap<String, ThresholdsPatch>,
}

/// Resolved thresholds for every lab named in `thresholds.json`, plus a
/// `"_default"` entry used for labs with no explicit override (mirrors the
/// original `cu_instancer.load_thresholds` merge order: built-in defaults,
/// then the file's top-level `default`, then the per-lab patch).
pub type ThresholdsMap = HashMap<String, Thresholds>;

pub const DEFAULT_KEY: &str = "_default";

pub fn load_thresholds(catalog_dir: &str) -> Result<ThresholdsMap> {
    let path = format!("{catalog_dir}/thresholds.json");
    let raw = std::fs::read_to_string(&path).with_context(|| format!("reading {path}"))?;
    let file: ThresholdsFile = serde_json::from_str(&raw).with_context(|| format!("parsing {path}"))?;

    let default = file.default.apply(DEFAULT_THRESHOLDS);
    let mut out = ThresholdsMap::new();
    for (lab_id, patch) in &file.per_lab {
        out.insert(lab_id.clone(), patch.apply(default));
    }
    out.insert(DEFAULT_KEY.to_string(), default);
    Ok(out)
}

pub fn resolve_thresholds(lab_id: &str, map: &ThresholdsMap) -> Thresholds {
    map.get(lab_id)
        .copied()
        .unwrap_or_else(|| map.get(DEFAULT_KEY).copied().unwrap_or(DEFAULT_THRESHOLDS))
}

// ---------------------------------------------------------------------------
// Atomic file writes (write-temp-then-rename), for test fixtures and for
// completeness of the catalog contract the Catalog Watcher relies on.
// ---------------------------------------------------------------------------

pub fn write_json_atomic<T: Serialize>(path: &str, value: &T) -> Result<()> {
    let tmp = format!("{path}.tmp");
    let body = serde_json::to_string_pretty(value)?;
    std::fs::write(&tmp, body).with_context(|| format!("writing {tmp}"))?;
    std::fs::rename(&tmp, path).with_context(|| format!("renaming {tmp} -> {path}"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn tmp_dir(name: &str) -> String {
        let dir = std::env::temp_dir().join(format!("catalog-test-{name}-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir.to_str().unwrap().to_string()
    }

    #[test]
    fn identifier_validation() {
        assert!(is_valid_identifier("lab1"));
        assert!(is_valid_identifier("lab_1_a"));
        assert!(!is_valid_identifier("Lab1"));
        assert!(!is_valid_identifier("lab-1"));
        assert!(!is_valid_identifier(""));
    }

    #[test]
    fn load_labs_rejects_bad_identifier() {
        let dir = tmp_dir("labs-bad");
        std::fs::write(
            format!("{dir}/labs.json"),
            r#"{"last_update":"x","labs":[{"lab_id":"Bad-Id","name":"n","notes":""}]}"#,
        )
        .unwrap();
        assert!(load_labs(&dir).is_err());
    }

    #[test]
    fn load_labs_roundtrip() {
        let dir = tmp_dir("labs-ok");
        std::fs::write(
            format!("{dir}/labs.json"),
            r#"{"last_update":"x","labs":[{"lab_id":"lab1","name":"Lab One","notes":"n"}]}"#,
        )
        .unwrap();
        let labs = load_labs(&dir).unwrap();
        assert_eq!(labs.len(), 1);
        assert_eq!(labs[0].lab_id, "lab1");
        assert_eq!(labs[0].display_name, "Lab One");
    }

    #[test]
    fn build_actuator_index_groups_by_lab_and_type() {
        let devices = DeviceCatalog {
            sensors: vec![],
            actuators: vec![
                ActuatorDef { actuator_id: "f1".into(), lab_id: "lab1".into(), kind: ActuatorType::Fan },
                ActuatorDef { actuator_id: "f2".into(), lab_id: "lab1".into(), kind: ActuatorType::Fan },
                ActuatorDef { actuator_id: "h1".into(), lab_id: "lab1".into(), kind: ActuatorType::Heater },
            ],
        };
        let index = build_actuator_index(&devices);
        let fans: HashSet<_> = index["lab1"][&ActuatorType::Fan].iter().cloned().collect();
        assert_eq!(fans, HashSet::from(["f1".to_string(), "f2".to_string()]));
        assert_eq!(index["lab1"][&ActuatorType::Heater], vec!["h1".to_string()]);
    }

    #[test]
    fn thresholds_merge_defaults_then_overrides() {
        let dir = tmp_dir("thresholds");
        std::fs::write(
            format!("{dir}/thresholds.json"),
            r#"{
                "last_update": "x",
                "default": {"hysteresis": 3.0},
                "per_lab": {"lab1": {"t_high": 30.0}}
            }"#,
        )
        .unwrap();
        let map = load_thresholds(&dir).unwrap();
        let lab1 = resolve_thresholds("lab1", &map);
        assert_eq!(lab1.t_high, 30.0);
        assert_eq!(lab1.hysteresis, 3.0); // inherited from file-level default
        assert_eq!(lab1.t_low, DEFAULT_THRESHOLDS.t_low); // inherited from built-in default

        let other = resolve_thresholds("unknown_lab", &map);
        assert_eq!(other.hysteresis, 3.0);
        assert_eq!(other.t_high, DEFAULT_THRESHOLDS.t_high);
    }

    #[test]
    fn write_json_atomic_produces_readable_file() {
        let dir = tmp_dir("write");
        let path = format!("{dir}/out.json");
        write_json_atomic(&path, &serde_json::json!({"a": 1})).unwrap();
        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"a\""));
        assert!(!std::path::Path::new(&format!("{path}.tmp")).exists());
    }
}
