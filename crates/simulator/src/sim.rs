//! Stateful lab temperature/humidity simulator for local development.
//!
//! Models a simplified thermal/humidity response to actuator state:
//! - Gaussian per-tick drift (weather/ambient noise)
//! - Fan cools and dries the room slightly while ON
//! - Heater warms, humidifier/dehumidifier move humidity
//! - Occasional humidity spikes so the dehumidifier has something to react to
//! - Per-sensor-type jitter between co-located sensors in the same lab

use std::fmt;

/// Approximate a sample from N(0,1) using the Irwin-Hall method: sum of 12
/// uniform [0,1) values minus 6.
fn approx_std_normal() -> f64 {
    let mut sum: f64 = 0.0;
    for _ in 0..12 {
        sum += fastrand::f64();
    }
    sum - 6.0
}

fn gaussian(mean: f64, sigma: f64) -> f64 {
    mean + sigma * approx_std_normal()
}

/// Kind of actuator affecting the lab's physical state, mirrors the catalog's
/// actuator types without depending on the controller crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActuatorKind {
    Fan,
    Humidifier,
    Dehumidifier,
    Heater,
}

impl ActuatorKind {
    pub fn from_str_lossy(s: &str) -> Option<Self> {
        match s {
            "fan" => Some(Self::Fan),
            "humidifier" => Some(Self::Humidifier),
            "dehumidifier" => Some(Self::Dehumidifier),
            "heater" => Some(Self::Heater),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorKind {
    Temp,
    Hum,
    Other,
}

impl fmt::Display for SensorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Temp => write!(f, "temp"),
            Self::Hum => write!(f, "hum"),
            Self::Other => write!(f, "other"),
        }
    }
}

impl SensorKind {
    pub fn from_str_lossy(s: &str) -> Self {
        match s {
            "temp" => Self::Temp,
            "hum" => Self::Hum,
            _ => Self::Other,
        }
    }
}

/// Physical state of a single simulated lab, independent of its catalog
/// identity. `step` evolves `temp`/`hum` one tick given the set of actuators
/// currently ON.
pub struct LabPhysics {
    pub temp: f64,
    pub hum: f64,
}

impl LabPhysics {
    /// Start at a plausible ambient point with a small random spread so
    /// labs do not all start identically.
    pub fn new_ambient() -> Self {
        Self {
            temp: gaussian(26.0, 0.6).clamp(18.0, 35.0),
            hum: gaussian(50.0, 3.0).clamp(20.0, 90.0),
        }
    }

    /// Advance the simulated physical state by one tick given which
    /// actuator kinds are currently ON in this lab.
    pub fn step(&mut self, active: &[ActuatorKind]) {
        if active.contains(&ActuatorKind::Fan) {
            self.temp -= 0.3;
            self.hum -= 0.5;
        }
        for kind in active {
            match kind {
                ActuatorKind::Heater => self.temp += 0.5,
                ActuatorKind::Humidifier => self.hum += 1.0,
                ActuatorKind::Dehumidifier => self.hum -= 1.2,
                ActuatorKind::Fan => {}
            }
        }

        // Occasionally push humidity upward so the dehumidifier has to work.
        if fastrand::f64() < 0.1 {
            self.hum += gaussian(4.0, 1.0).max(2.0);
        }

        self.temp += gaussian(0.0, 0.12);
        self.hum += gaussian(0.0, 0.3);
        self.temp = self.temp.clamp(18.0, 35.0);
        self.hum = self.hum.clamp(20.0, 90.0);
    }

    /// Per-sensor reading derived from the lab's shared physical state, with
    /// small independent jitter so co-located sensors do not report
    /// identical numbers.
    pub fn reading_for(&self, kind: SensorKind) -> (f64, f64) {
        match kind {
            SensorKind::Temp => (self.temp + gaussian(0.0, 0.18), self.hum + gaussian(0.0, 0.12)),
            SensorKind::Hum => (self.temp + gaussian(0.0, 0.12), self.hum + gaussian(0.0, 0.35)),
            SensorKind::Other => (self.temp + gaussian(0.0, 0.18), self.hum + gaussian(0.0, 0.35)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ambient_start_within_bounds() {
        for _ in 0..100 {
            let lab = LabPhysics::new_ambient();
            assert!((18.0..=35.0).contains(&lab.temp));
            assert!((20.0..=90.0).contains(&lab.hum));
        }
    }

    #[test]
    fn fan_cools_and_dries() {
        let mut lab = LabPhysics { temp: 30.0, hum: 60.0 };
        let before = (lab.temp, lab.hum);
        lab.step(&[ActuatorKind::Fan]);
        assert!(lab.temp < before.0);
        assert!(lab.hum < before.1);
    }

    #[test]
    fn heater_warms() {
        // Average over many ticks since noise can mask a single-tick effect.
        let mut with_heater = LabPhysics { temp: 20.0, hum: 50.0 };
        let mut without = LabPhysics { temp: 20.0, hum: 50.0 };
        for _ in 0..30 {
            with_heater.step(&[ActuatorKind::Heater]);
            without.step(&[]);
        }
        assert!(with_heater.temp > without.temp);
    }

    #[test]
    fn dehumidifier_lowers_humidity_over_time() {
        let mut with_dehum = LabPhysics { temp: 26.0, hum: 75.0 };
        let mut without = LabPhysics { temp: 26.0, hum: 75.0 };
        for _ in 0..30 {
            with_dehum.step(&[ActuatorKind::Dehumidifier]);
            without.step(&[]);
        }
        assert!(with_dehum.hum < without.hum);
    }

    #[test]
    fn actuator_kind_from_str() {
        assert_eq!(ActuatorKind::from_str_lossy("fan"), Some(ActuatorKind::Fan));
        assert_eq!(ActuatorKind::from_str_lossy("heater"), Some(ActuatorKind::Heater));
        assert_eq!(ActuatorKind::from_str_lossy("bogus"), None);
    }

    #[test]
    fn sensor_kind_from_str_lossy_defaults_to_other() {
        assert_eq!(SensorKind::from_str_lossy("temp"), SensorKind::Temp);
        assert_eq!(SensorKind::from_str_lossy("hum"), SensorKind::Hum);
        assert_eq!(SensorKind::from_str_lossy("weird"), SensorKind::Other);
    }

    #[test]
    fn approx_std_normal_has_zero_mean() {
        let n = 5000;
        let sum: f64 = (0..n).map(|_| approx_std_normal()).sum();
        let mean = sum / n as f64;
        assert!(mean.abs() < 0.15, "approx_std_normal mean should be near zero: {mean}");
    }
}
