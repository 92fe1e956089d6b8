//! Process configuration: every knob is an environment variable, per the
//! original deployment's environment contract. Nothing here touches the
//! filesystem except indirectly, through `catalog_dir`.

use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub control_loop_sec: u64,
    pub catalog_refresh_sec: u64,
    pub sensor_watchdog_sec: u64,
    pub catalog_dir: String,
    pub http_port: u16,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self {
            mqtt_host: env::var("MQTT_HOST").unwrap_or_else(|_| "localhost".to_string()),
            mqtt_port: env_parsed("MQTT_PORT", 1883),
            control_loop_sec: env_parsed("CONTROL_LOOP_SEC", 2),
            catalog_refresh_sec: env_parsed("CATALOG_REFRESH_SEC", 10),
            sensor_watchdog_sec: env_parsed("SENSOR_WATCHDOG_SEC", 30),
            catalog_dir: env::var("CATALOG_DIR").unwrap_or_else(|_| "./catalog".to_string()),
            http_port: env_parsed("HTTP_PORT", 8080),
        }
    }

    pub fn control_loop(&self) -> Duration {
        Duration::from_secs(self.control_loop_sec)
    }

    pub fn catalog_refresh(&self) -> Duration {
        Duration::from_secs(self.catalog_refresh_sec)
    }

    pub fn sensor_watchdog(&self) -> Duration {
        Duration::from_secs(self.sensor_watchdog_sec)
    }
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

/// Maps the legacy `LOG_LEVEL`/`LOG_LEVEL_ROOT` variables onto `RUST_LOG` for
/// continuity with the original deployment's environment contract, unless
/// `RUST_LOG` is already set explicitly.
pub fn apply_legacy_log_env() {
    if env::var("RUST_LOG").is_ok() {
        return;
    }
    if let Ok(level) = env::var("LOG_LEVEL") {
        env::set_var("RUST_LOG", format!("lab_controller={level}"));
    } else if let Ok(level) = env::var("LOG_LEVEL_ROOT") {
        env::set_var("RUST_LOG", level);
    }
}
