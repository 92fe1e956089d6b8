//! Sensor and Actuator Bridges: wire the Message Bus to State Memory.
//!
//! Inbound `.../sensors/{id}/state` and `.../actuators/{id}/state` messages
//! are decoded leniently — a malformed numeric field falls back to a
//! sentinel default rather than dropping the whole reading, since a partial
//! update is still more useful than none — and folded into [`StateMemory`].
//! Outbound actuator commands are published retained at QoS 1 so a device
//! that reconnects picks up the last desired state immediately.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::bus::BusAdapter;
use crate::state::{now_unix, SharedStateMemory};

/// Parses `labs/{lab_id}/sensors/{sensor_id}/state`.
pub fn parse_sensor_topic(topic: &str) -> Option<(String, String)> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() == 5 && parts[0] == "labs" && parts[2] == "sensors" && parts[4] == "state" {
        Some((parts[1].to_string(), parts[3].to_string()))
    } else {
        None
    }
}

/// Parses `labs/{lab_id}/actuators/{actuator_id}/state`.
pub fn parse_actuator_state_topic(topic: &str) -> Option<(String, String)> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() == 5 && parts[0] == "labs" && parts[2] == "actuators" && parts[4] == "state" {
        Some((parts[1].to_string(), parts[3].to_string()))
    } else {
        None
    }
}

/// Reads a numeric field out of a JSON object, defaulting to `default` when
/// absent or not a number.
fn num_or_default(value: &Value, key: &str, default: f64) -> f64 {
    value.get(key).and_then(Value::as_f64).unwrap_or(default)
}

/// Reads an integer timestamp field, defaulting to wall-clock now when
/// absent or malformed — devices are not trusted to carry a clock.
fn ts_or_now(value: &Value) -> i64 {
    value.get("ts").and_then(Value::as_i64).unwrap_or_else(now_unix)
}

fn state_or_off(value: &Value) -> String {
    value
        .get("state")
        .and_then(Value::as_str)
        .map(|s| s.to_ascii_uppercase())
        .unwrap_or_else(|| "OFF".to_string())
}

/// Subscribes the bus to every sensor-state topic and folds readings into
/// state memory as they arrive.
pub async fn install_sensor_bridge(bus: &Arc<BusAdapter>, state: SharedStateMemory) -> anyhow::Result<()> {
    bus.subscribe("labs/+/sensors/+/state", move |topic, value| {
        let Some((lab_id, sensor_id)) = parse_sensor_topic(&topic) else {
            debug!(topic, "sensor bridge: topic did not match pattern");
            return;
        };
        let t = num_or_default(&value, "t", 0.0);
        let h = num_or_default(&value, "h", 0.0);
        let ts = ts_or_now(&value);
        let state = state.clone();
        tokio::spawn(async move {
            state.update_sensor(&lab_id, &sensor_id, t, h, ts).await;
        });
    })
    .await
}

/// Subscribes the bus to every actuator-state (feedback) topic and folds
/// reported device state into state memory as it arrives.
pub async fn install_actuator_bridge(bus: &Arc<BusAdapter>, state: SharedStateMemory) -> anyhow::Result<()> {
    bus.subscribe("labs/+/actuators/+/state", move |topic, value| {
        let Some((lab_id, actuator_id)) = parse_actuator_state_topic(&topic) else {
            debug!(topic, "actuator bridge: topic did not match pattern");
            return;
        };
        let reported_state = state_or_off(&value);
        let ts = ts_or_now(&value);
        let state = state.clone();
        tokio::spawn(async move {
            state.update_actuator_state(&lab_id, &actuator_id, &reported_state, ts).await;
        });
    })
    .await
}

#[derive(Debug, Serialize)]
struct CommandOut<'a> {
    action: &'a str,
    source: &'a str,
    ts: i64,
}

/// Publishes a retained command to `labs/{lab_id}/actuators/{actuator_id}/cmd`.
pub async fn send_command(
    bus: &BusAdapter,
    lab_id: &str,
    actuator_id: &str,
    action: &str,
    source: &str,
    ts: i64,
) -> anyhow::Result<()> {
    let topic = format!("labs/{lab_id}/actuators/{actuator_id}/cmd");
    bus.publish_json(&topic, &CommandOut { action, source, ts }, true).await
}
