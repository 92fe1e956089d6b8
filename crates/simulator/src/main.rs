//! Lab simulator: publishes synthetic sensor readings for every lab/sensor in
//! the device catalog and echoes actuator commands back as device feedback.
//!
//! Intended strictly for local development (enabled on the controller side
//! via `MOCK_SENSORS=1`); this binary has no dependency on the controller
//! crate and speaks only the bus topics documented for the core.

#[cfg(feature = "sim")]
mod sim;

#[cfg(not(feature = "sim"))]
compile_error!("the `sim` feature must be enabled to build lab-simulator");

use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    env,
    fs,
    time::Duration,
};
use tokio::time::sleep;

use sim::{ActuatorKind, LabPhysics, SensorKind};

#[derive(Debug, Deserialize)]
struct DeviceCatalog {
    #[serde(default)]
    sensors: Vec<SensorEntry>,
    #[serde(default)]
    actuators: Vec<ActuatorEntry>,
}

#[derive(Debug, Clone, Deserialize)]
struct SensorEntry {
    sensor_id: String,
    lab_id: String,
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ActuatorEntry {
    actuator_id: String,
    lab_id: String,
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Serialize)]
struct SensorStatePayload {
    t: f64,
    h: f64,
    ts: i64,
    sensor_id: String,
}

#[derive(Debug, Serialize)]
struct ActuatorStatePayload {
    state: String,
    ts: i64,
    actuator_id: String,
}

#[derive(Debug, Deserialize)]
struct CommandPayload {
    #[serde(default = "default_action")]
    action: String,
    #[serde(default)]
    ts: Option<i64>,
}

fn default_action() -> String {
    "OFF".to_string()
}

struct LabSim {
    physics: LabPhysics,
    sensors: Vec<SensorEntry>,
    actuators: Vec<ActuatorEntry>,
    actuator_state: HashMap<String, String>,
}

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

fn load_catalog(path: &str) -> anyhow::Result<HashMap<String, LabSim>> {
    let raw = fs::read_to_string(path)?;
    let catalog: DeviceCatalog = serde_json::from_str(&raw)?;
    let mut labs: HashMap<String, LabSim> = HashMap::new();
    for sensor in catalog.sensors {
        labs.entry(sensor.lab_id.clone())
            .or_insert_with(|| LabSim {
                physics: LabPhysics::new_ambient(),
                sensors: Vec::new(),
                actuators: Vec::new(),
                actuator_state: HashMap::new(),
            })
            .sensors
            .push(sensor);
    }
    for actuator in catalog.actuators {
        let lab = labs.entry(actuator.lab_id.clone()).or_insert_with(|| LabSim {
            physics: LabPhysics::new_ambient(),
            sensors: Vec::new(),
            actuators: Vec::new(),
            actuator_state: HashMap::new(),
        });
        lab.actuator_state
            .insert(actuator.actuator_id.clone(), "OFF".to_string());
        lab.actuators.push(actuator);
    }
    Ok(labs)
}

/// Parses `labs/{lab_id}/actuators/{actuator_id}/cmd`.
fn parse_cmd_topic(topic: &str) -> Option<(String, String)> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() == 5 && parts[0] == "labs" && parts[2] == "actuators" && parts[4] == "cmd" {
        Some((parts[1].to_string(), parts[3].to_string()))
    } else {
        None
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let broker = env::var("MQTT_HOST").unwrap_or_else(|_| "localhost".to_string());
    let port: u16 = env::var("MQTT_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1883);
    let catalog_dir = env::var("CATALOG_DIR").unwrap_or_else(|_| "./catalog".to_string());
    let devices_path = format!("{catalog_dir}/devices.json");
    let loop_sec: u64 = env::var("SIM_LOOP_SEC")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(5);

    let labs = std::sync::Arc::new(tokio::sync::Mutex::new(load_catalog(&devices_path)?));
    tracing::info!(path = %devices_path, labs = labs.lock().await.len(), "loaded device catalog");

    let mqttoptions = MqttOptions::new("lab-simulator", broker, port);
    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 10);

    client.subscribe("labs/+/actuators/+/cmd", QoS::AtLeastOnce).await?;

    // Publish initial OFF feedback so dashboards are never blank.
    {
        let now = now_unix();
        let guard = labs.lock().await;
        for (lab_id, lab) in guard.iter() {
            for actuator in &lab.actuators {
                let topic = format!("labs/{lab_id}/actuators/{}/state", actuator.actuator_id);
                let payload = ActuatorStatePayload {
                    state: "OFF".to_string(),
                    ts: now,
                    actuator_id: actuator.actuator_id.clone(),
                };
                let bytes = serde_json::to_vec(&payload)?;
                client.publish(&topic, QoS::AtLeastOnce, true, bytes).await?;
            }
        }
    }

    let command_labs = labs.clone();
    let command_client = client.clone();
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::Publish(msg))) => {
                    let Some((lab_id, actuator_id)) = parse_cmd_topic(&msg.topic) else {
                        continue;
                    };
                    let cmd: CommandPayload = match serde_json::from_slice(&msg.payload) {
                        Ok(c) => c,
                        Err(_) => continue,
                    };
                    let action = cmd.action.to_ascii_uppercase();
                    let ts = cmd.ts.unwrap_or_else(now_unix);

                    let mut guard = command_labs.lock().await;
                    if let Some(lab) = guard.get_mut(&lab_id) {
                        lab.actuator_state.insert(actuator_id.clone(), action.clone());
                    }
                    drop(guard);

                    let topic = format!("labs/{lab_id}/actuators/{actuator_id}/state");
                    let payload = ActuatorStatePayload {
                        state: action.clone(),
                        ts,
                        actuator_id: actuator_id.clone(),
                    };
                    if let Ok(bytes) = serde_json::to_vec(&payload) {
                        if let Err(e) = command_client.publish(&topic, QoS::AtLeastOnce, true, bytes).await {
                            tracing::error!("simulator: failed to echo actuator state: {e}");
                        }
                    }
                    tracing::info!(lab = %lab_id, actuator = %actuator_id, %action, "simulator echoed actuator feedback");
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::error!("mqtt error: {e} — retrying");
                    sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });

    loop {
        let now = now_unix();
        let mut guard = labs.lock().await;
        for (lab_id, lab) in guard.iter_mut() {
            let active: Vec<ActuatorKind> = lab
                .actuators
                .iter()
                .filter(|a| lab.actuator_state.get(&a.actuator_id).map(String::as_str) == Some("ON"))
                .filter_map(|a| ActuatorKind::from_str_lossy(&a.kind))
                .collect();
            lab.physics.step(&active);

            for sensor in &lab.sensors {
                let kind = SensorKind::from_str_lossy(&sensor.kind);
                let (t, h) = lab.physics.reading_for(kind);
                let topic = format!("labs/{lab_id}/sensors/{}/state", sensor.sensor_id);
                let payload = SensorStatePayload {
                    t,
                    h,
                    ts: now,
                    sensor_id: sensor.sensor_id.clone(),
                };
                if let Ok(bytes) = serde_json::to_vec(&payload) {
                    if let Err(e) = client.publish(&topic, QoS::AtLeastOnce, true, bytes).await {
                        tracing::error!("simulator: publish error: {e}");
                    }
                }
            }
        }
        drop(guard);

        sleep(Duration::from_secs(loop_sec)).await;
    }
}
