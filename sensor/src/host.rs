use std::time::Duration;

use anyhow::Context;
use rumqttc::{AsyncClient, MqttOptions, QoS};
use tracing::{info, warn};

use agronode_common::{sensor_topic, SensorRole};

const DEFAULT_SENSORS: &str = "t1:temperature,h1:humidity,c1:co2";
const ROLES: [SensorRole; 6] = [
    SensorRole::Temperature,
    SensorRole::Humidity,
    SensorRole::Co2,
    SensorRole::Pressure,
    SensorRole::Current,
    SensorRole::Voltage,
];

/// Parses `id:role` pairs separated by commas.
fn parse_sensors(list: &str) -> anyhow::Result<Vec<(String, SensorRole)>> {
    list.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (id, role) = entry
                .split_once(':')
                .with_context(|| format!("sensor entry {entry:?} must be id:role"))?;
            let role = ROLES
                .into_iter()
                .find(|candidate| candidate.as_str() == role.trim())
                .with_context(|| format!("unknown sensor role {role:?}"))?;
            Ok((id.trim().to_string(), role))
        })
        .collect()
}

/// Slowly varying reading around a plausible value for the role.
fn simulated_value(role: SensorRole, tick: u64) -> f32 {
    match role {
        SensorRole::Temperature => 24.0 + (tick % 8) as f32 * 0.5,
        SensorRole::Humidity => 55.0 + (tick % 6) as f32 * 1.5,
        SensorRole::Co2 => 900.0 + (tick % 10) as f32 * 180.0,
        SensorRole::Pressure => 1013.0 + (tick % 4) as f32 * 0.5,
        SensorRole::Current => 0.8 + (tick % 5) as f32 * 0.1,
        SensorRole::Voltage => 12.0 + (tick % 3) as f32 * 0.1,
    }
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let sensors = parse_sensors(
        &std::env::var("SENSOR_IDS").unwrap_or_else(|_| DEFAULT_SENSORS.to_string()),
    )?;
    let interval_s = std::env::var("SENSOR_INTERVAL_S")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(30);

    let mqtt_host = std::env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let mqtt_port = std::env::var("MQTT_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(1883);

    let mut mqtt_options = MqttOptions::new("agronode-sensor", mqtt_host, mqtt_port);

    if let Ok(user) = std::env::var("MQTT_USER") {
        let pass = std::env::var("MQTT_PASS").unwrap_or_default();
        mqtt_options.set_credentials(user, pass);
    }

    let (mqtt, mut eventloop) = AsyncClient::new(mqtt_options, 32);

    tokio::spawn(async move {
        loop {
            if let Err(err) = eventloop.poll().await {
                warn!("sensor mqtt poll error: {err}");
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
        }
    });

    info!(count = sensors.len(), interval_s, "sensor publisher started");

    let mut tick: u64 = 0;
    let mut interval = tokio::time::interval(Duration::from_secs(interval_s));

    loop {
        interval.tick().await;
        tick = tick.saturating_add(1);

        for (id, role) in &sensors {
            let payload = format!("{:.2}", simulated_value(*role, tick));
            mqtt.publish(sensor_topic(id), QoS::AtLeastOnce, true, payload)
                .await
                .with_context(|| format!("failed to publish sensor {id}"))?;
        }
    }
}
