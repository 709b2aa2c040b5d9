use std::{
    collections::BTreeMap,
    net::SocketAddr,
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use chrono::{DateTime, FixedOffset};
use chrono_tz::Tz;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{info, warn};

use agronode_common::{
    ports::{Clock, SettingsStore},
    schedule::ScheduleVersion,
    ClimateSwitch, ControlContext, ControllerCommand, ControllerKind, ControllerSnapshot, Device,
    DeviceError, Edge, Schedule, Settings, SharedSchedule, SwitchStatus, TOPIC_CMD_BUTTON_PREFIX,
    TOPIC_CMD_BUTTON_WILDCARD, TOPIC_CMD_SCHEDULE, TOPIC_CMD_SETTINGS, TOPIC_CMD_SWITCH_PREFIX,
    TOPIC_CMD_SWITCH_WILDCARD, TOPIC_DEVICE_LOG, TOPIC_DEVICE_STATE, TOPIC_SENSOR_PREFIX,
    TOPIC_SENSOR_WILDCARD,
};

use crate::{
    sim::{CountingWatchdog, LogEntry, MqttSensorBus, QueueLog, SimHardware, SystemClock},
    store::AppStore,
};

const MAX_MQTT_PAYLOAD_BYTES: usize = 16 * 1024;
const STATE_PUBLISH_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Clone)]
struct AppState {
    device: Arc<Device>,
    clock: Arc<SystemClock>,
    sensors: Arc<MqttSensorBus>,
    log: Arc<QueueLog>,
    watchdog: Arc<CountingWatchdog>,
    hardware: Arc<SimHardware>,
    mqtt: AsyncClient,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Serialize)]
struct StatusView {
    controllers: BTreeMap<String, ControllerKind>,
    now: DateTime<FixedOffset>,
    timezone: String,
    #[serde(rename = "watchdogFeeds")]
    watchdog_feeds: u64,
    schedule: ScheduleVersion,
}

#[derive(Debug, Deserialize)]
struct SwitchQuery {
    #[serde(default)]
    switch: Option<ClimateSwitch>,
}

#[derive(Debug, Deserialize)]
struct EdgeQuery {
    edge: Edge,
}

#[derive(Debug, Deserialize)]
struct InputQuery {
    asserted: bool,
}

#[derive(Debug, Deserialize)]
struct LogQuery {
    #[serde(default)]
    after: u64,
}

#[derive(Debug, Deserialize)]
struct TimezoneUpdate {
    timezone: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct TimeView {
    now: DateTime<FixedOffset>,
    #[serde(default)]
    timezone: Option<String>,
}

#[derive(Debug, Serialize)]
struct DeviceState<'a> {
    now: DateTime<FixedOffset>,
    controllers: &'a BTreeMap<String, ControllerSnapshot>,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store = Arc::new(AppStore::from_env());
    let runtime = store.load_runtime_config().unwrap_or_else(|err| {
        warn!("failed to load runtime config from store: {err}");
        Default::default()
    });
    let schedule = store.load_schedule().unwrap_or_else(|err| {
        warn!("failed to load schedule from store: {err}");
        Schedule::default()
    });

    let timezone = runtime
        .settings
        .timezone
        .as_deref()
        .and_then(|name| name.parse::<Tz>().ok())
        .unwrap_or(Tz::UTC);
    let clock = Arc::new(SystemClock::new(timezone));
    let sensors = Arc::new(MqttSensorBus::default());
    let log = Arc::new(QueueLog::new(clock.clone()));
    let watchdog = Arc::new(CountingWatchdog::default());
    let hardware = Arc::new(SimHardware::default());

    let ctx = ControlContext {
        clock: clock.clone(),
        sensors: sensors.clone(),
        store: store.clone(),
        log: log.clone(),
        watchdog: watchdog.clone(),
        schedule: SharedSchedule::new(schedule),
    };
    let device = Device::spawn(&runtime.device, runtime.settings, ctx, hardware.as_ref())
        .context("invalid runtime configuration")?;

    let mqtt_host = std::env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let mqtt_port = std::env::var("MQTT_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(1883);
    let mut mqtt_options = MqttOptions::new("agronode-controller", mqtt_host, mqtt_port);
    if let Ok(user) = std::env::var("MQTT_USER") {
        let pass = std::env::var("MQTT_PASS").unwrap_or_default();
        mqtt_options.set_credentials(user, pass);
    }
    let (mqtt, eventloop) = AsyncClient::new(mqtt_options, 64);

    let app_state = AppState {
        device: Arc::new(device),
        clock,
        sensors,
        log,
        watchdog,
        hardware,
        mqtt,
    };

    subscribe_topics(&app_state.mqtt).await?;
    spawn_mqtt_loop(app_state.clone(), eventloop);
    spawn_state_publish_loop(app_state.clone());

    let app = Router::new()
        .route("/api/status", get(handle_get_status))
        .route("/api/data", get(handle_get_data))
        .route("/api/switches", get(handle_get_switches))
        .route("/api/controllers", get(handle_get_controllers))
        .route("/api/switch/{name}/{action}", post(handle_switch))
        .route("/api/button/{line}", post(handle_button))
        .route("/api/input/{line}", put(handle_put_input))
        .route("/api/lines", get(handle_get_lines))
        .route(
            "/api/settings",
            get(handle_get_settings).put(handle_put_settings),
        )
        .route(
            "/api/schedule",
            get(handle_get_schedule).put(handle_put_schedule),
        )
        .route("/api/time", get(handle_get_time).put(handle_put_time))
        .route("/api/timezone", put(handle_put_timezone))
        .route("/api/log", get(handle_get_log))
        .with_state(app_state);

    let port = std::env::var("CONTROLLER_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind controller server at {addr}"))?;

    info!("controller listening on http://{addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn subscribe_topics(mqtt: &AsyncClient) -> anyhow::Result<()> {
    let topics = [
        TOPIC_SENSOR_WILDCARD,
        TOPIC_CMD_SWITCH_WILDCARD,
        TOPIC_CMD_BUTTON_WILDCARD,
        TOPIC_CMD_SETTINGS,
        TOPIC_CMD_SCHEDULE,
    ];

    for topic in topics {
        mqtt.subscribe(topic, QoS::AtMostOnce).await?;
    }
    Ok(())
}

fn spawn_mqtt_loop(app_state: AppState, mut eventloop: rumqttc::EventLoop) {
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(message))) => {
                    if let Err(err) =
                        handle_mqtt_message(&app_state, &message.topic, &message.payload).await
                    {
                        warn!("mqtt message handling error: {err:#}");
                    }
                }
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("mqtt connected");
                }
                Ok(_) => {}
                Err(err) => {
                    warn!("mqtt poll error: {err}");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });
}

fn spawn_state_publish_loop(app_state: AppState) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(STATE_PUBLISH_INTERVAL);
        let mut published_seq = 0;
        loop {
            interval.tick().await;

            let snapshots = app_state.device.snapshots();
            let state = DeviceState {
                now: app_state.clock.now(),
                controllers: &snapshots,
            };
            match serde_json::to_vec(&state) {
                Ok(body) => {
                    if let Err(err) = app_state
                        .mqtt
                        .publish(TOPIC_DEVICE_STATE, QoS::AtLeastOnce, true, body)
                        .await
                    {
                        warn!("device state publish failed: {err}");
                    }
                }
                Err(err) => warn!("device state serialization failed: {err}"),
            }

            let entries = app_state.log.since(published_seq);
            let Some(last) = entries.last().map(|entry| entry.seq) else {
                continue;
            };
            match serde_json::to_vec(&entries) {
                Ok(body) => match app_state
                    .mqtt
                    .publish(TOPIC_DEVICE_LOG, QoS::AtLeastOnce, false, body)
                    .await
                {
                    Ok(()) => published_seq = last,
                    Err(err) => warn!("event log publish failed: {err}"),
                },
                Err(err) => warn!("event log serialization failed: {err}"),
            }
        }
    });
}

async fn handle_mqtt_message(
    app_state: &AppState,
    topic: &str,
    payload: &[u8],
) -> anyhow::Result<()> {
    if payload.len() > MAX_MQTT_PAYLOAD_BYTES {
        warn!(
            "dropping oversized MQTT payload on topic {} ({} bytes)",
            topic,
            payload.len()
        );
        return Ok(());
    }
    let message = std::str::from_utf8(payload).context("non utf8 mqtt payload")?;

    if let Some(sensor_id) = topic.strip_prefix(TOPIC_SENSOR_PREFIX) {
        match message.trim().parse::<f32>() {
            Ok(value) if value.is_finite() => app_state.sensors.record(sensor_id, value),
            _ => warn!(sensor_id, "ignoring unreadable sensor value {message:?}"),
        }
        return Ok(());
    }

    if let Some(path) = topic.strip_prefix(TOPIC_CMD_SWITCH_PREFIX) {
        let (name, target) = match path.split_once('/') {
            Some((name, switch)) => (name, Some(parse_climate_switch(switch)?)),
            None => (path, None),
        };
        let on = match message.trim().to_ascii_uppercase().as_str() {
            "ON" => true,
            "OFF" => false,
            other => anyhow::bail!("switch payload must be ON or OFF, got {other:?}"),
        };
        app_state
            .device
            .command(name, ControllerCommand::Switch { target, on })
            .await?;
        return Ok(());
    }

    if let Some(line) = topic.strip_prefix(TOPIC_CMD_BUTTON_PREFIX) {
        let line: u8 = line.parse().context("button line must be a number")?;
        let edge: Edge = serde_json::from_value(serde_json::Value::String(
            message.trim().to_ascii_lowercase(),
        ))
        .context("button payload must be falling or rising")?;
        app_state.device.button_edge(line, edge).await?;
        return Ok(());
    }

    match topic {
        TOPIC_CMD_SETTINGS => {
            let settings: Settings = serde_json::from_str(message).context("invalid settings")?;
            apply_settings(app_state, settings).await?;
        }
        TOPIC_CMD_SCHEDULE => {
            let schedule: Schedule = serde_json::from_str(message).context("invalid schedule")?;
            app_state.device.replace_schedule(schedule)?;
        }
        _ => {}
    }
    Ok(())
}

fn parse_climate_switch(name: &str) -> anyhow::Result<ClimateSwitch> {
    serde_json::from_value(serde_json::Value::String(name.to_string()))
        .with_context(|| format!("unknown climate switch {name}"))
}

/// Applies settings to the device and keeps the clock's timezone in step.
async fn apply_settings(
    app_state: &AppState,
    settings: Settings,
) -> Result<Arc<Settings>, DeviceError> {
    let applied = app_state.device.update_settings(settings).await?;
    if let Some(tz) = applied
        .timezone
        .as_deref()
        .and_then(|name| name.parse::<Tz>().ok())
    {
        app_state.clock.set_timezone(tz);
    }
    Ok(applied)
}

async fn handle_get_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(StatusView {
        controllers: state.device.controller_kinds(),
        now: state.clock.now(),
        timezone: state.clock.timezone().name().to_string(),
        watchdog_feeds: state.watchdog.feeds(),
        schedule: state.device.context().schedule.snapshot().version(),
    })
}

async fn handle_get_data(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.device.data())
}

async fn handle_get_switches(
    State(state): State<AppState>,
) -> Json<BTreeMap<String, BTreeMap<String, SwitchStatus>>> {
    Json(state.device.switches())
}

async fn handle_get_controllers(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.device.snapshots())
}

async fn handle_switch(
    State(state): State<AppState>,
    Path((name, action)): Path<(String, String)>,
    Query(query): Query<SwitchQuery>,
) -> impl IntoResponse {
    let on = match action.as_str() {
        "on" => true,
        "off" => false,
        _ => return error_response(StatusCode::BAD_REQUEST, "Action must be 'on' or 'off'"),
    };
    let command = ControllerCommand::Switch {
        target: query.switch,
        on,
    };
    if let Err(err) = state.device.command(&name, command).await {
        return device_error_response(err);
    }
    StatusCode::ACCEPTED.into_response()
}

async fn handle_button(
    State(state): State<AppState>,
    Path(line): Path<u8>,
    Query(query): Query<EdgeQuery>,
) -> impl IntoResponse {
    if let Err(err) = state.device.button_edge(line, query.edge).await {
        return device_error_response(err);
    }
    StatusCode::ACCEPTED.into_response()
}

async fn handle_put_input(
    State(state): State<AppState>,
    Path(line): Path<u8>,
    Query(query): Query<InputQuery>,
) -> impl IntoResponse {
    state.hardware.set_input(line, query.asserted);
    StatusCode::NO_CONTENT
}

async fn handle_get_lines(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.hardware.output_levels())
}

async fn handle_get_settings(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.device.settings().as_ref().clone())
}

async fn handle_put_settings(
    State(state): State<AppState>,
    Json(settings): Json<Settings>,
) -> impl IntoResponse {
    match apply_settings(&state, settings).await {
        Ok(applied) => Json(applied.as_ref().clone()).into_response(),
        Err(err) => device_error_response(err),
    }
}

async fn handle_get_schedule(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.device.context().schedule.snapshot().as_ref().clone())
}

async fn handle_put_schedule(
    State(state): State<AppState>,
    Json(schedule): Json<Schedule>,
) -> impl IntoResponse {
    if let Err(err) = state.device.replace_schedule(schedule) {
        return device_error_response(err);
    }
    handle_get_schedule(State(state)).await.into_response()
}

async fn handle_get_time(State(state): State<AppState>) -> impl IntoResponse {
    Json(TimeView {
        now: state.clock.now(),
        timezone: Some(state.clock.timezone().name().to_string()),
    })
}

async fn handle_put_time(
    State(state): State<AppState>,
    Json(update): Json<TimeView>,
) -> impl IntoResponse {
    state.clock.set(update.now);
    handle_get_time(State(state)).await.into_response()
}

async fn handle_put_timezone(
    State(state): State<AppState>,
    Json(update): Json<TimezoneUpdate>,
) -> impl IntoResponse {
    if update.timezone.parse::<Tz>().is_err() {
        return error_response(StatusCode::BAD_REQUEST, "Invalid timezone value");
    }
    let mut settings = state.device.settings().as_ref().clone();
    settings.timezone = Some(update.timezone);
    if let Err(err) = apply_settings(&state, settings).await {
        return device_error_response(err);
    }
    handle_get_time(State(state)).await.into_response()
}

async fn handle_get_log(
    State(state): State<AppState>,
    Query(query): Query<LogQuery>,
) -> Json<Vec<LogEntry>> {
    Json(state.log.since(query.after))
}

fn device_error_response(err: DeviceError) -> axum::response::Response {
    let status = match err {
        DeviceError::Config(_) => StatusCode::BAD_REQUEST,
        DeviceError::UnknownController(_) => StatusCode::NOT_FOUND,
        DeviceError::ControllerStopped(_) => StatusCode::SERVICE_UNAVAILABLE,
    };
    error_response(status, &err.to_string())
}

fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}
