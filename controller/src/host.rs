use std::{
    collections::HashMap, io::ErrorKind, net::SocketAddr, path::PathBuf, sync::Arc,
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
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use serde::{Deserialize, Serialize};
use tokio::{
    net::TcpListener,
    sync::{mpsc, Mutex},
};
use tracing::{info, warn};

use fancoil_common::{
    build, entity_from_state_topic, find_duplicate, validate, ClimateState, ConfigError,
    EntryRecord, FanMode, HvacMode, RawConfig, TOPIC_ENTITY_STATE_FILTER,
};

use crate::supervisor::{Supervisor, ThermostatCommand};

const MAX_MQTT_PAYLOAD_BYTES: usize = 512;

#[derive(Clone)]
struct AppState {
    supervisor: Arc<Mutex<Supervisor>>,
    store: AppStore,
}

#[derive(Clone)]
struct AppStore {
    entries_path: Arc<PathBuf>,
    lock: Arc<Mutex<()>>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoredEntries {
    next_id: u64,
    entries: Vec<EntryRecord>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    field: Option<&'static str>,
}

#[derive(Debug, Deserialize)]
struct CreateEntryRequest {
    #[serde(default)]
    title: Option<String>,
    #[serde(flatten)]
    config: RawConfig,
}

#[derive(Debug, Serialize)]
struct EntryView {
    entry_id: String,
    title: String,
    state: Option<ClimateState>,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store = AppStore::new();
    let stored = store.load_entries().await.unwrap_or_else(|err| {
        warn!("failed to load entries from store: {err:#}");
        StoredEntries::default()
    });

    let mqtt_host = std::env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let mqtt_port = std::env::var("MQTT_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(1883);

    let mut mqtt_options = MqttOptions::new("fancoil-controller", mqtt_host, mqtt_port);
    if let Ok(user) = std::env::var("MQTT_USER") {
        let pass = std::env::var("MQTT_PASS").unwrap_or_default();
        mqtt_options.set_credentials(user, pass);
    }

    let (mqtt, eventloop) = AsyncClient::new(mqtt_options, 64);
    mqtt.subscribe(TOPIC_ENTITY_STATE_FILTER, QoS::AtMostOnce)
        .await
        .context("failed to subscribe to entity state topics")?;

    let supervisor = Arc::new(Mutex::new(Supervisor::new(mqtt)));

    // Re-hydrate persisted entries. Entity states have not been mirrored
    // yet, so only the range rules apply here; each thermostat idles until
    // its sensor reports.
    {
        let mut supervisor = supervisor.lock().await;
        for record in &stored.entries {
            match build(&record.merged()) {
                Ok(config) => supervisor.spawn_entry(&record.entry_id, config, None),
                Err(err) => warn!("skipping persisted entry {}: {err}", record.entry_id),
            }
        }
    }

    let (entity_tx, entity_rx) = mpsc::unbounded_channel();
    spawn_mqtt_loop(entity_tx, eventloop);
    spawn_dispatch_loop(supervisor.clone(), entity_rx);

    let app_state = AppState { supervisor, store };
    let app = Router::new()
        .route(
            "/api/entries",
            get(handle_list_entries).post(handle_create_entry),
        )
        .route(
            "/api/entries/{id}",
            get(handle_get_entry).delete(handle_delete_entry),
        )
        .route("/api/entries/{id}/options", put(handle_update_options))
        .route(
            "/api/entries/{id}/temperature",
            post(handle_set_temperature),
        )
        .route("/api/entries/{id}/mode", post(handle_set_mode))
        .route("/api/entries/{id}/fan", post(handle_set_fan))
        .route("/api/entries/{id}/turn_on", post(handle_turn_on))
        .route("/api/entries/{id}/turn_off", post(handle_turn_off))
        .with_state(app_state);

    let port = std::env::var("FANCOIL_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);
    let addr: SocketAddr = format!("0.0.0.0:{port}").parse()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind controller server at {addr}"))?;

    info!("controller listening on http://{addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

fn spawn_mqtt_loop(
    entity_tx: mpsc::UnboundedSender<(String, String)>,
    mut eventloop: rumqttc::EventLoop,
) {
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(message))) => {
                    if message.payload.len() > MAX_MQTT_PAYLOAD_BYTES {
                        warn!(
                            "dropping oversized MQTT payload on topic {} ({} bytes)",
                            message.topic,
                            message.payload.len()
                        );
                        continue;
                    }
                    let Some(entity_id) = entity_from_state_topic(&message.topic) else {
                        continue;
                    };
                    let Ok(payload) = String::from_utf8(message.payload.to_vec()) else {
                        warn!("non utf8 payload on topic {}", message.topic);
                        continue;
                    };
                    let _ = entity_tx.send((entity_id.to_string(), payload));
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

// Dispatch runs apart from broker I/O: an entry reload can hold the
// supervisor lock while the old task finishes an outstanding publish, and
// the event loop must keep draining the client in the meantime.
fn spawn_dispatch_loop(
    supervisor: Arc<Mutex<Supervisor>>,
    mut entity_rx: mpsc::UnboundedReceiver<(String, String)>,
) {
    tokio::spawn(async move {
        while let Some((entity_id, payload)) = entity_rx.recv().await {
            let mut supervisor = supervisor.lock().await;
            supervisor.handle_entity_state(&entity_id, payload);
        }
    });
}

async fn handle_list_entries(State(state): State<AppState>) -> impl IntoResponse {
    let stored = match state.store.load_entries().await {
        Ok(stored) => stored,
        Err(err) => return store_error(err),
    };

    let supervisor = state.supervisor.lock().await;
    let mut entries = Vec::with_capacity(stored.entries.len());
    for record in stored.entries {
        let climate = supervisor.climate_state(&record.entry_id).await;
        entries.push(EntryView {
            entry_id: record.entry_id,
            title: record.title,
            state: climate,
        });
    }

    Json(entries).into_response()
}

async fn handle_create_entry(
    State(state): State<AppState>,
    Json(request): Json<CreateEntryRequest>,
) -> impl IntoResponse {
    let mut supervisor = state.supervisor.lock().await;
    let mut stored = match state.store.load_entries().await {
        Ok(stored) => stored,
        Err(err) => return store_error(err),
    };

    let config = match validate(&request.config, supervisor.entities()) {
        Ok(config) => config,
        Err(err) => return config_error(&err),
    };

    if find_duplicate(
        &stored.entries,
        &config.current_temperature_entity_id,
        &config.fan_entity_id,
        None,
    )
    .is_some()
    {
        return config_error(&ConfigError::AlreadyConfigured);
    }

    stored.next_id += 1;
    let entry_id = format!("entry-{}", stored.next_id);
    let title = request
        .title
        .unwrap_or_else(|| format!("Fan Coil Thermostat - {}", config.fan_entity_id));
    stored.entries.push(EntryRecord {
        entry_id: entry_id.clone(),
        title: title.clone(),
        data: request.config,
        options: RawConfig::default(),
    });

    if let Err(err) = state.store.save_entries(&stored).await {
        warn!("failed to persist new entry: {err:#}");
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to persist entries");
    }

    supervisor.spawn_entry(&entry_id, config, None);
    let climate = supervisor.climate_state(&entry_id).await;

    (
        StatusCode::CREATED,
        Json(EntryView {
            entry_id,
            title,
            state: climate,
        }),
    )
        .into_response()
}

async fn handle_get_entry(
    State(state): State<AppState>,
    Path(entry_id): Path<String>,
) -> impl IntoResponse {
    let supervisor = state.supervisor.lock().await;
    match supervisor.climate_state(&entry_id).await {
        Some(climate) => Json(climate).into_response(),
        None => error_response(StatusCode::NOT_FOUND, "Unknown entry"),
    }
}

async fn handle_update_options(
    State(state): State<AppState>,
    Path(entry_id): Path<String>,
    Json(options): Json<RawConfig>,
) -> impl IntoResponse {
    let mut supervisor = state.supervisor.lock().await;
    let mut stored = match state.store.load_entries().await {
        Ok(stored) => stored,
        Err(err) => return store_error(err),
    };

    let Some(index) = stored
        .entries
        .iter()
        .position(|record| record.entry_id == entry_id)
    else {
        return error_response(StatusCode::NOT_FOUND, "Unknown entry");
    };

    stored.entries[index].options = options;
    let merged = stored.entries[index].merged();

    let config = match validate(&merged, supervisor.entities()) {
        Ok(config) => config,
        Err(err) => return config_error(&err),
    };

    if find_duplicate(
        &stored.entries,
        &config.current_temperature_entity_id,
        &config.fan_entity_id,
        Some(&entry_id),
    )
    .is_some()
    {
        return config_error(&ConfigError::AlreadyConfigured);
    }

    if let Err(err) = state.store.save_entries(&stored).await {
        warn!("failed to persist options update: {err:#}");
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to persist entries");
    }

    supervisor.reload_entry(&entry_id, config).await;
    let climate = supervisor.climate_state(&entry_id).await;

    Json(EntryView {
        entry_id,
        title: stored.entries[index].title.clone(),
        state: climate,
    })
    .into_response()
}

async fn handle_delete_entry(
    State(state): State<AppState>,
    Path(entry_id): Path<String>,
) -> impl IntoResponse {
    let mut supervisor = state.supervisor.lock().await;
    let mut stored = match state.store.load_entries().await {
        Ok(stored) => stored,
        Err(err) => return store_error(err),
    };

    let before = stored.entries.len();
    stored.entries.retain(|record| record.entry_id != entry_id);
    if stored.entries.len() == before {
        return error_response(StatusCode::NOT_FOUND, "Unknown entry");
    }

    if let Err(err) = state.store.save_entries(&stored).await {
        warn!("failed to persist entry removal: {err:#}");
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to persist entries");
    }

    supervisor.remove_entry(&entry_id).await;
    StatusCode::NO_CONTENT.into_response()
}

async fn handle_set_temperature(
    State(state): State<AppState>,
    Path(entry_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let Some(value) = params.get("value") else {
        return error_response(StatusCode::BAD_REQUEST, "Missing 'value' parameter");
    };
    let Ok(target) = value.parse::<f32>() else {
        return error_response(StatusCode::BAD_REQUEST, "Invalid temperature value");
    };

    send_and_report(&state, &entry_id, ThermostatCommand::SetTemperature(target)).await
}

async fn handle_set_mode(
    State(state): State<AppState>,
    Path(entry_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let Some(value) = params.get("value") else {
        return error_response(StatusCode::BAD_REQUEST, "Missing 'value' parameter");
    };
    let Some(mode) = HvacMode::parse(value) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "Invalid mode. Use 'off', 'cool' or 'heat'",
        );
    };

    send_and_report(&state, &entry_id, ThermostatCommand::SetHvacMode(mode)).await
}

async fn handle_set_fan(
    State(state): State<AppState>,
    Path(entry_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let Some(value) = params.get("value") else {
        return error_response(StatusCode::BAD_REQUEST, "Missing 'value' parameter");
    };
    let Some(mode) = FanMode::parse(value) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "Invalid fan mode. Use 'auto', 'low', 'medium' or 'high'",
        );
    };

    send_and_report(&state, &entry_id, ThermostatCommand::SetFanMode(mode)).await
}

async fn handle_turn_on(
    State(state): State<AppState>,
    Path(entry_id): Path<String>,
) -> impl IntoResponse {
    send_and_report(&state, &entry_id, ThermostatCommand::TurnOn).await
}

async fn handle_turn_off(
    State(state): State<AppState>,
    Path(entry_id): Path<String>,
) -> impl IntoResponse {
    send_and_report(&state, &entry_id, ThermostatCommand::TurnOff).await
}

async fn send_and_report(
    state: &AppState,
    entry_id: &str,
    command: ThermostatCommand,
) -> axum::response::Response {
    let supervisor = state.supervisor.lock().await;
    if !supervisor.send_command(entry_id, command) {
        return error_response(StatusCode::NOT_FOUND, "Unknown entry");
    }

    // Queued behind the command, so the reply reflects it.
    match supervisor.climate_state(entry_id).await {
        Some(climate) => Json(climate).into_response(),
        None => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Thermostat is not running",
        ),
    }
}

impl AppStore {
    fn new() -> Self {
        let data_dir = std::env::var("FANCOIL_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.fancoil"));

        Self {
            entries_path: Arc::new(data_dir.join("entries.json")),
            lock: Arc::new(Mutex::new(())),
        }
    }

    async fn load_entries(&self) -> anyhow::Result<StoredEntries> {
        let _guard = self.lock.lock().await;
        match tokio::fs::read(self.entries_path.as_ref()).await {
            Ok(raw) => Ok(serde_json::from_slice::<StoredEntries>(&raw)?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(StoredEntries::default()),
            Err(err) => Err(err.into()),
        }
    }

    async fn save_entries(&self, stored: &StoredEntries) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        let path = self.entries_path.as_ref().clone();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let payload = serde_json::to_vec_pretty(stored)?;
        tokio::fs::write(path, payload).await?;
        Ok(())
    }
}

fn config_error(err: &ConfigError) -> axum::response::Response {
    let status = match err {
        ConfigError::AlreadyConfigured => StatusCode::CONFLICT,
        ConfigError::EntityNotFound { .. } | ConfigError::InvalidRange(_) => {
            StatusCode::BAD_REQUEST
        }
    };
    (
        status,
        Json(ErrorBody {
            error: err.code().to_string(),
            field: err.field(),
        }),
    )
        .into_response()
}

fn store_error(err: anyhow::Error) -> axum::response::Response {
    warn!("entry store unavailable: {err:#}");
    error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to load entries")
}

fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
            field: None,
        }),
    )
        .into_response()
}
