use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use rumqttc::MqttOptions;
use serde::Serialize;
use tokio::{net::TcpListener, sync::Mutex, task::JoinHandle};
use tracing::{info, warn};

use smart_maic_common::{
    ConfigEntry, Descriptions, DeviceInfo, Entity, EntityState, EntryOptions, Snapshot, UserInput,
};

use crate::{
    flow::{self, FlowResult},
    gateway::{DeviceApi, HttpGateway},
    mqtt::MqttHub,
    session::{PlatformError, Session, FIRST_PAYLOAD_TIMEOUT},
    store::EntryStore,
};

const SETUP_RETRY_DELAY: Duration = Duration::from_secs(30);

enum EntrySlot {
    Loaded(Arc<Session>),
    SettingUp(JoinHandle<()>),
}

#[derive(Clone)]
struct AppState {
    slots: Arc<Mutex<HashMap<String, EntrySlot>>>,
    store: EntryStore,
    mqtt: MqttHub,
    descriptions: Arc<Descriptions>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Serialize)]
struct EntryView {
    #[serde(flatten)]
    entry: ConfigEntry,
    state: &'static str,
}

#[derive(Debug, Serialize)]
struct EntityView<'a> {
    entity_id: String,
    #[serde(flatten)]
    entity: &'a Entity,
    #[serde(rename = "enabledByDefault")]
    enabled_by_default: bool,
    state: EntityState,
}

#[derive(Debug, Serialize)]
struct EntitiesResponse<'a> {
    device: DeviceInfo,
    entities: Vec<EntityView<'a>>,
}

#[derive(Debug, Serialize)]
struct SnapshotResponse {
    data: Snapshot,
    #[serde(rename = "lastUpdateEpoch")]
    last_update_epoch: Option<i64>,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let descriptions = Descriptions::load().context("invalid entity description tables")?;
    let store = EntryStore::from_env();
    let entries = store.load_entries().await.unwrap_or_else(|err| {
        warn!("failed to load config entries from store: {err:#}");
        Vec::new()
    });

    let mqtt_host = std::env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let mqtt_port = std::env::var("MQTT_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(1883);

    let mut mqtt_options = MqttOptions::new("smart-maic-bridge", mqtt_host, mqtt_port);
    mqtt_options.set_keep_alive(Duration::from_secs(30));
    if let Ok(user) = std::env::var("MQTT_USER") {
        let pass = std::env::var("MQTT_PASS").unwrap_or_default();
        mqtt_options.set_credentials(user, pass);
    }

    let (mqtt, eventloop) = MqttHub::new(mqtt_options);
    mqtt.spawn_event_loop(eventloop);

    let app_state = AppState {
        slots: Arc::new(Mutex::new(HashMap::new())),
        store,
        mqtt,
        descriptions: Arc::new(descriptions),
    };

    for entry in entries {
        app_state.start_entry(entry).await;
    }

    let app = Router::new()
        .route("/api/entries", get(handle_list_entries).post(handle_create_entry))
        .route("/api/entries/{devid}", axum::routing::delete(handle_delete_entry))
        .route("/api/entries/{devid}/options", put(handle_put_options))
        .route("/api/entries/{devid}/entities", get(handle_get_entities))
        .route("/api/entries/{devid}/snapshot", get(handle_get_snapshot))
        .route("/api/entries/{devid}/wdata", get(handle_get_wdata))
        .route("/api/entries/{devid}/number/{key}", post(handle_set_number))
        .route("/api/entries/{devid}/switch/{key}/{action}", post(handle_switch))
        .with_state(app_state.clone());

    let port = std::env::var("BRIDGE_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind bridge server at {addr}"))?;

    info!("bridge listening on http://{addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    app_state.unload_all().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for shutdown signal: {err}");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}

fn gateway_for(entry: &ConfigEntry) -> Arc<dyn DeviceApi> {
    Arc::new(HttpGateway::new(
        entry.data.ip_address.clone(),
        entry.data.pin.clone(),
        entry.data.devid.clone(),
    ))
}

impl AppState {
    /// Sets the entry up in the background, retrying while it is not ready.
    async fn start_entry(&self, entry: ConfigEntry) {
        let entry_id = entry.entry_id().to_string();
        // Held across the spawn so the task cannot publish its session
        // before the placeholder is in.
        let mut slots = self.slots.lock().await;

        let state = self.clone();
        let task = tokio::spawn(async move {
            let mut entry = entry;
            let entry_id = entry.entry_id().to_string();
            loop {
                if let Some(stored) = state.stored_entry(&entry_id).await {
                    entry = stored;
                }
                match Session::setup(
                    entry.clone(),
                    gateway_for(&entry),
                    &state.mqtt,
                    &state.descriptions,
                    FIRST_PAYLOAD_TIMEOUT,
                )
                .await
                {
                    Ok(session) => {
                        // Options saved while setup was waiting are read
                        // under the slots lock, before the session is visible.
                        let mut slots = state.slots.lock().await;
                        if let Some(stored) = state.stored_entry(&entry_id).await {
                            session.apply_options(&stored.options).await;
                        }
                        slots.insert(entry_id, EntrySlot::Loaded(Arc::new(session)));
                        return;
                    }
                    Err(err) => {
                        warn!(
                            "setup of {entry_id} failed, retrying in {SETUP_RETRY_DELAY:?}: {err}"
                        );
                        tokio::time::sleep(SETUP_RETRY_DELAY).await;
                    }
                }
            }
        });

        if let Some(previous) = slots.insert(entry_id, EntrySlot::SettingUp(task)) {
            previous.shut_down(&self.mqtt).await;
        }
    }

    async fn stored_entry(&self, entry_id: &str) -> Option<ConfigEntry> {
        match self.store.load_entries().await {
            Ok(entries) => entries
                .into_iter()
                .find(|entry| entry.entry_id() == entry_id),
            Err(err) => {
                warn!("failed to load config entries: {err:#}");
                None
            }
        }
    }

    async fn stop_entry(&self, entry_id: &str) -> bool {
        let slot = self.slots.lock().await.remove(entry_id);
        match slot {
            Some(slot) => {
                slot.shut_down(&self.mqtt).await;
                true
            }
            None => false,
        }
    }

    async fn session(&self, entry_id: &str) -> Option<Arc<Session>> {
        match self.slots.lock().await.get(entry_id) {
            Some(EntrySlot::Loaded(session)) => Some(session.clone()),
            _ => None,
        }
    }

    async fn slot_state(&self, entry_id: &str) -> &'static str {
        match self.slots.lock().await.get(entry_id) {
            Some(EntrySlot::Loaded(_)) => "loaded",
            Some(EntrySlot::SettingUp(_)) => "setup_in_progress",
            None => "not_loaded",
        }
    }

    async fn unload_all(&self) {
        let slots: Vec<EntrySlot> = self.slots.lock().await.drain().map(|(_, slot)| slot).collect();
        for slot in slots {
            slot.shut_down(&self.mqtt).await;
        }
    }
}

impl EntrySlot {
    async fn shut_down(self, mqtt: &MqttHub) {
        match self {
            Self::Loaded(session) => session.unload(mqtt).await,
            Self::SettingUp(task) => task.abort(),
        }
    }
}

async fn handle_list_entries(State(state): State<AppState>) -> impl IntoResponse {
    let entries = match state.store.load_entries().await {
        Ok(entries) => entries,
        Err(err) => {
            warn!("failed to load config entries: {err:#}");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to load entries");
        }
    };

    let mut views = Vec::with_capacity(entries.len());
    for entry in entries {
        let slot_state = state.slot_state(entry.entry_id()).await;
        views.push(EntryView {
            entry,
            state: slot_state,
        });
    }
    Json(views).into_response()
}

async fn handle_create_entry(
    State(state): State<AppState>,
    Json(input): Json<UserInput>,
) -> impl IntoResponse {
    let existing = match state.store.load_entries().await {
        Ok(entries) => entries,
        Err(err) => {
            warn!("failed to load config entries: {err:#}");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to load entries");
        }
    };

    let api: Arc<dyn DeviceApi> = Arc::new(HttpGateway::new(
        input.ip_address.trim().to_string(),
        input.pin.clone(),
        String::new(),
    ));
    let result = flow::step_user(api, state.mqtt.is_connected(), input, &existing).await;

    let FlowResult::CreateEntry { entry } = &result else {
        return (StatusCode::BAD_REQUEST, Json(result)).into_response();
    };

    if let Err(err) = state.store.upsert(entry.clone()).await {
        warn!("failed to persist config entry: {err:#}");
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to persist entry");
    }
    state.start_entry(entry.clone()).await;

    (StatusCode::CREATED, Json(result)).into_response()
}

async fn handle_delete_entry(
    State(state): State<AppState>,
    Path(devid): Path<String>,
) -> impl IntoResponse {
    let stopped = state.stop_entry(&devid).await;
    let removed = match state.store.remove(&devid).await {
        Ok(removed) => removed,
        Err(err) => {
            warn!("failed to remove config entry: {err:#}");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to remove entry");
        }
    };

    if !stopped && !removed {
        return error_response(StatusCode::NOT_FOUND, "Unknown entry");
    }
    StatusCode::NO_CONTENT.into_response()
}

async fn handle_put_options(
    State(state): State<AppState>,
    Path(devid): Path<String>,
    Json(options): Json<EntryOptions>,
) -> impl IntoResponse {
    let options = match flow::step_options(options) {
        Ok(options) => options,
        Err(message) => return error_response(StatusCode::BAD_REQUEST, message),
    };

    let entry = match state.store.update_options(&devid, options.clone()).await {
        Ok(Some(entry)) => entry,
        Ok(None) => return error_response(StatusCode::NOT_FOUND, "Unknown entry"),
        Err(err) => {
            warn!("failed to persist options update: {err:#}");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to persist options");
        }
    };

    if let Some(session) = state.session(&devid).await {
        session.apply_options(&options).await;
    }
    Json(entry).into_response()
}

async fn handle_get_entities(
    State(state): State<AppState>,
    Path(devid): Path<String>,
) -> impl IntoResponse {
    let Some(session) = state.session(&devid).await else {
        return error_response(StatusCode::NOT_FOUND, "Entry is not loaded");
    };

    let snapshot = session.coordinator().data().await;
    let entities = session
        .entities()
        .iter()
        .map(|entity| EntityView {
            entity_id: entity.entity_id(),
            entity,
            enabled_by_default: entity.enabled_by_default(),
            state: entity.state(&snapshot),
        })
        .collect();

    Json(EntitiesResponse {
        device: DeviceInfo::for_entry(&session.entry().data),
        entities,
    })
    .into_response()
}

async fn handle_get_snapshot(
    State(state): State<AppState>,
    Path(devid): Path<String>,
) -> impl IntoResponse {
    let Some(session) = state.session(&devid).await else {
        return error_response(StatusCode::NOT_FOUND, "Entry is not loaded");
    };

    let coordinator = session.coordinator();
    Json(SnapshotResponse {
        data: coordinator.data().await,
        last_update_epoch: coordinator
            .last_updated_at()
            .await
            .map(|at| at.timestamp()),
    })
    .into_response()
}

async fn handle_get_wdata(
    State(state): State<AppState>,
    Path(devid): Path<String>,
) -> impl IntoResponse {
    let Some(session) = state.session(&devid).await else {
        return error_response(StatusCode::NOT_FOUND, "Entry is not loaded");
    };

    match session.coordinator().get_wdata().await {
        Ok(wdata) => Json(wdata).into_response(),
        Err(err) => {
            warn!("wdata read for {devid} failed: {err}");
            error_response(StatusCode::BAD_GATEWAY, "Cannot connect to device")
        }
    }
}

async fn handle_set_number(
    State(state): State<AppState>,
    Path((devid, key)): Path<(String, String)>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let Some(value) = params.get("value") else {
        return error_response(StatusCode::BAD_REQUEST, "Missing 'value' parameter");
    };
    let Ok(value) = value.parse::<f64>() else {
        return error_response(StatusCode::BAD_REQUEST, "Invalid number value");
    };
    let Some(session) = state.session(&devid).await else {
        return error_response(StatusCode::NOT_FOUND, "Entry is not loaded");
    };

    match session.set_number(&key, value).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => platform_error_response(err),
    }
}

async fn handle_switch(
    State(state): State<AppState>,
    Path((devid, key, action)): Path<(String, String, String)>,
) -> impl IntoResponse {
    let Some(session) = state.session(&devid).await else {
        return error_response(StatusCode::NOT_FOUND, "Entry is not loaded");
    };

    let result = match action.to_ascii_lowercase().as_str() {
        "on" => session.turn_on(&key).await,
        "off" => session.turn_off(&key).await,
        _ => return error_response(StatusCode::BAD_REQUEST, "Invalid action. Use 'on' or 'off'"),
    };

    match result {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => platform_error_response(err),
    }
}

fn platform_error_response(err: PlatformError) -> axum::response::Response {
    warn!("entity write failed: {err}");
    match err {
        PlatformError::UnknownEntity { .. } => {
            error_response(StatusCode::NOT_FOUND, "Unknown entity")
        }
        PlatformError::OutOfRange(_) => {
            error_response(StatusCode::BAD_REQUEST, "Value out of range")
        }
        PlatformError::Command(err) if err.is_connectivity() => {
            error_response(StatusCode::BAD_GATEWAY, "Cannot connect to device")
        }
        PlatformError::Command(_) => {
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Device command failed")
        }
    }
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
