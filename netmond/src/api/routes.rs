use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use tokio::sync::watch;
use crate::registry_manager::RegistryHandle;
use shared::mac::normalize_hardware_address;
use shared::protocol::API_PREFIX;
use shared::types::{Device, DeviceState};

#[derive(Clone)]
pub struct AppState {
    pub registry: RegistryHandle,
    pub hash_rx: watch::Receiver<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DeviceQuery {
    pub state: Option<DeviceState>,
    pub known: Option<bool>,
}

impl DeviceQuery {
    fn matches(&self, device: &Device) -> bool {
        self.state.map_or(true, |s| device.state == s)
            && self.known.map_or(true, |k| device.known == k)
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route(&format!("{API_PREFIX}/devices"), get(get_devices))
        .route(&format!("{API_PREFIX}/devices/hash"), get(get_hash))
        .route(&format!("{API_PREFIX}/devices/:mac"), get(get_device))
        .route(&format!("{API_PREFIX}/devices/:mac/promote"), post(promote_device))
        .with_state(state)
}

async fn get_devices(
    State(state): State<AppState>,
    Query(params): Query<DeviceQuery>,
) -> Result<Json<Vec<Device>>, StatusCode> {
    let devices = state.registry.load_all().await.map_err(|e| {
        tracing::error!("Failed to query devices: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    let mut devices: Vec<Device> = devices
        .into_values()
        .filter(|d| params.matches(d))
        .collect();
    devices.sort_by(|a, b| a.hardware_address.cmp(&b.hardware_address));

    Ok(Json(devices))
}

async fn get_hash(State(state): State<AppState>) -> String {
    state.hash_rx.borrow().clone()
}

async fn get_device(
    State(state): State<AppState>,
    Path(mac): Path<String>,
) -> Result<Json<Device>, StatusCode> {
    let mac = normalize_hardware_address(&mac).ok_or(StatusCode::BAD_REQUEST)?;

    state
        .registry
        .get(mac)
        .await
        .map_err(|e| {
            tracing::error!("Failed to query device: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

/// The only path that sets `known`; the reconciliation engine never does
async fn promote_device(
    State(state): State<AppState>,
    Path(mac): Path<String>,
) -> Result<Json<Device>, StatusCode> {
    let mac = normalize_hardware_address(&mac).ok_or(StatusCode::BAD_REQUEST)?;

    let promoted = state.registry.promote(mac.clone()).await.map_err(|e| {
        tracing::error!("Failed to promote device {}: {}", mac, e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    if !promoted {
        return Err(StatusCode::NOT_FOUND);
    }

    tracing::info!("Device {} promoted to known", mac);

    state
        .registry
        .get(mac)
        .await
        .map_err(|e| {
            tracing::error!("Failed to query device: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}
