// HTTP handlers. Thin wrappers around the shared device registry, the
// Prometheus `Registry` and the connection state watch.
use std::sync::Arc;

use axum::extract::Extension;
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::Json;
use prometheus::{Encoder, Registry, TextEncoder};
use serde::Serialize;
use tokio::sync::watch;
use tracing::info;

use crate::connection::ConnectionState;
use crate::device::{DeviceRegistration, InMemoryDeviceRegistry};

#[derive(Debug, Serialize, PartialEq)]
pub struct HealthResponse {
    pub status: &'static str,
    pub connection: ConnectionState,
}

pub async fn health(Extension(state): Extension<watch::Receiver<ConnectionState>>) -> Json<HealthResponse> {
    let connection = *state.borrow();
    Json(HealthResponse { status: "ok", connection })
}

/// Return all registered devices, sorted by connection id.
pub async fn list_devices(Extension(registry): Extension<Arc<InMemoryDeviceRegistry>>) -> Json<Vec<DeviceRegistration>> {
    Json(registry.list())
}

/// Register or replace a device. New messages from that connection id are
/// attributed to it immediately.
pub async fn put_device(
    Extension(registry): Extension<Arc<InMemoryDeviceRegistry>>,
    Json(payload): Json<DeviceRegistration>,
) -> Result<StatusCode, (StatusCode, String)> {
    if payload.connection_id.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "connection_id must not be empty".to_string()));
    }
    info!(
        connection_id = %payload.connection_id,
        device_id = payload.device.id,
        device_name = %payload.device.name,
        "registering device"
    );
    registry.register(payload.connection_id, payload.device);
    Ok(StatusCode::CREATED)
}

/// Prometheus text-format metrics gathered from the shared `Registry`.
pub async fn metrics_handler(Extension(registry): Extension<Arc<Registry>>) -> (HeaderMap, String) {
    let encoder = TextEncoder::new();
    let metric_families = registry.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap_or_default();
    let body = String::from_utf8_lossy(&buffer).to_string();

    let mut headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(encoder.format_type()) {
        headers.insert(CONTENT_TYPE, value);
    }
    (headers, body)
}
