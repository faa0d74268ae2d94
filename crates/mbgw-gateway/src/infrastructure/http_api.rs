//! HTTP front-end built on axum.
//!
//! | Method     | Path             | Purpose                                   |
//! |------------|------------------|-------------------------------------------|
//! | GET / POST | `/connect`       | `?id=<u8>&port=<u16>[&host=<h>]` dial a device |
//! | POST       | `/modbus`        | JSON [`ModbusPayload`] → raw reply bytes  |
//! | GET        | `/stats`         | JSON array of per-device stats            |
//! | DELETE     | `/devices/{id}`  | close a device connection                 |
//!
//! `/modbus` answers with the device's reply ADU, unmodified, as
//! `application/octet-stream`.  Modbus exception replies are successful
//! exchanges and come back with status 200 as well.
//!
//! Errors are JSON: `{"error": "<message>", "status": <code>}`.

use std::future::Future;
use std::io;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{info, warn};

use super::payload::{log_device_exception, ModbusPayload};
use crate::application::manage_devices::DeviceManager;
use crate::application::route_request::RequestRouter;
use crate::{DeviceId, GatewayError};

/// Host dialed when `/connect` omits `host`.
pub const DEFAULT_DEVICE_HOST: &str = "127.0.0.1";

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct ApiState {
    pub router: Arc<RequestRouter>,
    pub devices: Arc<DeviceManager>,
}

// ── Error mapping ─────────────────────────────────────────────────────────────

impl GatewayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::DeviceNotConnected(_) => StatusCode::NOT_FOUND,
            GatewayError::Conflict(_) => StatusCode::CONFLICT,
            GatewayError::UnsupportedFunction(_) | GatewayError::InvalidRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            GatewayError::QueueFull(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::Io { .. }
            | GatewayError::MalformedFrame(_)
            | GatewayError::TransactionMismatch { .. }
            | GatewayError::ConnectionFailed { .. }
            | GatewayError::ConnectionClosed(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(json!({
            "error": self.to_string(),
            "status": status.as_u16()
        }));
        (status, body).into_response()
    }
}

// ── Router ────────────────────────────────────────────────────────────────────

pub fn build_router(state: ApiState) -> Router {
    Router::new()
        .route("/connect", get(connect_device).post(connect_device))
        .route("/modbus", post(modbus_request))
        .route("/stats", get(device_stats))
        .route("/devices/{id}", delete(disconnect_device))
        .with_state(state)
}

/// Serves the API on `listener` until `shutdown` resolves.
///
/// # Errors
///
/// Returns the I/O error that stopped the server.
pub async fn serve<F>(listener: TcpListener, state: ApiState, shutdown: F) -> io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        info!("HTTP API listening on {addr}");
    }
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

// ── Handlers ──────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ConnectParams {
    id: Option<DeviceId>,
    port: Option<u16>,
    host: Option<String>,
}

async fn connect_device(
    State(state): State<ApiState>,
    Query(params): Query<ConnectParams>,
) -> Result<String, GatewayError> {
    let (Some(id), Some(port)) = (params.id, params.port) else {
        return Err(GatewayError::InvalidRequest(
            "query parameters `id` and `port` are required".to_string(),
        ));
    };
    let host = params.host.as_deref().unwrap_or(DEFAULT_DEVICE_HOST);

    state.devices.connect(id, host, port).await?;
    Ok(format!("Slave {id} connected"))
}

async fn modbus_request(
    State(state): State<ApiState>,
    body: Bytes,
) -> Result<Response, GatewayError> {
    let call = ModbusPayload::from_json(&body)?.into_call();

    let reply = state.router.submit_default(&call).await.inspect_err(|e| {
        warn!(device_id = call.device_id, "modbus request failed: {e}");
    })?;
    log_device_exception(call.device_id, &reply);

    Ok(([(header::CONTENT_TYPE, "application/octet-stream")], reply).into_response())
}

async fn device_stats(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.devices.stats())
}

async fn disconnect_device(
    State(state): State<ApiState>,
    Path(id): Path<DeviceId>,
) -> Result<StatusCode, GatewayError> {
    if state.devices.disconnect(id) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(GatewayError::DeviceNotConnected(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::device_registry::DeviceRegistry;
    use crate::application::manage_devices::{DialedDevice, MockDeviceConnector};
    use crate::application::session::SessionConfig;
    use axum::body::{to_bytes, Body};
    use axum::http::{Method, Request};
    use mbgw_core::{encode_request, RegisterRequest};
    use tokio_test::io::Builder;
    use tower::ServiceExt;

    fn make_state(connector: MockDeviceConnector) -> (Arc<DeviceRegistry>, ApiState) {
        let registry = Arc::new(DeviceRegistry::new());
        let router = Arc::new(RequestRouter::new(Arc::clone(&registry)));
        let devices = Arc::new(DeviceManager::new(
            Arc::clone(&registry),
            Arc::new(connector),
            SessionConfig::default(),
        ));
        (registry, ApiState { router, devices })
    }

    async fn send(state: ApiState, method: Method, uri: &str, body: &str) -> (StatusCode, Vec<u8>) {
        let req = Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::from(body.to_string()))
            .unwrap();
        let resp = build_router(state).oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, bytes.to_vec())
    }

    fn error_message(body: &[u8]) -> String {
        let value: serde_json::Value = serde_json::from_slice(body).unwrap();
        value["error"].as_str().unwrap().to_string()
    }

    // ── /connect ──────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_connect_dials_loopback_by_default() {
        // Arrange
        let mut connector = MockDeviceConnector::new();
        connector
            .expect_dial()
            .withf(|host, port| host == "127.0.0.1" && *port == 5021)
            .times(1)
            .returning(|_, _| {
                let idle = Builder::new().wait(std::time::Duration::from_secs(3600)).build();
                Ok(DialedDevice {
                    stream: Box::new(idle),
                    peer: "127.0.0.1:5021".into(),
                })
            });
        let (registry, state) = make_state(connector);

        // Act
        let (status, body) = send(state, Method::GET, "/connect?id=1&port=5021", "").await;

        // Assert
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"Slave 1 connected");
        assert!(registry.contains(1));
    }

    #[tokio::test]
    async fn test_connect_without_port_is_bad_request() {
        let (_registry, state) = make_state(MockDeviceConnector::new());

        let (status, body) = send(state, Method::POST, "/connect?id=1", "").await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(error_message(&body).contains("required"));
    }

    #[tokio::test]
    async fn test_connect_refused_is_bad_gateway() {
        let mut connector = MockDeviceConnector::new();
        connector
            .expect_dial()
            .returning(|_, _| Err(io::Error::from(io::ErrorKind::ConnectionRefused)));
        let (_registry, state) = make_state(connector);

        let (status, _) = send(state, Method::GET, "/connect?id=1&port=1", "").await;

        assert_eq!(status, StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_connect_twice_is_conflict() {
        let (registry, state) = make_state(MockDeviceConnector::new());
        let (gw, _dev) = tokio::io::duplex(64);
        registry
            .register(1, gw, "existing", &SessionConfig::default())
            .unwrap();

        let (status, _) = send(state, Method::GET, "/connect?id=1&port=5021", "").await;

        assert_eq!(status, StatusCode::CONFLICT);
    }

    // ── /modbus ───────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_modbus_returns_raw_reply_bytes() {
        // Arrange
        let (registry, state) = make_state(MockDeviceConnector::new());
        let reply = vec![0x00, 0x01, 0x00, 0x00, 0x00, 0x05, 0x01, 0x03, 0x02, 0x00, 0x00];
        let mock = Builder::new()
            .write(&encode_request(1, 1, &RegisterRequest::read_holding_registers(0, 1)).unwrap())
            .read(&reply)
            .build();
        registry
            .register(1, mock, "mock", &SessionConfig::default())
            .unwrap();
        let json = r#"{"slave_id":1,"request":{"function_code":3,"address":0,"length":1}}"#;

        // Act
        let (status, body) = send(state, Method::POST, "/modbus", json).await;

        // Assert
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, reply);
    }

    #[tokio::test]
    async fn test_modbus_exception_reply_is_still_ok() {
        let (registry, state) = make_state(MockDeviceConnector::new());
        let exception = vec![0x00, 0x01, 0x00, 0x00, 0x00, 0x03, 0x01, 0x83, 0x02];
        let mock = Builder::new()
            .write(&encode_request(1, 1, &RegisterRequest::read_holding_registers(500, 1)).unwrap())
            .read(&exception)
            .build();
        registry
            .register(1, mock, "mock", &SessionConfig::default())
            .unwrap();
        let json = r#"{"slave_id":1,"request":{"function_code":3,"address":500,"length":1}}"#;

        let (status, body) = send(state, Method::POST, "/modbus", json).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, exception);
    }

    #[tokio::test]
    async fn test_modbus_unknown_device_is_not_found() {
        let (_registry, state) = make_state(MockDeviceConnector::new());
        let json = r#"{"slave_id":9,"request":{"function_code":3,"address":0,"length":1}}"#;

        let (status, body) = send(state, Method::POST, "/modbus", json).await;

        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(error_message(&body), "device 9 is not connected");
    }

    #[tokio::test]
    async fn test_modbus_unsupported_function_is_bad_request() {
        let (_registry, state) = make_state(MockDeviceConnector::new());
        let json = r#"{"slave_id":1,"request":{"function_code":6,"address":0,"length":1}}"#;

        let (status, _) = send(state, Method::POST, "/modbus", json).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_modbus_invalid_json_is_bad_request() {
        let (_registry, state) = make_state(MockDeviceConnector::new());

        let (status, body) = send(state, Method::POST, "/modbus", "{oops").await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(error_message(&body).starts_with("invalid request"));
    }

    // ── /stats and /devices ───────────────────────────────────────────────────

    #[tokio::test]
    async fn test_stats_lists_connected_devices() {
        let (registry, state) = make_state(MockDeviceConnector::new());
        let (gw, _dev) = tokio::io::duplex(64);
        registry
            .register(3, gw, "10.0.0.3:502", &SessionConfig::default())
            .unwrap();

        let (status, body) = send(state, Method::GET, "/stats", "").await;

        assert_eq!(status, StatusCode::OK);
        let stats: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(stats[0]["device_id"], 3);
        assert_eq!(stats[0]["peer"], "10.0.0.3:502");
        assert_eq!(stats[0]["requests"], 0);
    }

    #[tokio::test]
    async fn test_delete_device_then_delete_again() {
        let (registry, state) = make_state(MockDeviceConnector::new());
        let (gw, _dev) = tokio::io::duplex(64);
        registry
            .register(5, gw, "p", &SessionConfig::default())
            .unwrap();

        let (first, _) = send(state.clone(), Method::DELETE, "/devices/5", "").await;
        let (second, _) = send(state, Method::DELETE, "/devices/5", "").await;

        assert_eq!(first, StatusCode::NO_CONTENT);
        assert_eq!(second, StatusCode::NOT_FOUND);
        assert!(!registry.contains(5));
    }

    #[test]
    fn test_status_mapping_covers_device_failures() {
        assert_eq!(
            GatewayError::QueueFull(1).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            GatewayError::Timeout {
                device_id: 1,
                waited: std::time::Duration::from_secs(5)
            }
            .status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            GatewayError::ConnectionClosed(1).status_code(),
            StatusCode::BAD_GATEWAY
        );
    }
}
