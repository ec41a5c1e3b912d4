use axum::{
    extract::State,
    http::StatusCode,
    response::Json,
    routing::get,
    Router,
};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::{error, info};

use crate::config::EchoConfig;
use crate::echo_reader::ReaderState;
use crate::reader::serial::list_serial_ports;
use crate::settings::SettingsStore;
use crate::telemetry::EchoTelemetry;

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<SettingsStore>,
    pub telemetry: broadcast::Sender<Arc<EchoTelemetry>>,
    pub reader_state: watch::Receiver<ReaderState>,
}

#[derive(Debug, Serialize)]
pub struct Status {
    pub reader: ReaderState,
}

#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub status: String,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            status: "ok".to_string(),
            data: Some(data),
            error: None,
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            status: "error".to_string(),
            data: None,
            error: Some(message),
        }
    }
}

// Tokens are never handed back to the browser
fn redacted(config: &EchoConfig) -> EchoConfig {
    EchoConfig {
        signalk_token: None,
        ..config.clone()
    }
}

pub async fn get_settings(State(state): State<AppState>) -> Json<ApiResponse<Option<EchoConfig>>> {
    info!("GET /api/settings called");
    let current = state.settings.current().map(|c| redacted(&c));
    Json(ApiResponse::ok(current))
}

pub async fn update_settings(
    State(state): State<AppState>,
    Json(settings): Json<EchoConfig>,
) -> (StatusCode, Json<ApiResponse<EchoConfig>>) {
    info!("POST /api/settings called");
    match state.settings.replace(settings) {
        Ok(applied) => (StatusCode::OK, Json(ApiResponse::ok(redacted(&applied)))),
        Err(e) => {
            error!(error = %e, "Rejected settings update");
            (StatusCode::BAD_REQUEST, Json(ApiResponse::error(e.to_string())))
        }
    }
}

pub async fn get_status(State(state): State<AppState>) -> Json<ApiResponse<Status>> {
    let reader = *state.reader_state.borrow();
    Json(ApiResponse::ok(Status { reader }))
}

pub async fn get_serial_ports() -> Result<Json<ApiResponse<Vec<String>>>, StatusCode> {
    info!("GET /api/serial_ports called");
    match tokio::task::spawn_blocking(list_serial_ports).await {
        Ok(ports) => Ok(Json(ApiResponse::ok(ports))),
        Err(e) => {
            error!(error = %e, "Serial port enumeration task failed");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

pub fn create_api_router(state: AppState) -> Router {
    Router::new()
        .route("/settings", get(get_settings).post(update_settings))
        .route("/status", get(get_status))
        .route("/serial_ports", get(get_serial_ports))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use serde_json::{Value, json};
    use tower::ServiceExt;

    fn state(config: Config) -> AppState {
        let (telemetry, _) = broadcast::channel(4);
        let (_, reader_state) = watch::channel(ReaderState::Running);
        AppState {
            settings: Arc::new(SettingsStore::new(config, None)),
            telemetry,
            reader_state,
        }
    }

    #[tokio::test]
    async fn test_status_reports_reader_state() {
        let app = create_api_router(state(Config::default()));
        let response = app
            .oneshot(Request::builder().uri("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["data"]["reader"], "running");
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_get_settings_without_configuration() {
        let app = create_api_router(state(Config::default()));
        let response = app
            .oneshot(Request::builder().uri("/settings").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "ok");
        assert!(body["data"].is_null());
    }

    #[tokio::test]
    async fn test_post_settings_publishes_snapshot() {
        let state = state(Config::default());
        let mut updates = state.settings.subscribe();
        let app = create_api_router(state.clone());

        let request = Request::builder()
            .method("POST")
            .uri("/settings")
            .header("content-type", "application/json")
            .body(Body::from(
                json!({
                    "connection_type": "udp",
                    "udp_port": 5005,
                    "byte_order": "big",
                    "signalk_token": "secret"
                })
                .to_string(),
            ))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["data"]["udp_port"], 5005);
        assert!(body["data"]["signalk_token"].is_null());

        assert!(updates.has_changed().unwrap());
        let published = updates.borrow_and_update().clone().unwrap();
        assert_eq!(published.udp_port, 5005);
        assert_eq!(published.signalk_token.as_deref(), Some("secret"));
    }

    #[tokio::test]
    async fn test_post_invalid_settings_is_rejected() {
        let state = state(Config::default());
        let app = create_api_router(state.clone());

        let request = Request::builder()
            .method("POST")
            .uri("/settings")
            .header("content-type", "application/json")
            .body(Body::from(json!({ "byte_order": "little", "num_samples": 0 }).to_string()))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["status"], "error");
        assert!(state.settings.current().is_none());
    }
}
