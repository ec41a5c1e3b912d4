use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, warn};

use super::api::{create_api_router, AppState};
use crate::telemetry::EchoTelemetry;

pub fn create_app(state: AppState) -> Router {
    let ws_router = Router::new()
        .route("/ws", get(telemetry_ws))
        .with_state(state.clone());

    Router::new()
        .nest("/api", create_api_router(state))
        .merge(ws_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}

pub async fn start_web_server(
    state: AppState,
    port: u16,
    cancel: CancellationToken,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let app = create_app(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Web server starting on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
        .map_err(|e| format!("Server error: {}", e).into())
}

async fn telemetry_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    let records = state.telemetry.subscribe();
    ws.on_upgrade(move |socket| forward_telemetry(socket, records))
}

/// Push every telemetry record to one browser until either side goes away
async fn forward_telemetry(mut socket: WebSocket, mut records: broadcast::Receiver<Arc<EchoTelemetry>>) {
    debug!("Telemetry client connected");
    loop {
        tokio::select! {
            record = records.recv() => match record {
                Ok(record) => {
                    let text = match serde_json::to_string(record.as_ref()) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!("Failed to serialize telemetry: {}", e);
                            continue;
                        }
                    };
                    if socket.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                // A slow browser only misses pings, it is not disconnected
                Err(RecvError::Lagged(skipped)) => debug!("Telemetry client lagged, skipped {} records", skipped),
                Err(RecvError::Closed) => break,
            },
            incoming = socket.recv() => match incoming {
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => break,
                Some(Ok(_)) => {}
            },
        }
    }
    debug!("Telemetry client disconnected");
}
