use async_trait::async_trait;
use futures_util::SinkExt;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::debug;

use super::OutputError;

/// Outbound byte stream, used by sentence based outputs
#[async_trait]
pub trait ByteSink: Send {
    async fn write_all(&mut self, bytes: &[u8]) -> Result<(), OutputError>;
    async fn close(&mut self);
}

/// Outbound message stream, used by delta based outputs
#[async_trait]
pub trait MessageSink: Send {
    async fn send_text(&mut self, text: String) -> Result<(), OutputError>;
    async fn close(&mut self);
}

/// Everything the output methods need from the network.
///
/// Output methods never touch sockets directly so they can be driven by an
/// in-process fake.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open_tcp(&self, host: &str, port: u16) -> Result<Box<dyn ByteSink>, OutputError>;
    async fn open_websocket(&self, url: &str) -> Result<Box<dyn MessageSink>, OutputError>;
    async fn post_json(&self, url: &str, body: &Value) -> Result<Value, OutputError>;
    async fn get_json(&self, url: &str) -> Result<Value, OutputError>;
}

/// Real network connector: TCP, WebSocket and plain HTTP JSON requests
#[derive(Default)]
pub struct NetworkConnector {
    http: reqwest::Client,
}

impl NetworkConnector {
    pub fn new() -> Self {
        Self::default()
    }
}

fn transport_error(e: impl std::fmt::Display) -> OutputError {
    OutputError::Transport(e.to_string())
}

#[async_trait]
impl Connector for NetworkConnector {
    async fn open_tcp(&self, host: &str, port: u16) -> Result<Box<dyn ByteSink>, OutputError> {
        let stream = TcpStream::connect((host, port)).await.map_err(transport_error)?;
        stream.set_nodelay(true).map_err(transport_error)?;
        debug!("TCP connection established to {}:{}", host, port);
        Ok(Box::new(TcpSink(stream)))
    }

    async fn open_websocket(&self, url: &str) -> Result<Box<dyn MessageSink>, OutputError> {
        let (stream, response) = connect_async(url).await.map_err(transport_error)?;
        debug!("WebSocket connected, status {}", response.status());
        Ok(Box::new(WsSink(stream)))
    }

    async fn post_json(&self, url: &str, body: &Value) -> Result<Value, OutputError> {
        let response = self
            .http
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(transport_error)?
            .error_for_status()
            .map_err(transport_error)?;
        response
            .json::<Value>()
            .await
            .map_err(|e| OutputError::Protocol(e.to_string()))
    }

    async fn get_json(&self, url: &str) -> Result<Value, OutputError> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(transport_error)?
            .error_for_status()
            .map_err(transport_error)?;
        response
            .json::<Value>()
            .await
            .map_err(|e| OutputError::Protocol(e.to_string()))
    }
}

struct TcpSink(TcpStream);

#[async_trait]
impl ByteSink for TcpSink {
    async fn write_all(&mut self, bytes: &[u8]) -> Result<(), OutputError> {
        self.0.write_all(bytes).await.map_err(transport_error)?;
        self.0.flush().await.map_err(transport_error)
    }

    async fn close(&mut self) {
        let _ = self.0.shutdown().await;
    }
}

struct WsSink(WebSocketStream<MaybeTlsStream<TcpStream>>);

#[async_trait]
impl MessageSink for WsSink {
    async fn send_text(&mut self, text: String) -> Result<(), OutputError> {
        self.0.send(Message::text(text)).await.map_err(transport_error)
    }

    async fn close(&mut self) {
        let _ = self.0.close(None).await;
    }
}
