use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use serde_json::{Value, json};
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

use super::transport::{Connector, MessageSink};
use super::{OutputContext, OutputError, OutputMethod};
use crate::config::EchoConfig;

pub const CLIENT_ID: &str = "f6b20288-5ecf-4daa-9a13-1594bc145abe";
pub const CLIENT_DESCRIPTION: &str = "OpenEcho Depth Sounder";

const PATH_BELOW_TRANSDUCER: &str = "environment.depth.belowTransducer";
const PATH_BELOW_SURFACE: &str = "environment.depth.belowSurface";
const PATH_BELOW_KEEL: &str = "environment.depth.belowKeel";

type SharedResult = Shared<BoxFuture<'static, Result<String, OutputError>>>;

/// The in-flight access request and the task driving it
struct PendingRequest {
    result: SharedResult,
    task: AbortHandle,
}

/// SignalK access token shared by every SignalK output.
///
/// At most one access request is in flight at a time: callers arriving while
/// a request is pending wait on the same result. The request runs in its own
/// task, so a caller giving up does not abandon the approval; only
/// [`AccessToken::cancel_pending`] does.
pub struct AccessToken {
    token: Mutex<Option<String>>,
    pending: Mutex<Option<PendingRequest>>,
    persist: Box<dyn Fn(&str) + Send + Sync>,
    poll_interval: Duration,
}

impl AccessToken {
    /// `persist` is called once for every newly approved token
    pub fn new(initial: Option<String>, persist: impl Fn(&str) + Send + Sync + 'static) -> Self {
        Self {
            token: Mutex::new(initial),
            pending: Mutex::new(None),
            persist: Box::new(persist),
            poll_interval: Duration::from_secs(1),
        }
    }

    #[cfg(test)]
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn cached(&self) -> Option<String> {
        self.token.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Seed the cache, e.g. with a token found in new settings
    pub fn seed(&self, token: &str) {
        *self.token.lock().unwrap_or_else(|e| e.into_inner()) = Some(token.to_string());
    }

    pub async fn get_or_fetch(
        self: &Arc<Self>,
        connector: Arc<dyn Connector>,
        address: &str,
    ) -> Result<String, OutputError> {
        if let Some(token) = self.cached() {
            return Ok(token);
        }
        let request = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            match pending.as_ref() {
                Some(request) => request.result.clone(),
                None => {
                    let request = self.spawn_request(connector, address.to_string());
                    let result = request.result.clone();
                    *pending = Some(request);
                    result
                }
            }
        };
        request.await
    }

    /// Abort the in-flight access request, if any. Waiting callers get an error.
    pub fn cancel_pending(&self) {
        let request = self.pending.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(request) = request {
            debug!("Cancelling pending SignalK access request");
            request.task.abort();
        }
    }

    fn spawn_request(self: &Arc<Self>, connector: Arc<dyn Connector>, address: String) -> PendingRequest {
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let result = request_access(connector.as_ref(), &address, this.poll_interval).await;
            if let Ok(token) = &result {
                this.seed(token);
                (this.persist)(token);
            }
            *this.pending.lock().unwrap_or_else(|e| e.into_inner()) = None;
            result
        });
        let task = handle.abort_handle();
        let result = async move {
            handle.await.unwrap_or_else(|e| {
                if e.is_cancelled() {
                    Err(OutputError::Protocol("access request cancelled".to_string()))
                } else {
                    Err(OutputError::Protocol(format!("access request task failed: {}", e)))
                }
            })
        }
        .boxed()
        .shared();
        PendingRequest { result, task }
    }
}

/// Register as a device and wait for the server operator to approve it
async fn request_access(
    connector: &dyn Connector,
    address: &str,
    poll_interval: Duration,
) -> Result<String, OutputError> {
    let url = format!("http://{}/signalk/v1/access/requests", address);
    let body = json!({
        "clientId": CLIENT_ID,
        "description": CLIENT_DESCRIPTION,
    });
    let mut response = connector.post_json(&url, &body).await?;

    let href = response
        .get("href")
        .and_then(Value::as_str)
        .ok_or_else(|| OutputError::Protocol("access request response has no href".to_string()))?;
    let poll_url = format!("http://{}{}", address, href);
    info!("SignalK access requested, waiting for approval at {}", poll_url);

    while state_of(&response) == "PENDING" {
        tokio::time::sleep(poll_interval).await;
        response = connector.get_json(&poll_url).await?;
    }

    let state = state_of(&response);
    if state != "COMPLETED" {
        return Err(OutputError::Protocol(format!("unexpected access request state '{}'", state)));
    }
    let access = &response["accessRequest"];
    let permission = access["permission"].as_str().unwrap_or_default();
    if permission != "APPROVED" {
        return Err(OutputError::AccessDenied(format!("permission '{}'", permission)));
    }
    access["token"]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| OutputError::Protocol("approved access request carries no token".to_string()))
}

fn state_of(response: &Value) -> &str {
    response["state"].as_str().unwrap_or_default()
}

/// Build the delta message for one depth value.
///
/// Depth below surface needs a positive transducer depth, depth below keel
/// additionally a positive draft.
pub fn depth_delta(depth: f64, transducer_depth: f64, draft: f64) -> Value {
    let mut values = vec![json!({ "path": PATH_BELOW_TRANSDUCER, "value": depth })];
    if transducer_depth > 0.0 {
        values.push(json!({ "path": PATH_BELOW_SURFACE, "value": depth + transducer_depth }));
        if draft > 0.0 {
            values.push(json!({ "path": PATH_BELOW_KEEL, "value": depth + transducer_depth - draft }));
        }
    }
    json!({ "updates": [{ "values": values }] })
}

/// Streams depth deltas to a SignalK server over WebSocket
pub struct SignalkOutput {
    address: String,
    transducer_depth: f64,
    draft: f64,
    connector: Arc<dyn Connector>,
    token: Arc<AccessToken>,
    stream: Option<Box<dyn MessageSink>>,
    current: Option<f64>,
    disabled: bool,
}

impl SignalkOutput {
    pub fn new(config: &EchoConfig, context: &OutputContext) -> Self {
        if let Some(token) = &config.signalk_token {
            context.token.seed(token);
        }
        Self {
            address: config.signalk_address.trim_end_matches('/').to_string(),
            transducer_depth: config.transducer_depth,
            draft: config.draft,
            connector: Arc::clone(&context.connector),
            token: Arc::clone(&context.token),
            stream: None,
            current: None,
            disabled: false,
        }
    }

    #[cfg(test)]
    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    async fn connect(&mut self) -> Result<(), OutputError> {
        if self.address.is_empty() {
            return Err(OutputError::Config("SignalK address is not set".to_string()));
        }
        let token = self
            .token
            .get_or_fetch(Arc::clone(&self.connector), &self.address)
            .await?;
        let url = format!("ws://{}/signalk/v1/stream?subscribe=none&token={}", self.address, token);
        self.stream = Some(self.connector.open_websocket(&url).await?);
        info!("SignalK output connected to {}", self.address);
        Ok(())
    }
}

#[async_trait]
impl OutputMethod for SignalkOutput {
    fn name(&self) -> &'static str {
        "signalk"
    }

    async fn start(&mut self) -> Result<(), OutputError> {
        if self.disabled {
            return Ok(());
        }
        let result = self.connect().await;
        if let Err(OutputError::AccessDenied(reason)) = &result {
            error!("SignalK access denied ({}), output disabled until reconfigured", reason);
            self.disabled = true;
        }
        result
    }

    async fn stop(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            stream.close().await;
        }
    }

    fn update(&mut self, value: f64) {
        self.current = Some(value);
    }

    fn has_value(&self) -> bool {
        self.current.is_some()
    }

    async fn output(&mut self) -> Result<(), OutputError> {
        let Some(depth) = self.current else {
            return Ok(());
        };
        if self.disabled {
            return Ok(());
        }
        if self.stream.is_none() {
            info!("Reconnecting SignalK output to {}", self.address);
            self.start().await?;
        }

        let delta = depth_delta(depth, self.transducer_depth, self.draft).to_string();
        let Some(stream) = self.stream.as_mut() else {
            return Ok(());
        };
        if let Err(e) = stream.send_text(delta).await {
            warn!("SignalK send failed, dropping connection: {}", e);
            self.stop().await;
            return Err(e);
        }
        Ok(())
    }
}
