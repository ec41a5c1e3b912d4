//! Depth outputs: pushes the latest measured depth to navigation systems once
//! per tick.

pub mod nmea0183;
pub mod signalk;
pub mod transport;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ConfigError, EchoConfig, OutputKind};
use crate::settings::EchoSnapshot;
use nmea0183::Nmea0183Output;
use signalk::{AccessToken, SignalkOutput};
use transport::Connector;

pub const DEFAULT_TICK: Duration = Duration::from_secs(1);
pub const DEFAULT_OUTPUT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Error)]
pub enum OutputError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("timed out")]
    Timeout,
}

impl From<ConfigError> for OutputError {
    fn from(e: ConfigError) -> Self {
        OutputError::Config(e.to_string())
    }
}

/// A destination for depth values.
///
/// `stop` must be safe to call on a method that never started.
#[async_trait]
pub trait OutputMethod: Send {
    fn name(&self) -> &'static str;
    async fn start(&mut self) -> Result<(), OutputError>;
    async fn stop(&mut self);
    fn update(&mut self, value: f64);
    fn has_value(&self) -> bool;
    async fn output(&mut self) -> Result<(), OutputError>;
}

/// Shared collaborators handed to every output method
#[derive(Clone)]
pub struct OutputContext {
    pub connector: Arc<dyn Connector>,
    pub token: Arc<AccessToken>,
}

pub fn create_output(kind: OutputKind, config: &EchoConfig, context: &OutputContext) -> Box<dyn OutputMethod> {
    match kind {
        OutputKind::SignalK => Box::new(SignalkOutput::new(config, context)),
        OutputKind::Nmea0183 => Box::new(Nmea0183Output::new(config, context)),
    }
}

/// Owns the active output methods and ticks them in registration order
pub struct OutputManager {
    context: OutputContext,
    settings: Option<Arc<EchoConfig>>,
    methods: Vec<Box<dyn OutputMethod>>,
    tick: Duration,
    output_timeout: Duration,
}

impl OutputManager {
    pub fn new(context: OutputContext) -> Self {
        Self {
            context,
            settings: None,
            methods: Vec::new(),
            tick: DEFAULT_TICK,
            output_timeout: DEFAULT_OUTPUT_TIMEOUT,
        }
    }

    #[cfg(test)]
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    #[cfg(test)]
    pub fn with_output_timeout(mut self, output_timeout: Duration) -> Self {
        self.output_timeout = output_timeout;
        self
    }

    pub fn method_names(&self) -> Vec<&'static str> {
        self.methods.iter().map(|m| m.name()).collect()
    }

    /// Replace every active method with the set selected by `settings`
    pub async fn update_settings(&mut self, settings: Arc<EchoConfig>) {
        self.stop_all().await;
        self.methods = settings
            .output_methods()
            .into_iter()
            .map(|kind| create_output(kind, &settings, &self.context))
            .collect();
        info!("Active outputs: {:?}", self.method_names());

        for method in &mut self.methods {
            match tokio::time::timeout(self.output_timeout, method.start()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Failed to start {} output: {}", method.name(), e),
                Err(_) => warn!("Starting {} output timed out, retrying on next tick", method.name()),
            }
        }
        self.settings = Some(settings);
    }

    pub fn update(&mut self, value: f64) {
        for method in &mut self.methods {
            method.update(value);
        }
    }

    /// Send the latest value through every method that has one
    pub async fn output(&mut self) {
        for method in &mut self.methods {
            if !method.has_value() {
                continue;
            }
            match tokio::time::timeout(self.output_timeout, method.output()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("{} output failed: {}", method.name(), e),
                Err(_) => {
                    warn!("{} output failed: {}", method.name(), OutputError::Timeout);
                    method.stop().await;
                }
            }
        }
    }

    async fn stop_all(&mut self) {
        for method in &mut self.methods {
            method.stop().await;
        }
        self.methods.clear();
    }

    /// Tick loop. Runs until `cancel` fires, then stops every method.
    pub async fn run(
        mut self,
        mut settings: watch::Receiver<EchoSnapshot>,
        mut depth: watch::Receiver<Option<f64>>,
        cancel: CancellationToken,
    ) {
        let initial = settings.borrow_and_update().clone();
        if let Some(config) = initial {
            self.update_settings(config).await;
        }

        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut settings_closed = false;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                changed = settings.changed(), if !settings_closed => {
                    if changed.is_err() {
                        settings_closed = true;
                        continue;
                    }
                    let snapshot = settings.borrow_and_update().clone();
                    match snapshot {
                        Some(config) => self.update_settings(config).await,
                        None => {
                            self.stop_all().await;
                            self.settings = None;
                        }
                    }
                }
                _ = ticker.tick() => {
                    if self.settings.is_none() {
                        continue;
                    }
                    if depth.has_changed().unwrap_or(false) {
                        let latest = *depth.borrow_and_update();
                        if let Some(value) = latest {
                            self.update(value);
                        }
                    }
                    self.output().await;
                }
            }
        }

        debug!("Output manager stopping");
        self.stop_all().await;
        self.context.token.cancel_pending();
    }
}
