use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::{Config, ConfigError, EchoConfig};

/// Snapshot published to the reader and the output manager
pub type EchoSnapshot = Option<Arc<EchoConfig>>;

/// Owner of the active configuration.
///
/// Every accepted update is saved to disk and published as a new immutable
/// snapshot. Subscribers see the change marker of the watch channel as their
/// restart signal.
pub struct SettingsStore {
    path: Option<PathBuf>,
    config: Mutex<Config>,
    echo_tx: watch::Sender<EchoSnapshot>,
}

impl SettingsStore {
    /// `path` is where updates are persisted; `None` keeps them in memory only
    pub fn new(config: Config, path: Option<PathBuf>) -> Self {
        let snapshot = config.echo.clone().map(Arc::new);
        let (echo_tx, _) = watch::channel(snapshot);
        Self {
            path,
            config: Mutex::new(config),
            echo_tx,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<EchoSnapshot> {
        self.echo_tx.subscribe()
    }

    pub fn current(&self) -> EchoSnapshot {
        self.echo_tx.borrow().clone()
    }

    /// Validate, persist and publish new sonar settings.
    ///
    /// A SignalK token already acquired is carried over when the update does
    /// not bring one.
    pub fn replace(&self, mut echo: EchoConfig) -> Result<Arc<EchoConfig>, ConfigError> {
        echo.validate()?;

        let mut config = self.config.lock().unwrap_or_else(|e| e.into_inner());
        if echo.signalk_token.is_none() {
            echo.signalk_token = config.echo.as_ref().and_then(|e| e.signalk_token.clone());
        }
        config.echo = Some(echo.clone());
        self.save(&config);
        drop(config);

        let snapshot = Arc::new(echo);
        self.echo_tx.send_replace(Some(Arc::clone(&snapshot)));
        info!("Settings updated");
        Ok(snapshot)
    }

    /// Record a SignalK access token without restarting anything
    pub fn persist_token(&self, token: &str) {
        let mut config = self.config.lock().unwrap_or_else(|e| e.into_inner());
        match config.echo.as_mut() {
            Some(echo) => {
                echo.signalk_token = Some(token.to_string());
                self.save(&config);
                info!("SignalK token stored");
            }
            None => warn!("Received SignalK token without sonar settings, not stored"),
        }
    }

    fn save(&self, config: &Config) {
        if let Some(path) = &self.path
            && let Err(e) = config.save(path)
        {
            warn!("Failed to save settings to {}: {}", path.display(), e);
        }
    }
}
