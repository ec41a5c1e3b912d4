use echo_proto::ByteOrder;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Speed of sound in water, m/s
pub const SPEED_OF_SOUND_WATER: f64 = 1480.0;
/// Speed of sound in air, m/s
pub const SPEED_OF_SOUND_AIR: f64 = 330.0;
/// Time between two ADC samples of the TUSS4470 front end, seconds
pub const SAMPLE_TIME_S: f64 = 13.2e-6;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to access configuration file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub logging: LogConfig,
    #[serde(default)]
    pub web: WebConfig,
    /// Sonar settings; the reader stays idle until these are present
    #[serde(default)]
    pub echo: Option<EchoConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Directory where log files will be stored
    pub directory: String,
    /// Log file name prefix (date will be appended)
    pub file_prefix: String,
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            directory: "./logs".to_string(),
            file_prefix: "echo_router".to_string(),
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 8000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionType {
    #[default]
    Serial,
    Udp,
}

/// Acoustic propagation medium
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Medium {
    #[default]
    Water,
    Air,
}

impl Medium {
    pub fn speed_of_sound(self) -> f64 {
        match self {
            Medium::Water => SPEED_OF_SOUND_WATER,
            Medium::Air => SPEED_OF_SOUND_AIR,
        }
    }
}

/// Reference point of the depth reported in NMEA0183 DPT sentences
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NmeaOffset {
    #[default]
    ToTransducer,
    ToSurface,
    ToKeel,
}

/// Output methods that can be enabled in the configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    SignalK,
    Nmea0183,
}

/// Sonar ingestion and depth output settings.
///
/// Instances are treated as immutable snapshots: an update replaces the whole
/// value and restarts the reader and the outputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EchoConfig {
    #[serde(default)]
    pub connection_type: ConnectionType,
    #[serde(default = "default_serial_port")]
    pub serial_port: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default = "default_udp_host")]
    pub udp_host: String,
    #[serde(default = "default_udp_port")]
    pub udp_port: u16,
    #[serde(default = "default_num_samples")]
    pub num_samples: usize,
    /// Header byte order of the firmware in use. No default on purpose.
    pub byte_order: ByteOrder,
    #[serde(default)]
    pub medium: Medium,
    /// Depth of the transducer below the waterline, meters
    #[serde(default)]
    pub transducer_depth: f64,
    /// Depth of the keel below the waterline, meters
    #[serde(default)]
    pub draft: f64,
    #[serde(default)]
    pub signalk_enable: bool,
    #[serde(default = "default_signalk_address")]
    pub signalk_address: String,
    #[serde(default)]
    pub signalk_token: Option<String>,
    #[serde(default)]
    pub nmea_enable: bool,
    #[serde(default = "default_nmea_address")]
    pub nmea_address: String,
    #[serde(default)]
    pub nmea_offset: Option<NmeaOffset>,
}

fn default_serial_port() -> String {
    "/dev/ttyACM0".to_string()
}

fn default_baud_rate() -> u32 {
    250_000
}

fn default_udp_host() -> String {
    "0.0.0.0".to_string()
}

fn default_udp_port() -> u16 {
    9999
}

fn default_num_samples() -> usize {
    1800
}

fn default_signalk_address() -> String {
    "localhost:3000".to_string()
}

fn default_nmea_address() -> String {
    "localhost:10110".to_string()
}

impl EchoConfig {
    /// Defaults for everything except the byte order
    pub fn new(byte_order: ByteOrder) -> Self {
        Self {
            connection_type: ConnectionType::default(),
            serial_port: default_serial_port(),
            baud_rate: default_baud_rate(),
            udp_host: default_udp_host(),
            udp_port: default_udp_port(),
            num_samples: default_num_samples(),
            byte_order,
            medium: Medium::default(),
            transducer_depth: 0.0,
            draft: 0.0,
            signalk_enable: false,
            signalk_address: default_signalk_address(),
            signalk_token: None,
            nmea_enable: false,
            nmea_address: default_nmea_address(),
            nmea_offset: None,
        }
    }

    /// Centimeters of range covered by one sample row
    pub fn resolution(&self) -> f64 {
        self.medium.speed_of_sound() * SAMPLE_TIME_S * 100.0 / 2.0
    }

    /// Depth in meters for a sample row index
    pub fn depth_for_index(&self, depth_index: usize) -> f64 {
        depth_index as f64 * self.resolution() / 100.0
    }

    /// Output methods selected by the enable flags, in tick order
    pub fn output_methods(&self) -> Vec<OutputKind> {
        let mut methods = Vec::new();
        if self.signalk_enable {
            methods.push(OutputKind::SignalK);
        }
        if self.nmea_enable {
            methods.push(OutputKind::Nmea0183);
        }
        methods
    }

    pub fn nmea_offset(&self) -> NmeaOffset {
        self.nmea_offset.unwrap_or_default()
    }

    /// Reject settings the reader or outputs could never work with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_samples == 0 {
            return Err(ConfigError::Invalid("num_samples must be greater than zero".to_string()));
        }
        if self.transducer_depth.is_nan() || self.transducer_depth < 0.0 {
            return Err(ConfigError::Invalid(format!(
                "transducer_depth must be >= 0, got {}",
                self.transducer_depth
            )));
        }
        if self.draft.is_nan() || self.draft < 0.0 {
            return Err(ConfigError::Invalid(format!("draft must be >= 0, got {}", self.draft)));
        }
        if self.nmea_enable {
            split_host_port(&self.nmea_address)?;
        }
        Ok(())
    }
}

/// Split a `host:port` address
pub fn split_host_port(address: &str) -> Result<(&str, u16), ConfigError> {
    let (host, port) = address
        .rsplit_once(':')
        .ok_or_else(|| ConfigError::Invalid(format!("address '{}' must be in 'host:port' format", address)))?;
    if host.is_empty() {
        return Err(ConfigError::Invalid(format!("address '{}' has no host", address)));
    }
    let port = port
        .parse::<u16>()
        .map_err(|_| ConfigError::Invalid(format!("address '{}' has an invalid port", address)))?;
    Ok((host, port))
}

impl Config {
    /// Load configuration from a JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&contents)?;
        if let Some(echo) = &config.echo {
            echo.validate()?;
        }
        Ok(config)
    }

    /// Write configuration as pretty-printed JSON
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }
}
