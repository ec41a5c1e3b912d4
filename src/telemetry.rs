use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tracing::trace;

/// Per-ping record pushed to browser and UI consumers
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EchoTelemetry {
    pub spectrogram: Vec<u8>,
    /// meters
    pub measured_depth: f64,
    /// degrees Celsius
    pub temperature: f64,
    /// volts
    pub drive_voltage: f64,
    /// centimeters per sample row
    pub resolution: f64,
}

#[derive(Debug, Error)]
#[error("sink delivery failed: {0}")]
pub struct SinkError(pub String);

/// Consumer of full telemetry records
pub trait TelemetrySink: Send + Sync {
    fn send(&self, record: Arc<EchoTelemetry>) -> Result<(), SinkError>;
}

/// Consumer of the measured depth, meters
pub trait DepthSink: Send + Sync {
    fn update(&self, depth: f64) -> Result<(), SinkError>;
}

impl TelemetrySink for broadcast::Sender<Arc<EchoTelemetry>> {
    fn send(&self, record: Arc<EchoTelemetry>) -> Result<(), SinkError> {
        // No subscribers is normal when no browser is connected
        if broadcast::Sender::send(self, record).is_err() {
            trace!("No telemetry subscribers");
        }
        Ok(())
    }
}

impl DepthSink for watch::Sender<Option<f64>> {
    fn update(&self, depth: f64) -> Result<(), SinkError> {
        self.send_replace(Some(depth));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> Arc<EchoTelemetry> {
        Arc::new(EchoTelemetry {
            spectrogram: vec![1, 2, 3],
            measured_depth: 1.5,
            temperature: 20.25,
            drive_voltage: 12.5,
            resolution: 0.9768,
        })
    }

    #[test]
    fn test_broadcast_without_subscribers_is_ok() {
        let (tx, _) = broadcast::channel::<Arc<EchoTelemetry>>(4);
        assert!(TelemetrySink::send(&tx, record()).is_ok());
    }

    #[test]
    fn test_broadcast_reaches_subscribers() {
        let (tx, mut rx) = broadcast::channel::<Arc<EchoTelemetry>>(4);
        TelemetrySink::send(&tx, record()).unwrap();
        assert_eq!(rx.try_recv().unwrap().measured_depth, 1.5);
    }

    #[test]
    fn test_depth_sink_keeps_latest_value() {
        let (tx, rx) = watch::channel(None);
        tx.update(1.0).unwrap();
        tx.update(2.0).unwrap();
        assert_eq!(*rx.borrow(), Some(2.0));
    }

    #[test]
    fn test_record_json_layout() {
        let json = serde_json::to_value(&*record()).unwrap();
        assert_eq!(json["spectrogram"], serde_json::json!([1, 2, 3]));
        assert_eq!(json["measured_depth"], 1.5);
        assert_eq!(json["temperature"], 20.25);
        assert_eq!(json["drive_voltage"], 12.5);
        assert_eq!(json["resolution"], 0.9768);
    }
}
