use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use super::transport::{ByteSink, Connector};
use super::{OutputContext, OutputError, OutputMethod};
use crate::config::{EchoConfig, NmeaOffset, split_host_port};

/// Talker id of a depth sounder
pub const TALKER_ID: &str = "SD";
pub const FEET_PER_METER: f64 = 3.28084;
pub const FATHOMS_PER_METER: f64 = 0.546807;

/// XOR of every character between `$` and `*`
pub fn nmea_checksum(body: &str) -> u8 {
    body.bytes().fold(0, |acc, b| acc ^ b)
}

/// Wrap a sentence body with the leading `$`, the checksum and CRLF
pub fn sentence(body: &str) -> String {
    format!("${}*{:02X}\r\n", body, nmea_checksum(body))
}

/// Depth below transducer
pub fn dbt_sentence(depth_m: f64) -> String {
    sentence(&format!(
        "{}DBT,{:.1},f,{:.1},M,{:.1},F",
        TALKER_ID,
        depth_m * FEET_PER_METER,
        depth_m,
        depth_m * FATHOMS_PER_METER
    ))
}

/// Depth with the datum offset applied
pub fn dpt_sentence(depth_m: f64, offset_m: f64) -> String {
    sentence(&format!("{}DPT,{:.1},{:.1}", TALKER_ID, depth_m + offset_m, offset_m))
}

/// Offset between the transducer and the configured DPT datum, meters
pub fn datum_offset(datum: NmeaOffset, transducer_depth: f64, draft: f64) -> f64 {
    match datum {
        NmeaOffset::ToTransducer => 0.0,
        NmeaOffset::ToSurface => transducer_depth,
        NmeaOffset::ToKeel => -(draft - transducer_depth),
    }
}

/// Sends DBT and DPT sentences over a TCP connection
pub struct Nmea0183Output {
    address: String,
    offset: f64,
    connector: Arc<dyn Connector>,
    sink: Option<Box<dyn ByteSink>>,
    current: Option<f64>,
}

impl Nmea0183Output {
    pub fn new(config: &EchoConfig, context: &OutputContext) -> Self {
        Self {
            address: config.nmea_address.clone(),
            offset: datum_offset(config.nmea_offset(), config.transducer_depth, config.draft),
            connector: Arc::clone(&context.connector),
            sink: None,
            current: None,
        }
    }
}

#[async_trait]
impl OutputMethod for Nmea0183Output {
    fn name(&self) -> &'static str {
        "nmea0183"
    }

    async fn start(&mut self) -> Result<(), OutputError> {
        let (host, port) = split_host_port(&self.address)?;
        self.sink = Some(self.connector.open_tcp(host, port).await?);
        info!("NMEA0183 output connected to {}", self.address);
        Ok(())
    }

    async fn stop(&mut self) {
        if let Some(mut sink) = self.sink.take() {
            sink.close().await;
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
        if self.sink.is_none() {
            info!("Reconnecting NMEA0183 output to {}", self.address);
            self.start().await?;
        }

        let mut payload = dbt_sentence(depth);
        payload.push_str(&dpt_sentence(depth, self.offset));

        let Some(sink) = self.sink.as_mut() else {
            return Ok(());
        };
        if let Err(e) = sink.write_all(payload.as_bytes()).await {
            warn!("NMEA0183 write failed, dropping connection: {}", e);
            self.stop().await;
            return Err(e);
        }
        Ok(())
    }
}
