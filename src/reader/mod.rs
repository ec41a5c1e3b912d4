//! Packet readers
//!
//! A reader binds one transport to the matching frame assembly strategy and
//! hands out validated [`EchoPacket`]s:
//! - [`SerialReader`]: byte stream from a serial device, exact-length reads
//! - [`UdpReader`]: datagrams from a UDP relay, incremental reassembly

use async_trait::async_trait;
use echo_proto::{EchoPacket, FrameStats};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::{ConnectionType, EchoConfig};

pub mod serial;
pub mod udp;

pub use serial::SerialReader;
pub use udp::UdpReader;

#[derive(Debug, Error)]
pub enum ReaderError {
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("transport closed")]
    Closed,

    #[error("reader used before open()")]
    NotOpen,
}

/// Transport-independent source of sonar packets
#[async_trait]
pub trait PacketReader: Send {
    /// Establish the transport
    async fn open(&mut self) -> Result<(), ReaderError>;

    /// Release the transport. Safe to call more than once.
    async fn close(&mut self);

    /// Wait for the next validated packet
    async fn read(&mut self) -> Result<EchoPacket, ReaderError>;

    /// Iteration step: the next packet, or `None` once `cancel` fires.
    ///
    /// Cancellation is not an error, the sequence simply ends. Read errors are
    /// returned and the sequence may be continued; callers decide whether an
    /// error ends their session.
    async fn next_packet(&mut self, cancel: &CancellationToken) -> Option<Result<EchoPacket, ReaderError>> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = self.read() => Some(result),
        }
    }

    /// Framing counters accumulated since the last call
    fn take_stats(&mut self) -> FrameStats {
        FrameStats::default()
    }

    /// Human readable transport description for logs
    fn describe(&self) -> String;
}

/// Builds the reader for a configuration snapshot
pub trait ReaderFactory: Send + Sync {
    fn create(&self, config: &EchoConfig) -> Box<dyn PacketReader>;
}

/// Factory for the real serial and UDP transports
pub struct TransportReaderFactory;

impl ReaderFactory for TransportReaderFactory {
    fn create(&self, config: &EchoConfig) -> Box<dyn PacketReader> {
        match config.connection_type {
            ConnectionType::Serial => Box::new(SerialReader::from_config(config)),
            ConnectionType::Udp => Box::new(UdpReader::from_config(config)),
        }
    }
}
