use std::io::{ErrorKind, Read};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use echo_proto::{ByteOrder, EchoPacket, FrameReader, FrameStats};
use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{PacketReader, ReaderError};
use crate::config::EchoConfig;

const PIPE_CAPACITY: usize = 16 * 1024;

/// List serial devices, most recently enumerated first
pub fn list_serial_ports() -> Vec<String> {
    match serialport::available_ports() {
        Ok(ports) => ports.into_iter().rev().map(|p| p.port_name).collect(),
        Err(e) => {
            warn!("Failed to enumerate serial ports: {}", e);
            Vec::new()
        }
    }
}

/// Sonar reader for a serial connection
///
/// The device is read on a blocking thread which forwards raw bytes through an
/// in-memory pipe; the async side runs the stream frame reader on that pipe.
pub struct SerialReader {
    port_name: String,
    baud_rate: u32,
    num_samples: usize,
    byte_order: ByteOrder,
    frames: Option<FrameReader<DuplexStream>>,
    pump: Option<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
}

impl SerialReader {
    pub fn from_config(config: &EchoConfig) -> Self {
        Self {
            port_name: config.serial_port.clone(),
            baud_rate: config.baud_rate,
            num_samples: config.num_samples,
            byte_order: config.byte_order,
            frames: None,
            pump: None,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    fn open_port(&self) -> Result<Box<dyn SerialPort>, ReaderError> {
        let port = serialport::new(&self.port_name, self.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(Duration::from_millis(100))
            .open()?;
        Ok(port)
    }
}

/// Copy bytes from the device into the pipe until stopped or the pipe closes
fn pump_serial(mut port: Box<dyn SerialPort>, mut pipe: DuplexStream, stop: Arc<AtomicBool>, handle: Handle) {
    let mut buf = [0u8; 1024];
    while !stop.load(Ordering::Relaxed) {
        match port.read(&mut buf) {
            Ok(0) => continue,
            Ok(n) => {
                if handle.block_on(pipe.write_all(&buf[..n])).is_err() {
                    debug!("Serial pipe closed, stopping pump");
                    return;
                }
            }
            Err(e) if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                // Dropping the pipe surfaces as end of stream on the reader side
                warn!("Serial read failed: {}", e);
                return;
            }
        }
    }
    debug!("Serial pump stopped");
}

#[async_trait]
impl PacketReader for SerialReader {
    async fn open(&mut self) -> Result<(), ReaderError> {
        let port = self.open_port()?;
        let (client, server) = tokio::io::duplex(PIPE_CAPACITY);

        self.stop = Arc::new(AtomicBool::new(false));
        let stop = Arc::clone(&self.stop);
        let handle = Handle::current();
        self.pump = Some(tokio::task::spawn_blocking(move || pump_serial(port, server, stop, handle)));

        self.frames = Some(FrameReader::new(client, self.num_samples, self.byte_order));
        info!("Opened serial port {} at {} baud", self.port_name, self.baud_rate);
        Ok(())
    }

    /// Returns once the pump thread has exited and the port lock is released
    async fn close(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        // A pump blocked on a full pipe fails its write once the reader side is gone
        let was_open = self.frames.take().is_some();
        if let Some(pump) = self.pump.take()
            && let Err(e) = pump.await
        {
            warn!("Serial pump for {} ended abnormally: {}", self.port_name, e);
        }
        if was_open {
            info!("Closed serial port {}", self.port_name);
        }
    }

    async fn read(&mut self) -> Result<EchoPacket, ReaderError> {
        let frames = self.frames.as_mut().ok_or(ReaderError::NotOpen)?;
        Ok(frames.next_packet().await?)
    }

    fn take_stats(&mut self) -> FrameStats {
        self.frames.as_mut().map(|f| f.take_stats()).unwrap_or_default()
    }

    fn describe(&self) -> String {
        format!("serial://{}@{}", self.port_name, self.baud_rate)
    }
}

impl Drop for SerialReader {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}
