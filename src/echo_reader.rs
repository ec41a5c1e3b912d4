use std::sync::Arc;
use std::time::Duration;

use echo_proto::EchoPacket;
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::app_metrics::{AppMetrics, MetricsLogger};
use crate::config::EchoConfig;
use crate::reader::{PacketReader, ReaderFactory};
use crate::settings::EchoSnapshot;
use crate::telemetry::{DepthSink, EchoTelemetry, TelemetrySink};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReaderState {
    /// No settings yet
    Idle,
    /// A reader is open and packets are being consumed
    Running,
    /// Settings changed or the transport failed; a new reader is about to open
    Restarting,
}

enum SessionEnd {
    Reconfigure,
    Failed,
    Cancelled,
}

/// Ingestion supervisor
///
/// Owns the current settings snapshot, runs a reader built from it, turns each
/// packet into a calibrated depth and forwards it to the telemetry and depth
/// sinks. A settings update or a transport failure restarts the reader; the
/// loop itself only ends when cancelled.
pub struct EchoReader {
    settings: watch::Receiver<EchoSnapshot>,
    settings_closed: bool,
    factory: Arc<dyn ReaderFactory>,
    telemetry: Arc<dyn TelemetrySink>,
    depth: Arc<dyn DepthSink>,
    state: watch::Sender<ReaderState>,
    idle_poll: Duration,
    retry_delay: Duration,
    metrics: AppMetrics,
    metrics_logger: MetricsLogger,
}

impl EchoReader {
    pub fn new(
        settings: watch::Receiver<EchoSnapshot>,
        factory: Arc<dyn ReaderFactory>,
        telemetry: Arc<dyn TelemetrySink>,
        depth: Arc<dyn DepthSink>,
    ) -> Self {
        Self {
            settings,
            settings_closed: false,
            factory,
            telemetry,
            depth,
            state: watch::channel(ReaderState::Idle).0,
            idle_poll: Duration::from_secs(1),
            retry_delay: Duration::from_secs(1),
            metrics: AppMetrics::new(),
            metrics_logger: MetricsLogger::new(Duration::from_secs(60)),
        }
    }

    /// Pause after a transport failure before the next attempt
    #[cfg(test)]
    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    /// Follow the state machine; stays valid after `run` consumes the reader
    pub fn subscribe_state(&self) -> watch::Receiver<ReaderState> {
        self.state.subscribe()
    }

    fn current_state(&self) -> ReaderState {
        *self.state.borrow()
    }

    fn set_state(&mut self, state: ReaderState) {
        let previous = self.current_state();
        if previous != state {
            debug!("EchoReader state {:?} -> {:?}", previous, state);
            self.state.send_replace(state);
        }
    }

    /// Run until `cancel` fires
    pub async fn run(mut self, cancel: CancellationToken) {
        info!("EchoReader starting");
        loop {
            let snapshot = self.settings.borrow_and_update().clone();
            let Some(config) = snapshot else {
                if self.current_state() != ReaderState::Idle {
                    warn!("Settings not available, waiting...");
                }
                self.set_state(ReaderState::Idle);
                if self.wait_idle(&cancel).await {
                    break;
                }
                continue;
            };

            let mut reader = self.factory.create(&config);
            info!("EchoReader opening {}", reader.describe());
            let end = self.run_session(reader.as_mut(), &config, &cancel).await;
            self.metrics.record_frames(reader.take_stats());
            reader.close().await;

            match end {
                SessionEnd::Cancelled => break,
                SessionEnd::Reconfigure => {
                    self.metrics.restarts += 1;
                    self.set_state(ReaderState::Restarting);
                }
                SessionEnd::Failed => {
                    self.metrics.transport_errors += 1;
                    self.set_state(ReaderState::Restarting);
                    if sleep_or_cancel(self.retry_delay, &cancel).await {
                        break;
                    }
                }
            }
        }
        info!("EchoReader stopped");
    }

    /// Wait one idle poll interval, waking early on new settings.
    /// Returns true when cancelled.
    async fn wait_idle(&mut self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => true,
            _ = tokio::time::sleep(self.idle_poll) => false,
            changed = self.settings.changed(), if !self.settings_closed => {
                if changed.is_err() {
                    self.settings_closed = true;
                }
                false
            }
        }
    }

    async fn run_session(
        &mut self,
        reader: &mut dyn PacketReader,
        config: &EchoConfig,
        cancel: &CancellationToken,
    ) -> SessionEnd {
        let opened = tokio::select! {
            _ = cancel.cancelled() => return SessionEnd::Cancelled,
            opened = reader.open() => opened,
        };
        if let Err(e) = opened {
            error!("Failed to open {}: {}", reader.describe(), e);
            return SessionEnd::Failed;
        }
        self.set_state(ReaderState::Running);

        loop {
            let item = tokio::select! {
                changed = self.settings.changed(), if !self.settings_closed => {
                    if changed.is_ok() {
                        info!("Settings changed, restarting reader");
                        return SessionEnd::Reconfigure;
                    }
                    // Publisher gone: keep the current settings for good
                    self.settings_closed = true;
                    continue;
                }
                item = reader.next_packet(cancel) => item,
            };

            match item {
                None => return SessionEnd::Cancelled,
                Some(Ok(packet)) => {
                    self.process_packet(&packet, config);
                    self.metrics.record_frames(reader.take_stats());
                    self.metrics_logger.check_and_log(&mut self.metrics);

                    if self.settings.has_changed().unwrap_or(false) {
                        info!("Settings changed, restarting reader");
                        return SessionEnd::Reconfigure;
                    }
                }
                Some(Err(e)) => {
                    error!("Error reading from {}: {}", reader.describe(), e);
                    return SessionEnd::Failed;
                }
            }
        }
    }

    /// Calibrate one packet and hand it to both sinks.
    ///
    /// Each sink is tried independently; a failure in one is logged and does
    /// not keep the other from receiving the measurement.
    fn process_packet(&mut self, packet: &EchoPacket, config: &EchoConfig) {
        self.metrics.packets += 1;

        let resolution = config.resolution();
        let depth = config.depth_for_index(packet.depth_index);

        let record = Arc::new(EchoTelemetry {
            spectrogram: packet.samples.clone(),
            measured_depth: depth,
            temperature: packet.temperature,
            drive_voltage: packet.drive_voltage,
            resolution,
        });
        if let Err(e) = self.telemetry.send(record) {
            self.metrics.telemetry_errors += 1;
            error!("Error sending telemetry: {}", e);
        }

        if let Err(e) = self.depth.update(depth) {
            self.metrics.depth_errors += 1;
            error!("Error sending depth: {}", e);
        }
    }
}

/// Returns true when cancelled before the delay elapsed
async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(delay) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::ReaderError;
    use crate::telemetry::SinkError;
    use async_trait::async_trait;
    use echo_proto::ByteOrder;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    /// Reader whose packets are pushed by the test through a shared channel
    struct ChannelReader {
        label: String,
        packets: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Result<EchoPacket, ReaderError>>>>,
        events: Arc<Mutex<Vec<String>>>,
        fail_open: bool,
        stalled: bool,
    }

    #[async_trait]
    impl PacketReader for ChannelReader {
        async fn open(&mut self) -> Result<(), ReaderError> {
            self.events.lock().unwrap().push(format!("open {}", self.label));
            if self.fail_open {
                return Err(ReaderError::Transport(std::io::Error::other("no device")));
            }
            if self.stalled {
                std::future::pending::<()>().await;
            }
            Ok(())
        }

        async fn close(&mut self) {
            self.events.lock().unwrap().push(format!("close {}", self.label));
        }

        async fn read(&mut self) -> Result<EchoPacket, ReaderError> {
            let mut packets = self.packets.lock().await;
            packets.recv().await.unwrap_or(Err(ReaderError::Closed))
        }

        fn describe(&self) -> String {
            self.label.clone()
        }
    }

    struct ChannelFactory {
        packets: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Result<EchoPacket, ReaderError>>>>,
        events: Arc<Mutex<Vec<String>>>,
        fail_open: bool,
        /// Readers with this label never finish opening
        stalled_label: Option<&'static str>,
    }

    impl ReaderFactory for ChannelFactory {
        fn create(&self, config: &EchoConfig) -> Box<dyn PacketReader> {
            let label = format!("{:?}/{}", config.byte_order, config.num_samples);
            Box::new(ChannelReader {
                stalled: self.stalled_label == Some(label.as_str()),
                label,
                packets: Arc::clone(&self.packets),
                events: Arc::clone(&self.events),
                fail_open: self.fail_open,
            })
        }
    }

    #[derive(Default)]
    struct RecordingSinks {
        records: Mutex<Vec<Arc<EchoTelemetry>>>,
        depths: Mutex<Vec<f64>>,
        fail_telemetry: bool,
    }

    impl TelemetrySink for RecordingSinks {
        fn send(&self, record: Arc<EchoTelemetry>) -> Result<(), SinkError> {
            if self.fail_telemetry {
                return Err(SinkError("browser gone".to_string()));
            }
            self.records.lock().unwrap().push(record);
            Ok(())
        }
    }

    impl DepthSink for RecordingSinks {
        fn update(&self, depth: f64) -> Result<(), SinkError> {
            self.depths.lock().unwrap().push(depth);
            Ok(())
        }
    }

    struct Harness {
        settings: watch::Sender<EchoSnapshot>,
        packets: mpsc::UnboundedSender<Result<EchoPacket, ReaderError>>,
        events: Arc<Mutex<Vec<String>>>,
        sinks: Arc<RecordingSinks>,
        state: watch::Receiver<ReaderState>,
        cancel: CancellationToken,
        task: tokio::task::JoinHandle<()>,
    }

    fn start(initial: EchoSnapshot, sinks: RecordingSinks, fail_open: bool) -> Harness {
        start_with(initial, sinks, fail_open, None, Duration::from_millis(10))
    }

    fn start_with(
        initial: EchoSnapshot,
        sinks: RecordingSinks,
        fail_open: bool,
        stalled_label: Option<&'static str>,
        retry_delay: Duration,
    ) -> Harness {
        let (settings, settings_rx) = watch::channel(initial);
        let (packets, packets_rx) = mpsc::unbounded_channel();
        let events = Arc::new(Mutex::new(Vec::new()));
        let sinks = Arc::new(sinks);
        let factory = Arc::new(ChannelFactory {
            packets: Arc::new(tokio::sync::Mutex::new(packets_rx)),
            events: Arc::clone(&events),
            fail_open,
            stalled_label,
        });

        let reader = EchoReader::new(
            settings_rx,
            factory,
            sinks.clone() as Arc<dyn TelemetrySink>,
            sinks.clone() as Arc<dyn DepthSink>,
        )
        .with_retry_delay(retry_delay);
        let state = reader.subscribe_state();

        let cancel = CancellationToken::new();
        let task = tokio::spawn(reader.run(cancel.clone()));
        Harness { settings, packets, events, sinks, state, cancel, task }
    }

    fn packet(depth_index: usize) -> EchoPacket {
        EchoPacket {
            samples: vec![0; 10],
            depth_index,
            temperature: 21.0,
            drive_voltage: 12.0,
        }
    }

    fn config(byte_order: ByteOrder) -> EchoSnapshot {
        let mut config = EchoConfig::new(byte_order);
        config.num_samples = 10;
        Some(Arc::new(config))
    }

    async fn wait_for<F: Fn() -> bool>(condition: F) {
        for _ in 0..400 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_packets_are_calibrated_and_forwarded() {
        let h = start(config(ByteOrder::Little), RecordingSinks::default(), false);

        h.packets.send(Ok(packet(100))).unwrap();
        h.packets.send(Ok(packet(0))).unwrap();
        wait_for(|| h.sinks.depths.lock().unwrap().len() == 2).await;

        let depths = h.sinks.depths.lock().unwrap().clone();
        approx::assert_relative_eq!(depths[0], 0.9768, epsilon = 1e-9);
        assert_eq!(depths[1], 0.0);

        let records = h.sinks.records.lock().unwrap().clone();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].spectrogram.len(), 10);
        approx::assert_relative_eq!(records[0].resolution, 0.9768, epsilon = 1e-9);
        assert_eq!(records[0].temperature, 21.0);

        h.cancel.cancel();
        h.task.await.unwrap();
        assert_eq!(h.events.lock().unwrap().last().unwrap(), "close Little/10");
    }

    #[tokio::test]
    async fn test_idle_until_settings_arrive() {
        let h = start(None, RecordingSinks::default(), false);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(h.events.lock().unwrap().is_empty());

        h.settings.send_replace(config(ByteOrder::Big));
        wait_for(|| !h.events.lock().unwrap().is_empty()).await;
        h.packets.send(Ok(packet(1))).unwrap();
        wait_for(|| h.sinks.depths.lock().unwrap().len() == 1).await;

        h.cancel.cancel();
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_settings_update_restarts_reader_without_losing_packets() {
        let h = start(config(ByteOrder::Little), RecordingSinks::default(), false);

        h.packets.send(Ok(packet(1))).unwrap();
        wait_for(|| h.sinks.depths.lock().unwrap().len() == 1).await;

        h.settings.send_replace(config(ByteOrder::Big));
        wait_for(|| h.events.lock().unwrap().iter().any(|e| e == "open Big/10")).await;

        h.packets.send(Ok(packet(2))).unwrap();
        h.packets.send(Ok(packet(3))).unwrap();
        wait_for(|| h.sinks.depths.lock().unwrap().len() == 3).await;

        let events = h.events.lock().unwrap().clone();
        assert_eq!(events, vec!["open Little/10", "close Little/10", "open Big/10"]);

        h.cancel.cancel();
        h.task.await.unwrap();
        assert_eq!(h.events.lock().unwrap().last().unwrap(), "close Big/10");
    }

    #[tokio::test]
    async fn test_transport_error_reopens_reader() {
        let h = start(config(ByteOrder::Little), RecordingSinks::default(), false);

        h.packets.send(Err(ReaderError::Closed)).unwrap();
        wait_for(|| h.events.lock().unwrap().len() >= 3).await;
        h.packets.send(Ok(packet(5))).unwrap();
        wait_for(|| h.sinks.depths.lock().unwrap().len() == 1).await;

        let events = h.events.lock().unwrap().clone();
        assert_eq!(&events[..3], &["open Little/10", "close Little/10", "open Little/10"]);

        h.cancel.cancel();
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_open_failure_is_retried() {
        let h = start(config(ByteOrder::Little), RecordingSinks::default(), true);
        wait_for(|| h.events.lock().unwrap().iter().filter(|e| e.starts_with("open")).count() >= 3).await;
        assert!(!h.task.is_finished());

        h.cancel.cancel();
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_failing_telemetry_sink_does_not_block_depth() {
        let sinks = RecordingSinks {
            fail_telemetry: true,
            ..Default::default()
        };
        let h = start(config(ByteOrder::Little), sinks, false);

        h.packets.send(Ok(packet(10))).unwrap();
        h.packets.send(Ok(packet(20))).unwrap();
        wait_for(|| h.sinks.depths.lock().unwrap().len() == 2).await;
        assert!(h.sinks.records.lock().unwrap().is_empty());
        assert!(!h.task.is_finished());

        h.cancel.cancel();
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_state_idle_then_running() {
        let h = start(None, RecordingSinks::default(), false);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(*h.state.borrow(), ReaderState::Idle);

        h.settings.send_replace(config(ByteOrder::Little));
        wait_for(|| *h.state.borrow() == ReaderState::Running).await;

        h.cancel.cancel();
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_state_restarting_after_settings_update() {
        let h = start_with(
            config(ByteOrder::Little),
            RecordingSinks::default(),
            false,
            Some("Big/10"),
            Duration::from_millis(10),
        );
        wait_for(|| *h.state.borrow() == ReaderState::Running).await;

        // the replacement reader never finishes opening, so the state stays visible
        h.settings.send_replace(config(ByteOrder::Big));
        wait_for(|| h.events.lock().unwrap().iter().any(|e| e == "open Big/10")).await;
        assert_eq!(*h.state.borrow(), ReaderState::Restarting);

        h.cancel.cancel();
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_state_restarting_after_transport_error() {
        let h = start_with(
            config(ByteOrder::Little),
            RecordingSinks::default(),
            false,
            None,
            Duration::from_secs(30),
        );
        wait_for(|| *h.state.borrow() == ReaderState::Running).await;

        h.packets.send(Err(ReaderError::Closed)).unwrap();
        wait_for(|| *h.state.borrow() == ReaderState::Restarting).await;

        h.cancel.cancel();
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_restart_rebinds_the_same_udp_port() {
        use crate::config::ConnectionType;
        use crate::reader::TransportReaderFactory;
        use echo_proto::encode_frame;

        let port = std::net::UdpSocket::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();
        let udp_config = |num_samples: usize| {
            let mut config = EchoConfig::new(ByteOrder::Little);
            config.connection_type = ConnectionType::Udp;
            config.udp_host = "127.0.0.1".to_string();
            config.udp_port = port;
            config.num_samples = num_samples;
            Some(Arc::new(config))
        };

        let (settings, settings_rx) = watch::channel(udp_config(8));
        let sinks = Arc::new(RecordingSinks::default());
        // a failed reopen would park the reader far beyond the waits below
        let reader = EchoReader::new(
            settings_rx,
            Arc::new(TransportReaderFactory),
            sinks.clone() as Arc<dyn TelemetrySink>,
            sinks.clone() as Arc<dyn DepthSink>,
        )
        .with_retry_delay(Duration::from_secs(30));
        let state = reader.subscribe_state();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(reader.run(cancel.clone()));

        let sender = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = ("127.0.0.1", port);
        let received = |samples: usize| sinks.records.lock().unwrap().iter().any(|r| r.spectrogram.len() == samples);

        wait_for(|| *state.borrow() == ReaderState::Running).await;
        let frame = encode_frame(1, 20.0, 12.0, &[7; 8], ByteOrder::Little);
        for _ in 0..100 {
            sender.send_to(&frame, target).await.unwrap();
            if received(8) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(received(8));

        settings.send_replace(udp_config(6));
        let frame = encode_frame(1, 20.0, 12.0, &[7; 6], ByteOrder::Little);
        for _ in 0..100 {
            sender.send_to(&frame, target).await.unwrap();
            if received(6) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(received(6));
        assert_eq!(*state.borrow(), ReaderState::Running);

        cancel.cancel();
        task.await.unwrap();
    }
}
