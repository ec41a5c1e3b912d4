use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use echo_proto::{ByteOrder, DatagramAssembler, EchoPacket, FrameStats};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, trace, warn};

use super::{PacketReader, ReaderError};
use crate::config::EchoConfig;

/// Largest datagram accepted from the relay
const MAX_DATAGRAM: usize = 65_536;

/// Sonar reader for a UDP relay
///
/// A receive task feeds every datagram to a [`DatagramAssembler`] and queues
/// the decoded packets; `read` pops them in arrival order.
pub struct UdpReader {
    host: String,
    port: u16,
    num_samples: usize,
    byte_order: ByteOrder,
    queue: Option<mpsc::UnboundedReceiver<EchoPacket>>,
    receiver: Option<JoinHandle<()>>,
    stats: Arc<Mutex<FrameStats>>,
    local_addr: Option<SocketAddr>,
}

impl UdpReader {
    pub fn from_config(config: &EchoConfig) -> Self {
        Self {
            host: config.udp_host.clone(),
            port: config.udp_port,
            num_samples: config.num_samples,
            byte_order: config.byte_order,
            queue: None,
            receiver: None,
            stats: Arc::new(Mutex::new(FrameStats::default())),
            local_addr: None,
        }
    }

    /// Address actually bound, available after `open`
    #[cfg(test)]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }
}

async fn receive_datagrams(
    socket: UdpSocket,
    mut assembler: DatagramAssembler,
    queue: mpsc::UnboundedSender<EchoPacket>,
    stats: Arc<Mutex<FrameStats>>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (len, peer) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                warn!("UDP receive failed: {}", e);
                return;
            }
        };
        trace!(len, %peer, "Datagram received");

        let packets = assembler.push(&buf[..len]);
        stats.lock().unwrap_or_else(|e| e.into_inner()).merge(assembler.take_stats());

        for packet in packets {
            if queue.send(packet).is_err() {
                // Reader side is gone
                return;
            }
        }
    }
}

#[async_trait]
impl PacketReader for UdpReader {
    async fn open(&mut self) -> Result<(), ReaderError> {
        let socket = UdpSocket::bind((self.host.as_str(), self.port)).await?;
        let local_addr = socket.local_addr()?;

        let (tx, rx) = mpsc::unbounded_channel();
        let assembler = DatagramAssembler::new(self.num_samples, self.byte_order);
        self.receiver = Some(tokio::spawn(receive_datagrams(socket, assembler, tx, Arc::clone(&self.stats))));
        self.queue = Some(rx);
        self.local_addr = Some(local_addr);

        info!("UDP listener bound to {}", local_addr);
        Ok(())
    }

    /// Returns once the receive task is gone and the socket is unbound
    async fn close(&mut self) {
        if let Some(receiver) = self.receiver.take() {
            receiver.abort();
            // Cancelled is the expected outcome; the socket drops with the task
            if let Err(e) = receiver.await
                && e.is_panic()
            {
                warn!("UDP receive task panicked: {}", e);
            }
        }
        if let Some(addr) = self.local_addr.take() {
            info!("UDP listener on {} closed", addr);
        }
        self.queue = None;
    }

    async fn read(&mut self) -> Result<EchoPacket, ReaderError> {
        let queue = self.queue.as_mut().ok_or(ReaderError::NotOpen)?;
        queue.recv().await.ok_or(ReaderError::Closed)
    }

    fn take_stats(&mut self) -> FrameStats {
        self.stats.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    fn describe(&self) -> String {
        format!("udp://{}:{}", self.host, self.port)
    }
}

impl Drop for UdpReader {
    fn drop(&mut self) {
        if let Some(receiver) = self.receiver.take() {
            receiver.abort();
        }
    }
}
