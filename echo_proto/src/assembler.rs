use tracing::{trace, warn};

use crate::framer::FrameStats;
use crate::packet::{frame_len, ByteOrder, EchoPacket, HEADER_LEN, START_BYTE};

/// Datagram assembler
///
/// Stateful reassembly of sonar frames from datagrams of arbitrary size. A
/// relay may split one frame over several datagrams or put several frames in
/// one datagram; the assembler handles both.
///
/// Bytes are collected only after a start byte has been seen. When the buffer
/// holds a full frame it is decoded and the buffer cleared, whether decoding
/// succeeded or not. A corrupt frame is counted and the rest of the datagram is
/// still processed.
///
/// # Usage
///
/// ```no_run
/// use echo_proto::{ByteOrder, DatagramAssembler};
///
/// let mut assembler = DatagramAssembler::new(1800, ByteOrder::Little);
/// # let datagram = [0u8; 0];
/// for packet in assembler.push(&datagram) {
///     println!("{}", packet);
/// }
/// ```
pub struct DatagramAssembler {
    buffer: Vec<u8>,
    num_samples: usize,
    byte_order: ByteOrder,
    frame_len: usize,
    stats: FrameStats,
}

impl DatagramAssembler {
    pub fn new(num_samples: usize, byte_order: ByteOrder) -> Self {
        let frame_len = frame_len(num_samples);
        Self {
            buffer: Vec::with_capacity(frame_len),
            num_samples,
            byte_order,
            frame_len,
            stats: FrameStats::default(),
        }
    }

    /// Feed one datagram and return the frames it completed, in order
    pub fn push(&mut self, datagram: &[u8]) -> Vec<EchoPacket> {
        let mut packets = Vec::new();

        for &byte in datagram {
            if self.buffer.is_empty() && byte != START_BYTE {
                self.stats.discarded_bytes += 1;
                continue;
            }
            self.buffer.push(byte);

            if self.buffer.len() == self.frame_len {
                if let Some(packet) = self.decode_buffer() {
                    packets.push(packet);
                }
                self.buffer.clear();
            }
        }

        trace!(
            datagram_len = datagram.len(),
            decoded = packets.len(),
            buffered = self.buffer.len(),
            "Datagram processed"
        );
        packets
    }

    fn decode_buffer(&mut self) -> Option<EchoPacket> {
        let payload = &self.buffer[1..1 + HEADER_LEN + self.num_samples];
        let checksum = &self.buffer[self.frame_len - 1..];

        match EchoPacket::decode(payload, checksum, self.num_samples, self.byte_order) {
            Ok(packet) => {
                self.stats.packets += 1;
                Some(packet)
            }
            Err(e) => {
                warn!(frame_len = self.frame_len, checksum = checksum[0], "Dropping datagram frame: {}", e);
                self.stats.record_error(&e);
                None
            }
        }
    }

    /// Number of bytes of an incomplete frame currently held
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Counters accumulated since the last call
    pub fn take_stats(&mut self) -> FrameStats {
        self.stats.take()
    }
}
