use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, warn};

use crate::error::EchoError;
use crate::packet::{ByteOrder, EchoPacket, HEADER_LEN, START_BYTE};

/// Counters for recoverable framing events.
///
/// Collected by the frame reader and the datagram assembler so dropped frames
/// show up in the metrics log instead of disappearing silently.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FrameStats {
    /// Frames decoded successfully
    pub packets: u64,
    /// Frames dropped on a checksum mismatch
    pub checksum_errors: u64,
    /// Frames dropped because of their size
    pub length_errors: u64,
    /// Bytes skipped while looking for a start byte
    pub discarded_bytes: u64,
}

impl FrameStats {
    pub fn record_error(&mut self, error: &EchoError) {
        match error {
            EchoError::Checksum { .. } => self.checksum_errors += 1,
            EchoError::Length { .. } => self.length_errors += 1,
        }
    }

    /// Return the counters accumulated so far and start again from zero
    pub fn take(&mut self) -> FrameStats {
        std::mem::take(self)
    }

    pub fn merge(&mut self, other: FrameStats) {
        self.packets += other.packets;
        self.checksum_errors += other.checksum_errors;
        self.length_errors += other.length_errors;
        self.discarded_bytes += other.discarded_bytes;
    }
}

/// Stream frame reader
///
/// Synchronises on the start byte of a continuous byte stream (serial port,
/// TCP relay, file) and reads each frame with exact-length reads.
///
/// A corrupt frame is logged and skipped; scanning resumes with the byte after
/// it. A short read means the stream is gone and is returned as an I/O error.
///
/// `next_packet` is not cancel safe: dropping it mid-frame loses that frame
/// and the next call resynchronises on the following start byte.
pub struct FrameReader<R> {
    inner: R,
    num_samples: usize,
    byte_order: ByteOrder,
    payload: Vec<u8>,
    stats: FrameStats,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, num_samples: usize, byte_order: ByteOrder) -> Self {
        Self {
            inner,
            num_samples,
            byte_order,
            payload: vec![0u8; HEADER_LEN + num_samples],
            stats: FrameStats::default(),
        }
    }

    /// Read until the next frame with a valid checksum
    pub async fn next_packet(&mut self) -> std::io::Result<EchoPacket> {
        loop {
            let byte = self.inner.read_u8().await?;
            if byte != START_BYTE {
                self.stats.discarded_bytes += 1;
                continue;
            }

            self.inner.read_exact(&mut self.payload).await?;
            let mut checksum = [0u8; 1];
            self.inner.read_exact(&mut checksum).await?;

            match EchoPacket::decode(&self.payload, &checksum, self.num_samples, self.byte_order) {
                Ok(packet) => {
                    self.stats.packets += 1;
                    return Ok(packet);
                }
                Err(e) => {
                    warn!(
                        payload_len = self.payload.len(),
                        checksum = checksum[0],
                        "Dropping frame: {}",
                        e
                    );
                    self.stats.record_error(&e);
                    debug!("Resynchronising on next start byte");
                }
            }
        }
    }

    /// Counters accumulated since the last call
    pub fn take_stats(&mut self) -> FrameStats {
        self.stats.take()
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::encode_frame;
    use tokio::io::AsyncWriteExt;

    fn frame(depth: u16, samples: &[u8]) -> Vec<u8> {
        encode_frame(depth, 21.5, 12.0, samples, ByteOrder::Little)
    }

    #[tokio::test]
    async fn test_leading_junk_is_skipped() {
        let mut stream = vec![0x00];
        stream.extend(frame(3, &[1, 2, 3, 4]));

        let mut reader = FrameReader::new(stream.as_slice(), 4, ByteOrder::Little);
        let packet = reader.next_packet().await.unwrap();
        assert_eq!(packet.depth_index, 3);
        assert_eq!(packet.samples, vec![1, 2, 3, 4]);

        // Nothing left: the stream is exhausted, not resynchronised into garbage
        let err = reader.next_packet().await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);

        let stats = reader.take_stats();
        assert_eq!(stats.packets, 1);
        assert_eq!(stats.discarded_bytes, 1);
    }

    #[tokio::test]
    async fn test_corrupt_frame_is_skipped() {
        let mut bad = frame(1, &[5, 5]);
        let last = bad.len() - 1;
        bad[last] ^= 0x01;

        let mut stream = bad;
        stream.extend(frame(2, &[6, 6]));

        let mut reader = FrameReader::new(stream.as_slice(), 2, ByteOrder::Little);
        let packet = reader.next_packet().await.unwrap();
        assert_eq!(packet.depth_index, 2);
        assert_eq!(packet.samples, vec![6, 6]);

        let stats = reader.take_stats();
        assert_eq!(stats.checksum_errors, 1);
        assert_eq!(stats.packets, 1);
        assert_eq!(reader.take_stats(), FrameStats::default());
    }

    #[tokio::test]
    async fn test_short_read_is_transport_error() {
        let full = frame(1, &[1, 2, 3, 4]);
        let truncated = &full[..full.len() - 2];

        let mut reader = FrameReader::new(truncated, 4, ByteOrder::Little);
        let err = reader.next_packet().await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn test_frames_arrive_in_order_across_writes() {
        let (mut tx, rx) = tokio::io::duplex(8);
        let mut reader = FrameReader::new(rx, 5, ByteOrder::Big);

        let writer = tokio::spawn(async move {
            for depth in 0..5u16 {
                let bytes = encode_frame(depth, 0.0, 0.0, &[7, 8, 9, 10, 11], ByteOrder::Big);
                tx.write_all(&bytes).await.unwrap();
            }
        });

        for depth in 0..5usize {
            assert_eq!(reader.next_packet().await.unwrap().depth_index, depth);
        }
        writer.await.unwrap();
    }

    #[test]
    fn test_stats_merge() {
        let mut total = FrameStats { packets: 1, checksum_errors: 2, length_errors: 3, discarded_bytes: 4 };
        total.merge(FrameStats { packets: 10, checksum_errors: 20, length_errors: 30, discarded_bytes: 40 });
        assert_eq!(total, FrameStats { packets: 11, checksum_errors: 22, length_errors: 33, discarded_bytes: 44 });
    }
}
