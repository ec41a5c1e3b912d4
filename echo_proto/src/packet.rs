use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::EchoError;

/// First byte of every frame
pub const START_BYTE: u8 = 0xAA;

/// depth (u16) + temperature (i16) + drive voltage (u16)
pub const HEADER_LEN: usize = 6;

/// Byte order of the header fields.
///
/// Firmware revisions disagree on this and nothing in the frame says which one
/// is in use, so it is always configured explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ByteOrder {
    Little,
    Big,
}

impl ByteOrder {
    fn u16_from(self, bytes: [u8; 2]) -> u16 {
        match self {
            ByteOrder::Little => u16::from_le_bytes(bytes),
            ByteOrder::Big => u16::from_be_bytes(bytes),
        }
    }

    fn i16_from(self, bytes: [u8; 2]) -> i16 {
        match self {
            ByteOrder::Little => i16::from_le_bytes(bytes),
            ByteOrder::Big => i16::from_be_bytes(bytes),
        }
    }

    fn u16_to(self, value: u16) -> [u8; 2] {
        match self {
            ByteOrder::Little => value.to_le_bytes(),
            ByteOrder::Big => value.to_be_bytes(),
        }
    }

    fn i16_to(self, value: i16) -> [u8; 2] {
        match self {
            ByteOrder::Little => value.to_le_bytes(),
            ByteOrder::Big => value.to_be_bytes(),
        }
    }
}

/// Total length of a frame on the wire, start byte and checksum included
pub fn frame_len(num_samples: usize) -> usize {
    1 + HEADER_LEN + num_samples + 1
}

/// XOR of all bytes
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc ^ b)
}

/// One decoded sonar ping
#[derive(Debug, Clone, PartialEq)]
pub struct EchoPacket {
    /// Echo magnitude per sample row
    pub samples: Vec<u8>,
    /// Sample row of the detected bottom, clamped to `samples.len()`
    pub depth_index: usize,
    /// Degrees Celsius
    pub temperature: f64,
    /// Volts
    pub drive_voltage: f64,
}

impl EchoPacket {
    /// Decode the bytes following the start byte.
    ///
    /// `payload` is header plus samples, `checksum` the single trailing byte.
    pub fn decode(
        payload: &[u8],
        checksum_byte: &[u8],
        num_samples: usize,
        byte_order: ByteOrder,
    ) -> Result<Self, EchoError> {
        let expected = HEADER_LEN + num_samples;
        if payload.len() != expected || checksum_byte.len() != 1 {
            return Err(EchoError::Length {
                payload: payload.len(),
                checksum: checksum_byte.len(),
                expected,
            });
        }

        let computed = checksum(payload);
        if computed != checksum_byte[0] {
            return Err(EchoError::Checksum {
                computed,
                received: checksum_byte[0],
            });
        }

        let depth = byte_order.u16_from([payload[0], payload[1]]) as usize;
        let temp_scaled = byte_order.i16_from([payload[2], payload[3]]);
        let vdrv_scaled = byte_order.u16_from([payload[4], payload[5]]);

        Ok(Self {
            samples: payload[HEADER_LEN..].to_vec(),
            depth_index: depth.min(num_samples),
            temperature: temp_scaled as f64 / 100.0,
            drive_voltage: vdrv_scaled as f64 / 100.0,
        })
    }

    /// Encode into a complete frame
    pub fn encode(&self, byte_order: ByteOrder) -> Vec<u8> {
        let depth = u16::try_from(self.depth_index).unwrap_or(u16::MAX);
        encode_frame(depth, self.temperature, self.drive_voltage, &self.samples, byte_order)
    }
}

/// Build a complete frame the way the firmware does.
///
/// Temperature and drive voltage are rounded to hundredths and saturate at the
/// limits of their 16 bit fields.
pub fn encode_frame(
    depth: u16,
    temperature: f64,
    drive_voltage: f64,
    samples: &[u8],
    byte_order: ByteOrder,
) -> Vec<u8> {
    let temp_scaled = (temperature * 100.0).round() as i16;
    let vdrv_scaled = (drive_voltage * 100.0).round() as u16;

    let mut frame = Vec::with_capacity(frame_len(samples.len()));
    frame.push(START_BYTE);
    frame.extend_from_slice(&byte_order.u16_to(depth));
    frame.extend_from_slice(&byte_order.i16_to(temp_scaled));
    frame.extend_from_slice(&byte_order.u16_to(vdrv_scaled));
    frame.extend_from_slice(samples);
    frame.push(checksum(&frame[1..]));
    frame
}

impl fmt::Display for EchoPacket {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Echo: {} samples | Depth index: {} | Temp: {:.2} C | Vdrv: {:.2} V",
            self.samples.len(),
            self.depth_index,
            self.temperature,
            self.drive_voltage
        )
    }
}
