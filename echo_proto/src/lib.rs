//! Open Echo Sonar Protocol Library
//!
//! This library implements the binary packet format emitted by the Open Echo
//! TUSS4470 sonar firmware:
//! - Packet codec (header layout, fixed-point fields, XOR checksum)
//! - Stream frame reader for byte streams such as a serial port
//! - Datagram assembler for UDP relays that split or coalesce frames
//!
//! # Wire format
//!
//! ```text
//! [0xAA] [depth u16] [temp i16 x100] [vdrv u16 x100] [N x u8 samples] [xor checksum]
//! ```
//!
//! The byte order of the three header fields depends on the firmware revision
//! and has to be supplied by the caller.
//!
//! # Example
//!
//! ```no_run
//! use echo_proto::{ByteOrder, DatagramAssembler};
//!
//! let mut assembler = DatagramAssembler::new(1800, ByteOrder::Little);
//! # let datagram: Vec<u8> = Vec::new();
//! for packet in assembler.push(&datagram) {
//!     println!("depth index: {}", packet.depth_index);
//! }
//! ```

pub mod assembler;
pub mod error;
pub mod framer;
pub mod packet;

// Re-export commonly used types
pub use assembler::DatagramAssembler;
pub use error::EchoError;
pub use framer::{FrameReader, FrameStats};
pub use packet::{checksum, encode_frame, frame_len, ByteOrder, EchoPacket, HEADER_LEN, START_BYTE};
