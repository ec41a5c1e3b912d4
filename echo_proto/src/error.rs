use thiserror::Error;

/// Errors raised while decoding a single sonar frame.
///
/// Both variants are recoverable: the caller drops the frame and keeps
/// scanning for the next start byte.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EchoError {
    #[error("invalid frame geometry: payload {payload} bytes (expected {expected}), checksum {checksum} bytes (expected 1)")]
    Length {
        payload: usize,
        checksum: usize,
        expected: usize,
    },

    #[error("checksum mismatch: computed {computed:#04x}, received {received:#04x}")]
    Checksum { computed: u8, received: u8 },
}

impl EchoError {
    pub fn is_checksum(&self) -> bool {
        matches!(self, EchoError::Checksum { .. })
    }
}
