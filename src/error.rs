//! Errors surfaced by the depacketizer.
//!
//! Malformed RTP payloads are never errors: they are logged and dropped.
//! The only condition that fails a `process` call is running out of memory
//! while growing the NAL unit output buffer.

use std::collections::TryReserveError;

#[derive(Debug, thiserror::Error)]
pub enum DepacketizerError {
    #[error("failed to grow NAL unit output buffer to {requested} bytes")]
    OutputBuffer {
        requested: usize,
        #[source]
        source: TryReserveError,
    },
}

pub type Result<T> = std::result::Result<T, DepacketizerError>;

/// Grow `buf` so that `additional` more bytes fit without reallocating.
pub(crate) fn reserve(buf: &mut Vec<u8>, additional: usize) -> Result<()> {
    buf.try_reserve(additional)
        .map_err(|source| DepacketizerError::OutputBuffer {
            requested: buf.len().saturating_add(additional),
            source,
        })
}
