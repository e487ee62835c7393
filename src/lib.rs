//! Depacketizer turning H.264 RTP payloads into Annex B NAL units, with
//! key frame requests sent back to the stream's origin on packet loss.

pub mod config;
pub mod error;
pub mod h264;
pub mod rtp;

pub use error::{DepacketizerError, Result};
