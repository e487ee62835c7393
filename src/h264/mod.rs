//! H.264 over RTP (RFC 6184): NAL unit reassembly and key frame requests.

pub mod depacketizer;
pub mod keyframe;
pub mod nal;
pub mod scheduler;

pub use depacketizer::{
    Depacketizer, DepacketizerStats, FragmentationState, ProcessResult, ReassemblyEngine, Step,
};
pub use keyframe::{is_key_frame, is_key_frame_in};
pub use nal::*;
pub use scheduler::{
    KeyFrameControl, KeyFrameRequestScheduler, KeyFrameRequester, KeyFrameState, RequestTiming,
};
