//! Key frame detection on RTP payloads and NAL units.
//!
//! Works on single NAL unit packets, STAP-A aggregation packets and FU-A
//! fragments. Never panics: short or corrupt input is simply not a key frame.

use super::nal::{
    nal_unit_type, verify_stap_a_nalu_lengths, FU_A_HEADER_SIZE, NAL_HEADER_SIZE, NAL_TYPE_FU_A,
    NAL_TYPE_IDR, NAL_TYPE_PPS, NAL_TYPE_SEI, NAL_TYPE_SPS, NAL_TYPE_STAP_A, STAP_A_HEADER_SIZE,
};

/// Returns true if `buf` starts a key frame.
pub fn is_key_frame(buf: &[u8]) -> bool {
    let Some(&octet) = buf.first() else {
        return false;
    };

    if nal_unit_type(octet) == NAL_TYPE_FU_A {
        fu_a_is_key_frame(buf)
    } else {
        single_nalu_is_key_frame(buf)
    }
}

/// Returns true if the `len` bytes of `buf` starting at `offset` start a key
/// frame. A range outside of `buf` is not a key frame.
pub fn is_key_frame_in(buf: &[u8], offset: usize, len: usize) -> bool {
    offset
        .checked_add(len)
        .and_then(|end| buf.get(offset..end))
        .is_some_and(is_key_frame)
}

fn fu_a_is_key_frame(buf: &[u8]) -> bool {
    if buf.len() < FU_A_HEADER_SIZE {
        return false;
    }
    nal_unit_type(buf[1]) == NAL_TYPE_IDR
}

fn single_nalu_is_key_frame(buf: &[u8]) -> bool {
    let mut nal_type = nal_unit_type(buf[0]);

    if nal_type == NAL_TYPE_STAP_A {
        if buf.len() <= STAP_A_HEADER_SIZE {
            tracing::debug!("STAP-A header truncated ({} bytes)", buf.len());
            return false;
        }
        if !verify_stap_a_nalu_lengths(&buf[NAL_HEADER_SIZE..]) {
            tracing::debug!("STAP-A packet with inconsistent NALU lengths");
            return false;
        }
        // Header of the first aggregated unit.
        nal_type = nal_unit_type(buf[STAP_A_HEADER_SIZE]);
    }

    matches!(
        nal_type,
        NAL_TYPE_IDR | NAL_TYPE_SPS | NAL_TYPE_PPS | NAL_TYPE_SEI
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idr_single_nal_is_key_frame() {
        assert!(is_key_frame(&[0x65, 0x88, 0x80]));
    }

    #[test]
    fn test_parameter_sets_and_sei_are_key_frames() {
        assert!(is_key_frame(&[0x67, 0x42, 0xC0]));
        assert!(is_key_frame(&[0x68, 0xCE]));
        assert!(is_key_frame(&[0x06, 0x05]));
    }

    #[test]
    fn test_non_idr_slice_is_not_key_frame() {
        assert!(!is_key_frame(&[0x41, 0x9A, 0x00]));
    }

    #[test]
    fn test_empty_is_not_key_frame() {
        assert!(!is_key_frame(&[]));
    }

    #[test]
    fn test_fu_a_start_of_idr_is_key_frame() {
        // FU indicator NRI=3 type 28, FU header S=1 type 5
        assert!(is_key_frame(&[0x7C, 0x85, 0xAA]));
    }

    #[test]
    fn test_fu_a_of_non_idr_is_not_key_frame() {
        assert!(!is_key_frame(&[0x7C, 0x81, 0xAA]));
    }

    #[test]
    fn test_fu_a_truncated_is_not_key_frame() {
        assert!(!is_key_frame(&[0x7C]));
    }

    #[test]
    fn test_stap_a_with_sps_first_is_key_frame() {
        let stap = [
            0x78, // STAP-A, NRI=3
            0x00, 0x03, 0x67, 0x42, 0xC0, // SPS
            0x00, 0x02, 0x68, 0xCE, // PPS
        ];
        assert!(is_key_frame(&stap));
    }

    #[test]
    fn test_stap_a_with_slice_first_is_not_key_frame() {
        let stap = [0x78, 0x00, 0x02, 0x41, 0x9A];
        assert!(!is_key_frame(&stap));
    }

    #[test]
    fn test_stap_a_truncated_header_is_not_key_frame() {
        assert!(!is_key_frame(&[0x78, 0x00, 0x03]));
        assert!(!is_key_frame(&[0x78]));
    }

    #[test]
    fn test_stap_a_corrupt_length_table_is_not_key_frame() {
        // Declares 16 bytes but only 3 follow.
        let stap = [0x78, 0x00, 0x10, 0x67, 0x42, 0xC0];
        assert!(!is_key_frame(&stap));
    }

    #[test]
    fn test_is_key_frame_in_range() {
        let buf = [0xFF, 0xFF, 0x65, 0x88];
        assert!(is_key_frame_in(&buf, 2, 2));
        assert!(!is_key_frame_in(&buf, 0, 2));
        assert!(!is_key_frame_in(&buf, 3, 4));
        assert!(!is_key_frame_in(&buf, usize::MAX, 2));
        assert!(!is_key_frame_in(&buf, 2, 0));
    }
}
