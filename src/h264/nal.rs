//! H.264 NAL unit constants and the output unit handed to the decoder.
//!
//! NAL unit header (RFC 6184 section 1.3):
//! ```text
//! +---------------+
//! |0|1|2|3|4|5|6|7|
//! +-+-+-+-+-+-+-+-+
//! |F|NRI|  Type   |
//! +---------------+
//! ```

/// Annex B start code written in front of every output NAL unit.
pub const NAL_PREFIX: [u8; 4] = [0x00, 0x00, 0x00, 0x01];

pub const NAL_HEADER_SIZE: usize = 1;
/// FU indicator + FU header.
pub const FU_A_HEADER_SIZE: usize = 2;
/// Size of the 16-bit NALU length field inside a STAP-A.
pub const LENGTH_FIELD_SIZE: usize = 2;
/// STAP-A NAL header + first NALU size field.
pub const STAP_A_HEADER_SIZE: usize = NAL_HEADER_SIZE + LENGTH_FIELD_SIZE;

pub const TYPE_MASK: u8 = 0x1F;
/// forbidden_zero_bit and nal_ref_idc.
pub const F_NRI_MASK: u8 = 0xE0;
pub const FORBIDDEN_ZERO_BIT: u8 = 0x80;

// FU header bits
pub const FU_START_BIT: u8 = 0x80;
pub const FU_END_BIT: u8 = 0x40;

/// Zero bytes appended after every output NAL unit so that decoders reading
/// ahead in their bitstream parser never run past the buffer.
pub const DEFAULT_OUTPUT_PADDING_SIZE: usize = 64;

// H.264 nal_unit_type values
pub const NAL_TYPE_UNSPECIFIED: u8 = 0;
pub const NAL_TYPE_IDR: u8 = 5;
pub const NAL_TYPE_SEI: u8 = 6;
pub const NAL_TYPE_SPS: u8 = 7;
pub const NAL_TYPE_PPS: u8 = 8;
pub const NAL_TYPE_STAP_A: u8 = 24;
pub const NAL_TYPE_FU_A: u8 = 28;

/// The `nal_unit_type` carried in the low five bits of a NAL header octet.
pub fn nal_unit_type(octet: u8) -> u8 {
    octet & TYPE_MASK
}

/// Check that the NALU size fields of a STAP-A payload are consistent.
///
/// `buf` starts right after the STAP-A NAL header, i.e. at the first size
/// field. Every size field must be complete and every aggregated unit must
/// fit in what remains of the buffer.
pub fn verify_stap_a_nalu_lengths(buf: &[u8]) -> bool {
    let mut rest = buf;
    while !rest.is_empty() {
        if rest.len() < LENGTH_FIELD_SIZE {
            return false;
        }
        let nalu_size = u16::from_be_bytes([rest[0], rest[1]]) as usize;
        rest = &rest[LENGTH_FIELD_SIZE..];
        if nalu_size > rest.len() {
            return false;
        }
        rest = &rest[nalu_size..];
    }
    true
}

/// A NAL unit reconstructed from one or more RTP payloads.
///
/// The buffer holds the Annex B start code, the NAL unit itself and a region
/// of zero padding. The padding is not part of the logical length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NalUnit {
    buf: Vec<u8>,
    len: usize,
    nal_unit_type: u8,
    sequence_number: u16,
    key_frame: bool,
    complete: bool,
    rtp_marker: bool,
}

impl NalUnit {
    /// Wrap a buffer whose first `len` bytes are `prefix + NAL` and whose
    /// remaining bytes are padding.
    pub(crate) fn new(
        buf: Vec<u8>,
        len: usize,
        sequence_number: u16,
        complete: bool,
        rtp_marker: bool,
    ) -> Self {
        let nal = &buf[NAL_PREFIX.len().min(len)..len];
        let nal_unit_type = nal.first().map_or(NAL_TYPE_UNSPECIFIED, |&o| nal_unit_type(o));
        let key_frame = super::keyframe::is_key_frame(nal);
        Self {
            buf,
            len,
            nal_unit_type,
            sequence_number,
            key_frame,
            complete,
            rtp_marker,
        }
    }

    /// Start code and NAL unit, without padding.
    pub fn data(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    /// The NAL unit without the start code.
    pub fn nal(&self) -> &[u8] {
        &self.buf[NAL_PREFIX.len()..self.len]
    }

    /// The whole buffer including the trailing zero padding.
    pub fn padded(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_padded(self) -> Vec<u8> {
        self.buf
    }

    /// Logical length: start code plus NAL unit.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len <= NAL_PREFIX.len()
    }

    pub fn padding_len(&self) -> usize {
        self.buf.len() - self.len
    }

    pub fn nal_unit_type(&self) -> u8 {
        self.nal_unit_type
    }

    pub fn sequence_number(&self) -> u16 {
        self.sequence_number
    }

    pub fn is_key_frame(&self) -> bool {
        self.key_frame
    }

    /// `false` for a fragmented unit flushed after packet loss. Such a unit
    /// has its forbidden_zero_bit set.
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn rtp_marker(&self) -> bool {
        self.rtp_marker
    }

    pub(crate) fn set_rtp_marker(&mut self, marker: bool) {
        self.rtp_marker = marker;
    }
}
