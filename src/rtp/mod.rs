//! RTP packet encoding/decoding.
//!
//! RTP header format (RFC 3550):
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |V=2|P|X|  CC   |M|     PT      |       sequence number         |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                           timestamp                           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |           synchronization source (SSRC) identifier            |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```

pub mod rtcp;
pub mod rtpdump;

use std::time::Duration;

use anyhow::{bail, Result};

/// Minimum RTP header size in bytes (no CSRC, no extension).
pub const RTP_HEADER_SIZE: usize = 12;

/// Dynamic payload type commonly negotiated for H.264.
pub const PT_H264_DEFAULT: u8 = 96;

/// RTP clock rate of video payloads (RFC 6184 section 8.2.1).
pub const VIDEO_CLOCK_RATE: u32 = 90_000;

/// Media time of `timestamp` relative to `base` on the video clock. The
/// timestamp may have wrapped past `base`.
pub fn media_time(timestamp: u32, base: u32) -> Duration {
    let ticks = u64::from(timestamp.wrapping_sub(base));
    Duration::from_micros(ticks * 1_000_000 / u64::from(VIDEO_CLOCK_RATE))
}

/// Compute the full RTP header length from raw packet bytes.
///
/// Accounts for CSRC entries and header extensions (RFC 3550 section 5.3.1).
/// Returns `None` if the packet is too short.
pub fn full_header_len(data: &[u8]) -> Option<usize> {
    if data.len() < RTP_HEADER_SIZE {
        return None;
    }
    let csrc_count = (data[0] & 0x0F) as usize;
    let has_extension = (data[0] >> 4) & 0x01 != 0;
    let mut len = RTP_HEADER_SIZE + csrc_count * 4;
    if data.len() < len {
        return None;
    }
    if has_extension {
        // profile (2 bytes) + length in 32-bit words (2 bytes)
        if data.len() < len + 4 {
            return None;
        }
        let ext_words = u16::from_be_bytes([data[len + 2], data[len + 3]]) as usize;
        len += 4 + ext_words * 4;
        if data.len() < len {
            return None;
        }
    }
    Some(len)
}

/// Parsed RTP packet.
#[derive(Debug, Clone)]
pub struct RtpPacket {
    pub marker: bool,
    pub payload_type: u8,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub csrc_count: u8,
    pub extension: bool,
    /// Payload with CSRCs, header extension and padding removed.
    pub payload: Vec<u8>,
}

/// Encode an RTP packet into bytes.
pub fn encode(
    payload_type: u8,
    seq: u16,
    timestamp: u32,
    ssrc: u32,
    marker: bool,
    payload: &[u8],
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(RTP_HEADER_SIZE + payload.len());

    // V=2, P=0, X=0, CC=0
    buf.push(0x80);
    buf.push(if marker { 0x80 } else { 0x00 } | (payload_type & 0x7F));
    buf.extend_from_slice(&seq.to_be_bytes());
    buf.extend_from_slice(&timestamp.to_be_bytes());
    buf.extend_from_slice(&ssrc.to_be_bytes());
    buf.extend_from_slice(payload);

    buf
}

/// Decode bytes into an RTP packet.
pub fn decode(data: &[u8]) -> Result<RtpPacket> {
    if data.len() < RTP_HEADER_SIZE {
        bail!("RTP packet too short: {} bytes", data.len());
    }

    let version = (data[0] >> 6) & 0x03;
    if version != 2 {
        bail!("Unsupported RTP version: {}", version);
    }

    let padding = (data[0] >> 5) & 0x01 != 0;
    let extension = (data[0] >> 4) & 0x01 != 0;
    let csrc_count = data[0] & 0x0F;
    let marker = (data[1] >> 7) & 0x01 != 0;
    let payload_type = data[1] & 0x7F;
    let sequence_number = u16::from_be_bytes([data[2], data[3]]);
    let timestamp = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
    let ssrc = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);

    let Some(header_len) = full_header_len(data) else {
        bail!(
            "RTP packet too short for {} CSRCs and extension: {} bytes",
            csrc_count,
            data.len()
        );
    };

    let mut end = data.len();
    if padding {
        // The last octet counts the padding octets, itself included.
        let pad = data[end - 1] as usize;
        if pad == 0 || header_len + pad > end {
            bail!("Invalid RTP padding length {}", pad);
        }
        end -= pad;
    }

    Ok(RtpPacket {
        marker,
        payload_type,
        sequence_number,
        timestamp,
        ssrc,
        csrc_count,
        extension,
        payload: data[header_len..end].to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode() {
        let payload = [0x65, 0x88, 0x80, 0x40];
        let encoded = encode(PT_H264_DEFAULT, 7, 90_000, 0x12345678, true, &payload);
        assert_eq!(encoded.len(), RTP_HEADER_SIZE + payload.len());

        let decoded = decode(&encoded).unwrap();
        assert!(decoded.marker);
        assert_eq!(decoded.payload_type, PT_H264_DEFAULT);
        assert_eq!(decoded.sequence_number, 7);
        assert_eq!(decoded.timestamp, 90_000);
        assert_eq!(decoded.ssrc, 0x12345678);
        assert_eq!(decoded.payload, payload);
    }

    #[test]
    fn test_decode_too_short() {
        assert!(decode(&[0x80, 0x60]).is_err());
    }

    #[test]
    fn test_decode_wrong_version() {
        let mut data = [0u8; 12];
        data[0] = 0x40; // version 1
        assert!(decode(&data).is_err());
    }

    #[test]
    fn test_decode_skips_csrc_and_extension() {
        let mut data = encode(PT_H264_DEFAULT, 1, 0, 1, false, &[]);
        data[0] = 0x80 | 0x10 | 0x01; // X=1, CC=1
        data.extend_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]); // CSRC
        data.extend_from_slice(&[0xBE, 0xDE, 0x00, 0x01]); // extension, 1 word
        data.extend_from_slice(&[0x10, 0x20, 0x30, 0x40]);
        data.extend_from_slice(&[0x41, 0x9A]);

        assert_eq!(full_header_len(&data), Some(24));
        let decoded = decode(&data).unwrap();
        assert_eq!(decoded.csrc_count, 1);
        assert!(decoded.extension);
        assert_eq!(decoded.payload, vec![0x41, 0x9A]);
    }

    #[test]
    fn test_decode_truncated_extension() {
        let mut data = encode(PT_H264_DEFAULT, 1, 0, 1, false, &[]);
        data[0] |= 0x10;
        data.extend_from_slice(&[0xBE, 0xDE, 0x00, 0x04]);
        assert_eq!(full_header_len(&data), None);
        assert!(decode(&data).is_err());
    }

    #[test]
    fn test_media_time() {
        assert_eq!(media_time(90_000, 0), Duration::from_secs(1));
        assert_eq!(media_time(3_000 + 4_500, 3_000), Duration::from_millis(50));
        // Wrapped past u32::MAX
        assert_eq!(media_time(8_999, u32::MAX - 9_000), Duration::from_millis(200));
    }

    #[test]
    fn test_decode_strips_padding() {
        let mut data = encode(PT_H264_DEFAULT, 1, 0, 1, false, &[0x41, 0x9A]);
        data[0] |= 0x20;
        data.extend_from_slice(&[0x00, 0x00, 0x03]);
        let decoded = decode(&data).unwrap();
        assert_eq!(decoded.payload, vec![0x41, 0x9A]);

        // Padding longer than the payload
        let mut bad = encode(PT_H264_DEFAULT, 1, 0, 1, false, &[0x02]);
        bad[0] |= 0x20;
        *bad.last_mut().unwrap() = 0x20;
        assert!(decode(&bad).is_err());
    }
}
