//! RTCP parsing and Picture Loss Indication (RFC 3550, RFC 4585).
//!
//! A PLI is the key frame request sent back to the H.264 sender. Incoming
//! compound packets are split into blocks so the CLI can report what a
//! capture contains.

use std::sync::mpsc::{SyncSender, TrySendError};

use anyhow::{anyhow, bail, Context, Result};

use crate::h264::scheduler::KeyFrameRequester;

/// RTCP packet types (RFC 3550 section 12.1, RFC 4585 section 6.1).
const PT_SR: u8 = 200;
const PT_RR: u8 = 201;
const PT_SDES: u8 = 202;
const PT_PSFB: u8 = 206;

/// Payload-specific feedback message type for PLI.
const FMT_PLI: u8 = 1;

/// PLI packet size: common header + sender SSRC + media SSRC.
pub const PLI_SIZE: usize = 12;

/// Parsed RTCP block from an incoming compound packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RtcpBlock {
    SenderReport {
        ssrc: u32,
        ntp_timestamp: u64,
        rtp_timestamp: u32,
        sender_packet_count: u32,
        sender_octet_count: u32,
    },
    ReceiverReport {
        ssrc: u32,
    },
    Sdes,
    Pli {
        sender_ssrc: u32,
        media_ssrc: u32,
    },
    Unknown(u8),
}

/// Check if a UDP packet is RTCP (demux from RTP on the same port).
///
/// RTCP packet types 200-206 occupy byte[1] where RTP carries M|PT; with
/// RFC 5761 multiplexing RTP payload types never fall in that range.
pub fn is_rtcp_packet(data: &[u8]) -> bool {
    if data.len() < 8 {
        return false;
    }
    (PT_SR..=PT_PSFB).contains(&data[1])
}

/// Generate a random SSRC via OS CSPRNG.
pub fn generate_ssrc() -> Result<u32> {
    let mut buf = [0u8; 4];
    getrandom::getrandom(&mut buf).map_err(|e| anyhow!("OS CSPRNG failed: {}", e))?;
    Ok(u32::from_be_bytes(buf))
}

/// Build a Picture Loss Indication.
///
/// ```text
///  0                   1                   2                   3
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |V=2|P| FMT=1   |    PT=206     |          length=2             |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                  SSRC of packet sender                        |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                  SSRC of media source                         |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
pub fn build_pli(sender_ssrc: u32, media_ssrc: u32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(PLI_SIZE);
    buf.push(0x80 | FMT_PLI);
    buf.push(PT_PSFB);
    buf.extend_from_slice(&2u16.to_be_bytes());
    buf.extend_from_slice(&sender_ssrc.to_be_bytes());
    buf.extend_from_slice(&media_ssrc.to_be_bytes());
    buf
}

/// Parse an incoming RTCP compound packet into blocks. Parsing stops at the
/// first packet whose length runs past the buffer.
pub fn parse_rtcp(data: &[u8]) -> Vec<RtcpBlock> {
    let mut blocks = Vec::new();
    let mut offset = 0;

    while offset + 4 <= data.len() {
        let fmt = data[offset] & 0x1F;
        let pt = data[offset + 1];
        let length_words = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
        let packet_len = (length_words + 1) * 4;

        if offset + packet_len > data.len() {
            break;
        }

        let pkt = &data[offset..offset + packet_len];

        match pt {
            PT_SR if pkt.len() >= 28 => {
                let ntp_hi = read_u32(pkt, 8);
                let ntp_lo = read_u32(pkt, 12);
                blocks.push(RtcpBlock::SenderReport {
                    ssrc: read_u32(pkt, 4),
                    ntp_timestamp: ((ntp_hi as u64) << 32) | ntp_lo as u64,
                    rtp_timestamp: read_u32(pkt, 16),
                    sender_packet_count: read_u32(pkt, 20),
                    sender_octet_count: read_u32(pkt, 24),
                });
            }
            PT_RR if pkt.len() >= 8 => {
                blocks.push(RtcpBlock::ReceiverReport {
                    ssrc: read_u32(pkt, 4),
                });
            }
            PT_SDES => blocks.push(RtcpBlock::Sdes),
            PT_PSFB if fmt == FMT_PLI && pkt.len() >= PLI_SIZE => {
                blocks.push(RtcpBlock::Pli {
                    sender_ssrc: read_u32(pkt, 4),
                    media_ssrc: read_u32(pkt, 8),
                });
            }
            other => blocks.push(RtcpBlock::Unknown(other)),
        }

        offset += packet_len;
    }

    blocks
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

/// Requests key frames by queueing a PLI for the RTCP sender.
///
/// Never blocks: a full queue means the request is reported as failed and the
/// scheduler tries again after its minimum interval.
pub struct PliRequester {
    sender_ssrc: u32,
    media_ssrc: u32,
    tx: SyncSender<Vec<u8>>,
}

impl PliRequester {
    /// Create a requester with a random sender SSRC.
    pub fn new(media_ssrc: u32, tx: SyncSender<Vec<u8>>) -> Result<Self> {
        let sender_ssrc = generate_ssrc().context("Failed to generate RTCP sender SSRC")?;
        Ok(Self::with_sender_ssrc(sender_ssrc, media_ssrc, tx))
    }

    pub fn with_sender_ssrc(sender_ssrc: u32, media_ssrc: u32, tx: SyncSender<Vec<u8>>) -> Self {
        Self {
            sender_ssrc,
            media_ssrc,
            tx,
        }
    }

    pub fn sender_ssrc(&self) -> u32 {
        self.sender_ssrc
    }
}

impl KeyFrameRequester for PliRequester {
    fn request_key_frame(&self) -> Result<bool> {
        match self.tx.try_send(build_pli(self.sender_ssrc, self.media_ssrc)) {
            Ok(()) => Ok(true),
            Err(TrySendError::Full(_)) => {
                tracing::debug!("RTCP queue full, PLI not sent");
                Ok(false)
            }
            Err(TrySendError::Disconnected(_)) => bail!("RTCP sender is gone"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_build_pli_layout() {
        let pli = build_pli(0x11223344, 0xAABBCCDD);
        assert_eq!(
            pli,
            vec![0x81, 206, 0x00, 0x02, 0x11, 0x22, 0x33, 0x44, 0xAA, 0xBB, 0xCC, 0xDD]
        );
        assert!(is_rtcp_packet(&pli));
    }

    #[test]
    fn test_parse_pli() {
        let blocks = parse_rtcp(&build_pli(1, 2));
        assert_eq!(
            blocks,
            vec![RtcpBlock::Pli {
                sender_ssrc: 1,
                media_ssrc: 2
            }]
        );
    }

    #[test]
    fn test_parse_compound_rr_and_sdes() {
        let mut buf = vec![0x80, PT_RR, 0x00, 0x01];
        buf.extend_from_slice(&0xAABBCCDDu32.to_be_bytes());
        // SDES with one empty chunk
        buf.extend_from_slice(&[0x81, PT_SDES, 0x00, 0x01, 0, 0, 0, 1]);
        // FIR (PSFB FMT=4) is not a PLI
        buf.extend_from_slice(&[0x84, PT_PSFB, 0x00, 0x02, 0, 0, 0, 1, 0, 0, 0, 2]);

        let blocks = parse_rtcp(&buf);
        assert_eq!(
            blocks,
            vec![
                RtcpBlock::ReceiverReport { ssrc: 0xAABBCCDD },
                RtcpBlock::Sdes,
                RtcpBlock::Unknown(PT_PSFB),
            ]
        );
    }

    #[test]
    fn test_parse_sender_report() {
        let mut sr = vec![0x80, PT_SR, 0x00, 0x06];
        for word in [0x12345678u32, 1, 2, 90_000, 100, 16_000] {
            sr.extend_from_slice(&word.to_be_bytes());
        }
        match &parse_rtcp(&sr)[0] {
            RtcpBlock::SenderReport {
                ssrc,
                ntp_timestamp,
                rtp_timestamp,
                sender_packet_count,
                sender_octet_count,
            } => {
                assert_eq!(*ssrc, 0x12345678);
                assert_eq!(*ntp_timestamp, (1u64 << 32) | 2);
                assert_eq!(*rtp_timestamp, 90_000);
                assert_eq!(*sender_packet_count, 100);
                assert_eq!(*sender_octet_count, 16_000);
            }
            other => panic!("Expected SenderReport, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_truncated_stops() {
        let pli = build_pli(1, 2);
        assert!(parse_rtcp(&pli[..8]).is_empty());
    }

    #[test]
    fn test_is_rtcp_packet() {
        let rtp = [0x80, 96, 0, 1, 0, 0, 0, 0, 0, 0, 0, 0];
        assert!(!is_rtcp_packet(&rtp));
        assert!(!is_rtcp_packet(&[0x80, PT_RR]));
    }

    #[test]
    fn test_pli_requester_queues_pli() {
        let (tx, rx) = mpsc::sync_channel(1);
        let requester = PliRequester::with_sender_ssrc(7, 9, tx);

        assert!(requester.request_key_frame().unwrap());
        assert_eq!(rx.try_recv().unwrap(), build_pli(7, 9));
    }

    #[test]
    fn test_pli_requester_full_queue() {
        let (tx, _rx) = mpsc::sync_channel(1);
        let requester = PliRequester::with_sender_ssrc(7, 9, tx);

        assert!(requester.request_key_frame().unwrap());
        assert!(!requester.request_key_frame().unwrap());
    }

    #[test]
    fn test_pli_requester_closed_queue() {
        let (tx, rx) = mpsc::sync_channel(1);
        drop(rx);
        let requester = PliRequester::new(9, tx).unwrap();
        assert!(requester.request_key_frame().is_err());
    }
}
