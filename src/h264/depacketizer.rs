//! Reassembles H.264 NAL units from RTP payloads (RFC 6184).
//!
//! Handles Single NAL Unit packets (types 1-23) and FU-A fragmentation units
//! (type 28). Every output NAL unit is written as
//! `00 00 00 01 | NAL unit | zero padding`.
//!
//! The depacketizer does not reorder. Any sequence number other than the
//! direct successor of the previous one counts as packet loss: a FU-A unit
//! interrupted by loss is either flushed with its forbidden_zero_bit set, so
//! the decoder can still use what arrived, or discarded. Loss also arms a key
//! frame request toward the remote peer, see [`super::scheduler`].

use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::time::Instant;

use super::nal::{
    nal_unit_type, NalUnit, FORBIDDEN_ZERO_BIT, FU_A_HEADER_SIZE, FU_END_BIT, FU_START_BIT,
    F_NRI_MASK, NAL_HEADER_SIZE, NAL_PREFIX, NAL_TYPE_FU_A, NAL_TYPE_IDR, NAL_TYPE_PPS,
    NAL_TYPE_SPS, NAL_TYPE_UNSPECIFIED,
};
use super::scheduler::{KeyFrameControl, KeyFrameRequestScheduler, RequestTiming};
use crate::config::DepacketizerConfig;
use crate::error::{reserve, Result};

/// Outcome of feeding one RTP payload to the depacketizer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessResult {
    /// A NAL unit is ready for the decoder.
    Produced(NalUnit),
    /// Packet loss interrupted a fragmented NAL unit, which is returned
    /// incomplete. The input packet was NOT consumed and must be passed again.
    Flushed(NalUnit),
    /// The packet was a fragment; the NAL unit is not complete yet.
    NeedsMoreInput,
    /// The packet was malformed, unsupported or orphaned and was discarded.
    Dropped,
}

/// Result of [`ReassemblyEngine::process`].
#[derive(Debug)]
pub struct Step {
    pub result: ProcessResult,
    /// The packet did not directly follow the previous one.
    pub loss_detected: bool,
}

/// Snapshot of the FU-A reassembly state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FragmentationState {
    pub started: bool,
    pub nal_unit_type: u8,
    /// Bytes written so far, start code and reconstructed header included.
    pub accumulated_length: usize,
}

/// Stateful RTP payload to NAL unit converter.
pub struct ReassemblyEngine {
    output_incomplete_nal_units: bool,
    padding: usize,
    /// Start code, reconstructed NAL header and the fragments received so far.
    /// Only meaningful while `fu_started`.
    fragment: Vec<u8>,
    fu_started: bool,
    /// Sequence number of the last fragment appended.
    fragment_seq: u16,
    last_sequence_number: Option<u16>,
    /// Type of the last logical NAL unit seen. For FU-A this is the type of
    /// the fragmented unit, not 28.
    nal_unit_type: u8,
}

impl ReassemblyEngine {
    pub fn new(output_incomplete_nal_units: bool, padding: usize) -> Self {
        Self {
            output_incomplete_nal_units,
            padding,
            fragment: Vec::new(),
            fu_started: false,
            fragment_seq: 0,
            last_sequence_number: None,
            nal_unit_type: NAL_TYPE_UNSPECIFIED,
        }
    }

    pub fn nal_unit_type(&self) -> u8 {
        self.nal_unit_type
    }

    pub fn last_sequence_number(&self) -> Option<u16> {
        self.last_sequence_number
    }

    pub fn fragmentation_state(&self) -> FragmentationState {
        FragmentationState {
            started: self.fu_started,
            nal_unit_type: if self.fu_started {
                self.nal_unit_type
            } else {
                NAL_TYPE_UNSPECIFIED
            },
            accumulated_length: if self.fu_started {
                self.fragment.len()
            } else {
                0
            },
        }
    }

    /// Forget everything, as if no packet had been seen.
    pub fn reset_state(&mut self) {
        self.discard_fragment();
        self.fragment = Vec::new();
        self.last_sequence_number = None;
        self.nal_unit_type = NAL_TYPE_UNSPECIFIED;
    }

    /// Process one RTP payload.
    ///
    /// Only a failure to grow the output buffer is an error; bad input is
    /// logged and dropped.
    pub fn process(&mut self, payload: &[u8], sequence_number: u16, marker: bool) -> Result<Step> {
        let mut loss_detected = false;

        if let Some(last) = self.last_sequence_number {
            // Sequence numbers wrap, so only the direct successor is contiguous.
            if sequence_number != last.wrapping_add(1) {
                tracing::debug!(
                    "Dropped RTP packets after seq {} and continuing with seq {}",
                    last,
                    sequence_number
                );
                loss_detected = true;
                if let Some(nal) = self.flush_interrupted()? {
                    return Ok(Step {
                        result: ProcessResult::Flushed(nal),
                        loss_detected,
                    });
                }
            }
        }

        self.last_sequence_number = Some(sequence_number);

        let result = match self.depacketize(payload, sequence_number)? {
            ProcessResult::Produced(mut nal) => {
                nal.set_rtp_marker(marker);
                ProcessResult::Produced(nal)
            }
            other => other,
        };

        Ok(Step {
            result,
            loss_detected,
        })
    }

    /// Terminate the fragmented unit in progress after packet loss.
    ///
    /// Returns it with the forbidden_zero_bit set if incomplete units are
    /// wanted and it holds at least one payload byte past the header;
    /// otherwise it is discarded.
    fn flush_interrupted(&mut self) -> Result<Option<NalUnit>> {
        let started = std::mem::replace(&mut self.fu_started, false);
        let min_len = NAL_PREFIX.len() + NAL_HEADER_SIZE + 1;

        if !(self.output_incomplete_nal_units && started && self.fragment.len() >= min_len) {
            if started {
                tracing::debug!(
                    "Discarding incomplete NAL unit ({} bytes)",
                    self.fragment.len()
                );
            }
            self.fragment.clear();
            return Ok(None);
        }

        let mut buf = std::mem::take(&mut self.fragment);
        buf[NAL_PREFIX.len()] |= FORBIDDEN_ZERO_BIT;
        tracing::debug!(
            "Flushing incomplete NAL unit of type {} ({} bytes)",
            self.nal_unit_type,
            buf.len()
        );
        let seq = self.fragment_seq;
        self.finish(buf, seq, false).map(Some)
    }

    fn depacketize(&mut self, payload: &[u8], seq: u16) -> Result<ProcessResult> {
        let Some(&octet) = payload.first() else {
            tracing::debug!("Dropping empty RTP payload (seq {})", seq);
            self.nal_unit_type = NAL_TYPE_UNSPECIFIED;
            self.discard_fragment();
            return Ok(ProcessResult::Dropped);
        };

        match nal_unit_type(octet) {
            1..=23 => {
                self.discard_fragment();
                self.single_nal_unit(payload, seq)
            }
            NAL_TYPE_FU_A => self.fu_a(payload, seq),
            other => {
                // STAP-A/B, MTAP16/24, FU-B and reserved types
                tracing::debug!("Dropping NAL unit of unsupported type {}", other);
                self.nal_unit_type = other;
                self.discard_fragment();
                Ok(ProcessResult::Dropped)
            }
        }
    }

    fn single_nal_unit(&mut self, payload: &[u8], seq: u16) -> Result<ProcessResult> {
        self.nal_unit_type = nal_unit_type(payload[0]);

        let mut buf = Vec::new();
        reserve(&mut buf, NAL_PREFIX.len() + payload.len() + self.padding)?;
        buf.extend_from_slice(&NAL_PREFIX);
        buf.extend_from_slice(payload);

        self.finish(buf, seq, true).map(ProcessResult::Produced)
    }

    //  0                   1                   2                   3
    //  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
    // +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    // | FU indicator  |   FU header   |                               |
    // +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+                               |
    // |                         FU payload                            |
    // +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    //
    // FU indicator: |F|NRI|Type=28|    FU header: |S|E|R|Type|
    fn fu_a(&mut self, payload: &[u8], seq: u16) -> Result<ProcessResult> {
        if payload.len() < FU_A_HEADER_SIZE {
            tracing::debug!("FU-A packet too short ({} bytes)", payload.len());
            self.nal_unit_type = NAL_TYPE_UNSPECIFIED;
            self.discard_fragment();
            return Ok(ProcessResult::Dropped);
        }

        let fu_indicator = payload[0];
        let fu_header = payload[1];
        let data = &payload[FU_A_HEADER_SIZE..];
        let is_start = fu_header & FU_START_BIT != 0;
        let is_end = fu_header & FU_END_BIT != 0;
        self.nal_unit_type = nal_unit_type(fu_header);

        if is_start {
            // The Start and End bits MUST NOT both be set.
            if is_end {
                tracing::debug!("Dropping FU-A with both Start and End bits set (seq {})", seq);
                self.discard_fragment();
                return Ok(ProcessResult::Dropped);
            }
            if self.fu_started {
                tracing::debug!(
                    "FU-A start at seq {} abandons {} buffered bytes",
                    seq,
                    self.fragment.len()
                );
            }

            self.discard_fragment();
            reserve(
                &mut self.fragment,
                NAL_PREFIX.len() + NAL_HEADER_SIZE + data.len() + self.padding,
            )?;
            self.fragment.extend_from_slice(&NAL_PREFIX);
            self.fragment
                .push((fu_indicator & F_NRI_MASK) | self.nal_unit_type);
            self.fu_started = true;
        } else if !self.fu_started {
            tracing::debug!("Dropping FU-A fragment without a start (seq {})", seq);
            return Ok(ProcessResult::Dropped);
        } else if let Err(e) = reserve(&mut self.fragment, data.len()) {
            self.discard_fragment();
            return Err(e);
        }

        self.fragment.extend_from_slice(data);
        self.fragment_seq = seq;

        if is_end {
            self.fu_started = false;
            let buf = std::mem::take(&mut self.fragment);
            self.finish(buf, seq, true).map(ProcessResult::Produced)
        } else {
            Ok(ProcessResult::NeedsMoreInput)
        }
    }

    fn discard_fragment(&mut self) {
        self.fu_started = false;
        self.fragment.clear();
    }

    /// Append the padding and wrap the buffer.
    fn finish(&self, mut buf: Vec<u8>, seq: u16, complete: bool) -> Result<NalUnit> {
        let len = buf.len();
        reserve(&mut buf, self.padding)?;
        buf.resize(len + self.padding, 0);
        Ok(NalUnit::new(buf, len, seq, complete, false))
    }
}

/// Counters kept by a [`Depacketizer`] since it was last opened.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DepacketizerStats {
    pub packets_received: u64,
    pub nals_complete: u64,
    pub nals_incomplete: u64,
    pub packets_dropped: u64,
    pub sequence_losses: u64,
    /// Output units that carried the RTP marker (last packet of an access unit).
    pub frames_received: u64,
}

/// H.264 depacketizer: reassembly plus the key frame request policy.
///
/// `process` must not be called concurrently for the same instance; the
/// key frame request loop runs on its own tokio task.
pub struct Depacketizer {
    config: DepacketizerConfig,
    engine: ReassemblyEngine,
    scheduler: KeyFrameRequestScheduler,
    stats: DepacketizerStats,
}

impl Depacketizer {
    pub fn new(config: DepacketizerConfig) -> Self {
        let engine = ReassemblyEngine::new(
            config.output_incomplete_nal_units,
            config.output_padding_size,
        );
        let scheduler = KeyFrameRequestScheduler::new(RequestTiming::from_config(&config));
        Self {
            config,
            engine,
            scheduler,
            stats: DepacketizerStats::default(),
        }
    }

    /// Run the key frame request loop on `handle`.
    pub fn with_runtime(mut self, handle: Handle) -> Self {
        self.scheduler = self.scheduler.with_runtime(handle);
        self
    }

    pub fn config(&self) -> &DepacketizerConfig {
        &self.config
    }

    /// Reset all state to its initial values. Any running request loop is
    /// retired.
    pub fn open(&mut self) {
        self.engine.reset_state();
        self.scheduler.reset();
        self.stats = DepacketizerStats::default();
        tracing::info!("H.264 depacketizer opened");
    }

    /// Stop the key frame request loop and reset all state. Safe to call
    /// repeatedly and when the loop never started.
    pub fn close(&mut self) {
        self.scheduler.stop();
        self.engine.reset_state();
        tracing::info!(
            "H.264 depacketizer closed. Packets: {}, NAL units: {} complete/{} incomplete, losses: {}",
            self.stats.packets_received,
            self.stats.nals_complete,
            self.stats.nals_incomplete,
            self.stats.sequence_losses
        );
        self.stats = DepacketizerStats::default();
    }

    /// Feed one RTP payload. On [`ProcessResult::Flushed`] the same payload
    /// must be passed again.
    pub fn process(
        &mut self,
        payload: &[u8],
        sequence_number: u16,
        rtp_marker: bool,
    ) -> Result<ProcessResult> {
        let step = self.engine.process(payload, sequence_number, rtp_marker)?;
        let flushed = matches!(step.result, ProcessResult::Flushed(_));
        let nal_unit_type = self.engine.nal_unit_type();
        let now = Instant::now();

        self.scheduler.update(|state| {
            // No key frame seen yet, or a frame may have been lost.
            let mut request = state.last_key_frame.is_none() || step.loss_detected;
            if !flushed {
                match nal_unit_type {
                    NAL_TYPE_IDR => {
                        state.last_key_frame = Some(now);
                        request = false;
                    }
                    // SPS and PPS are usually followed by an IDR.
                    NAL_TYPE_SPS | NAL_TYPE_PPS => request = false,
                    _ => {}
                }
            }
            state.request_key_frame = request;
        });

        self.record(&step);
        Ok(step.result)
    }

    /// Feed one RTP payload and collect every NAL unit it yields, passing
    /// the payload again after a flush.
    pub fn push(
        &mut self,
        payload: &[u8],
        sequence_number: u16,
        rtp_marker: bool,
    ) -> Result<Vec<NalUnit>> {
        let mut units = Vec::with_capacity(1);
        let mut result = self.process(payload, sequence_number, rtp_marker)?;
        if let ProcessResult::Flushed(nal) = result {
            units.push(nal);
            result = self.process(payload, sequence_number, rtp_marker)?;
        }
        if let ProcessResult::Produced(nal) = result {
            units.push(nal);
        }
        Ok(units)
    }

    /// Ask the remote peer for a key frame. See
    /// [`KeyFrameRequestScheduler::request_key_frame`].
    pub fn request_key_frame(&self, urgent: bool) -> bool {
        self.scheduler.request_key_frame(urgent)
    }

    pub fn set_key_frame_control(&self, control: Option<Arc<dyn KeyFrameControl>>) {
        self.scheduler.set_key_frame_control(control);
    }

    pub fn key_frame_requested(&self) -> bool {
        self.scheduler.key_frame_requested()
    }

    pub fn last_key_frame_time(&self) -> Option<Instant> {
        self.scheduler.last_key_frame()
    }

    pub fn key_frame_requests_sent(&self) -> u64 {
        self.scheduler.requests_sent()
    }

    pub fn is_request_loop_running(&self) -> bool {
        self.scheduler.is_running()
    }

    pub fn fragmentation_state(&self) -> FragmentationState {
        self.engine.fragmentation_state()
    }

    pub fn last_sequence_number(&self) -> Option<u16> {
        self.engine.last_sequence_number()
    }

    pub fn stats(&self) -> DepacketizerStats {
        self.stats
    }

    fn record(&mut self, step: &Step) {
        let stats = &mut self.stats;
        if let ProcessResult::Flushed(_) = step.result {
            // The packet comes back; count it then.
            stats.nals_incomplete += 1;
            return;
        }

        stats.packets_received += 1;
        if step.loss_detected {
            stats.sequence_losses += 1;
        }
        match &step.result {
            ProcessResult::Produced(nal) => {
                stats.nals_complete += 1;
                if nal.rtp_marker() {
                    stats.frames_received += 1;
                }
            }
            ProcessResult::Dropped => stats.packets_dropped += 1,
            ProcessResult::NeedsMoreInput | ProcessResult::Flushed(_) => {}
        }
    }
}

impl Default for Depacketizer {
    fn default() -> Self {
        Self::new(DepacketizerConfig::default())
    }
}
