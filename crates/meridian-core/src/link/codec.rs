//! Byte-stream deframer
//!
//! Pulls Meridian frames out of the raw receive stream. The physical channel
//! only guarantees that bit 7 marks a start-of-packet byte, so the parser is
//! a small state machine that tolerates three kinds of line noise:
//!
//! - stray bytes between packets (counted, reported once per burst),
//! - fragmented packets (a new start marker arriving before the previous
//!   frame finished),
//! - high-priority frames legitimately preempting a low-priority frame
//!   mid-stream (nesting depth 1; the preempted frame resumes afterwards).

use super::error::LinkError;
use super::packet::{Packet, PacketType, PACKET_HDR_LEN, PACKET_TAIL_LEN, WIRE_FRAME_MAX, WIRE_LEN_MASK};

/// Highest stray count reported in one event; fits the 7-bit error payload
const STRAY_COUNT_MAX: u8 = 127;

/// One item recovered from the byte stream
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedItem {
    /// A complete, checksum-valid packet
    Packet(Packet),
    /// A line fault observed while deframing
    Fault(LinkError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    Idle,
    LowPayload,
    HighPayload,
}

/// Frame accumulator for one priority level
#[derive(Debug)]
struct FrameAccum {
    buf: [u8; WIRE_FRAME_MAX],
    len: usize,
}

impl FrameAccum {
    fn new() -> Self {
        Self {
            buf: [0; WIRE_FRAME_MAX],
            len: 0,
        }
    }

    fn start(&mut self, byte: u8) {
        self.buf[0] = byte;
        self.len = 1;
    }

    fn push(&mut self, byte: u8) {
        self.buf[self.len] = byte;
        self.len += 1;
    }

    /// Total frame length, known once the length byte has arrived.
    /// Until then assume the maximum so we keep accumulating.
    fn expected(&self) -> usize {
        if self.len < PACKET_HDR_LEN {
            WIRE_FRAME_MAX
        } else {
            PACKET_HDR_LEN + (self.buf[1] & WIRE_LEN_MASK) as usize + PACKET_TAIL_LEN
        }
    }

    fn complete(&self) -> bool {
        self.len >= self.expected()
    }

    fn frame(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

/// Streaming packet parser
pub struct StreamParser {
    state: ParseState,
    pushed_state: ParseState,
    low: FrameAccum,
    high: FrameAccum,
    stray_count: u8,
}

impl Default for StreamParser {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamParser {
    /// Create an idle parser
    pub fn new() -> Self {
        Self {
            state: ParseState::Idle,
            pushed_state: ParseState::Idle,
            low: FrameAccum::new(),
            high: FrameAccum::new(),
            stray_count: 0,
        }
    }

    /// Abandon any partial frames and return to idle (link flush)
    pub fn reset(&mut self) {
        self.state = ParseState::Idle;
        self.pushed_state = ParseState::Idle;
        self.low.len = 0;
        self.high.len = 0;
        self.stray_count = 0;
    }

    /// Feed received bytes, appending recovered items to `out`
    pub fn feed(&mut self, bytes: &[u8], out: &mut Vec<ParsedItem>) {
        for &b in bytes {
            self.push_byte(b, out);
        }
    }

    fn push_byte(&mut self, byte: u8, out: &mut Vec<ParsedItem>) {
        // A start byte may need reprocessing after a fragmentation reset
        let mut byte = byte;
        loop {
            match self.step(byte, out) {
                Some(reprocess) => byte = reprocess,
                None => return,
            }
        }
    }

    /// Process one byte. Returns `Some(byte)` when the byte aborted an
    /// in-progress frame and must be reparsed as a fresh start marker.
    fn step(&mut self, byte: u8, out: &mut Vec<ParsedItem>) -> Option<u8> {
        let is_start = byte & 0x80 != 0;
        match self.state {
            ParseState::Idle => {
                if !is_start {
                    // Stray octet between packets
                    if self.stray_count < STRAY_COUNT_MAX {
                        self.stray_count += 1;
                    }
                    return None;
                }
                if self.stray_count > 0 {
                    out.push(ParsedItem::Fault(LinkError::StrayBytes {
                        count: self.stray_count,
                    }));
                    self.stray_count = 0;
                }
                if Self::starts_high(byte) {
                    self.high.start(byte);
                    self.pushed_state = ParseState::Idle;
                    self.state = ParseState::HighPayload;
                } else {
                    self.low.start(byte);
                    self.state = ParseState::LowPayload;
                }
                None
            }
            ParseState::LowPayload => {
                if is_start {
                    if Self::starts_high(byte) {
                        // Legitimate preemption by a control frame
                        self.high.start(byte);
                        self.pushed_state = ParseState::LowPayload;
                        self.state = ParseState::HighPayload;
                        return None;
                    }
                    // A low-priority start inside a low-priority frame is a
                    // fragment; reparse the marker as a fresh start.
                    out.push(ParsedItem::Fault(LinkError::Fragmented));
                    self.reset_frames();
                    return Some(byte);
                }
                self.low.push(byte);
                if self.low.complete() {
                    self.finish(false, out);
                    self.state = ParseState::Idle;
                }
                None
            }
            ParseState::HighPayload => {
                if is_start {
                    // Any restart inside a high-priority frame is a fragment
                    out.push(ParsedItem::Fault(LinkError::Fragmented));
                    self.reset_frames();
                    return Some(byte);
                }
                self.high.push(byte);
                if self.high.complete() {
                    self.finish(true, out);
                    // Resume whatever the control frame interrupted
                    self.state = self.pushed_state;
                    self.pushed_state = ParseState::Idle;
                    self.high.len = 0;
                }
                None
            }
        }
    }

    fn starts_high(byte: u8) -> bool {
        PacketType::from_bits(byte >> 4).is_high_priority()
    }

    fn reset_frames(&mut self) {
        self.state = ParseState::Idle;
        self.pushed_state = ParseState::Idle;
        self.low.len = 0;
        self.high.len = 0;
    }

    fn finish(&mut self, high: bool, out: &mut Vec<ParsedItem>) {
        let accum = if high { &self.high } else { &self.low };
        match Packet::decode(accum.frame()) {
            Ok(pkt) => out.push(ParsedItem::Packet(pkt)),
            Err(err) => out.push(ParsedItem::Fault(err)),
        }
    }
}
