//! Packet encoding/decoding
//!
//! Implements the Meridian wire packet format. A packet on the wire is:
//!
//! - Byte 0: `StartOfPacket(1) | PktType(3) | Addr(4)` (MSB first)
//! - Byte 1: `Zero(1) | Src(1) | Mode(1) | WireLen(5)`
//! - Bytes 2..: payload, regrouped to 7-bit characters (the physical channel
//!   reserves bit 7 for the start-of-packet marker)
//! - Final byte: checksum = `(-sum(all prior bytes)) & 0x7F`
//!
//! The payload carried in [`Packet`] is in the 8-bit domain; the 8↔7 bit
//! regrouping happens inside [`Packet::encode`] and [`Packet::decode`].

use super::error::LinkError;

/// Max number of addressable nodes on one link
pub const MAX_NODES: usize = 16;

/// Packet header length in bytes
pub const PACKET_HDR_LEN: usize = 2;

/// Trailing checksum length in bytes
pub const PACKET_TAIL_LEN: usize = 1;

/// Mask for the 5-bit on-wire payload length field
pub const WIRE_LEN_MASK: u8 = 0x1F;

/// Max 8-bit payload bytes that survive the 8→7 regrouping
pub const PAYLOAD_MAX: usize = (WIRE_LEN_MASK as usize * 7) / 8;

/// Largest possible frame on the wire (header + payload + checksum)
pub const WIRE_FRAME_MAX: usize = PACKET_HDR_LEN + WIRE_LEN_MASK as usize + PACKET_TAIL_LEN;

/// Originator of a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketSource {
    /// Packet originated at the host
    Host,
    /// Packet originated at a node (attention, error report, data acq)
    Node,
}

/// Packet type field
///
/// Types with bit 2 set are high-priority control frames: they bypass node
/// flow control and may preempt a low-priority frame mid-stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    /// Command to a node
    Command = 0,
    /// Command response
    Response = 1,
    /// Error report
    Error = 2,
    /// Extension frame, low priority (data acquisition etc.)
    ExtendLow = 3,
    /// Attention request (node initiated interrupt)
    AttnIrq = 4,
    /// Address assignment frame
    SetAddr = 5,
    /// Event trigger ("go")
    Trigger = 6,
    /// Extension frame, high priority (reset, baud change, diagnostics)
    ExtendHigh = 7,
}

impl PacketType {
    /// Decode the 3-bit type field
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x7 {
            0 => PacketType::Command,
            1 => PacketType::Response,
            2 => PacketType::Error,
            3 => PacketType::ExtendLow,
            4 => PacketType::AttnIrq,
            5 => PacketType::SetAddr,
            6 => PacketType::Trigger,
            _ => PacketType::ExtendHigh,
        }
    }

    /// High-priority frames may interrupt a low-priority frame on the wire
    pub fn is_high_priority(self) -> bool {
        (self as u8) & 0x4 != 0
    }
}

/// Sub-command codes carried in the first payload byte of `ExtendHigh` frames
pub mod ext_high {
    /// Do nothing (used for link flushing)
    pub const NOP: u8 = 0;
    /// Reset node
    pub const RESET: u8 = 1;
    /// Network diagnostic result
    pub const NET_DIAG_INFO: u8 = 4;
    /// Cross-net integrity check
    pub const NET_CHECK: u8 = 5;
    /// Change network baud rate
    pub const BAUD_RATE: u8 = 9;
}

/// Sub-command codes carried in the first payload byte of `ExtendLow` frames
pub mod ext_low {
    /// Do nothing
    pub const NOP: u8 = 0;
    /// Data acquisition sample
    pub const DATA_ACQ: u8 = 1;
}

/// A decoded Meridian packet (8-bit payload domain)
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    /// Originator
    pub src: PacketSource,
    /// Packet type
    pub pkt_type: PacketType,
    /// Node address (0..15)
    pub addr: u8,
    /// Type-specific modifier bit
    pub mode: bool,
    /// Payload in the 8-bit domain
    pub payload: Vec<u8>,
}

impl Packet {
    /// Create a host-originated packet, validating address and payload size
    pub fn new(
        pkt_type: PacketType,
        addr: u8,
        payload: Vec<u8>,
    ) -> Result<Self, LinkError> {
        if addr as usize >= MAX_NODES {
            return Err(LinkError::BadNodeAddr { addr });
        }
        if payload.len() > PAYLOAD_MAX {
            return Err(LinkError::PayloadTooLong { len: payload.len() });
        }
        Ok(Self {
            src: PacketSource::Host,
            pkt_type,
            addr,
            mode: false,
            payload,
        })
    }

    /// Create a command packet addressed to `addr`
    pub fn command(addr: u8, payload: Vec<u8>) -> Result<Self, LinkError> {
        Self::new(PacketType::Command, addr, payload)
    }

    /// Create the address-assignment control frame used for enumeration.
    /// The `addr` field carries the starting address (0 for normal use).
    pub fn set_address(start: u8) -> Result<Self, LinkError> {
        Self::new(PacketType::SetAddr, start, Vec::new())
    }

    /// Create a high-priority extension frame
    pub fn extend_high(addr: u8, code: u8, args: &[u8]) -> Result<Self, LinkError> {
        let mut payload = Vec::with_capacity(1 + args.len());
        payload.push(code);
        payload.extend_from_slice(args);
        Self::new(PacketType::ExtendHigh, addr, payload)
    }

    /// High-priority frames queue in the control class, not per node
    pub fn is_high_priority(&self) -> bool {
        self.pkt_type.is_high_priority()
    }

    /// Encode to a complete wire frame (7-bit payload + checksum appended)
    pub fn encode(&self) -> Vec<u8> {
        let wire_payload = pack_7bit(&self.payload);
        debug_assert!(wire_payload.len() <= WIRE_LEN_MASK as usize);

        let mut frame = Vec::with_capacity(PACKET_HDR_LEN + wire_payload.len() + PACKET_TAIL_LEN);
        frame.push(
            0x80 | ((self.pkt_type as u8) << 4) | (self.addr & 0x0F),
        );
        frame.push(
            (u8::from(self.src == PacketSource::Node) << 6)
                | (u8::from(self.mode) << 5)
                | (wire_payload.len() as u8 & WIRE_LEN_MASK),
        );
        frame.extend_from_slice(&wire_payload);
        frame.push(checksum(&frame));
        frame
    }

    /// Decode a complete wire frame (including trailing checksum)
    pub fn decode(frame: &[u8]) -> Result<Self, LinkError> {
        if frame.len() < PACKET_HDR_LEN + PACKET_TAIL_LEN {
            return Err(LinkError::ShortFrame);
        }
        let addr = frame[0] & 0x0F;
        if frame.iter().fold(0u32, |s, &b| s + u32::from(b)) & 0x7F != 0 {
            return Err(LinkError::ChecksumError { node: addr });
        }
        let wire_len = (frame[1] & WIRE_LEN_MASK) as usize;
        if frame.len() != PACKET_HDR_LEN + wire_len + PACKET_TAIL_LEN {
            return Err(LinkError::ShortFrame);
        }
        Ok(Self {
            src: if frame[1] & 0x40 != 0 {
                PacketSource::Node
            } else {
                PacketSource::Host
            },
            pkt_type: PacketType::from_bits(frame[0] >> 4),
            addr,
            mode: frame[1] & 0x20 != 0,
            payload: unpack_7bit(&frame[PACKET_HDR_LEN..PACKET_HDR_LEN + wire_len]),
        })
    }
}

/// Checksum over the wire bytes written so far: two's complement of the sum,
/// masked to the 7-bit channel domain.
pub fn checksum(bytes: &[u8]) -> u8 {
    let sum = bytes.iter().fold(0u32, |s, &b| s.wrapping_add(u32::from(b)));
    (sum.wrapping_neg() & 0x7F) as u8
}

/// Regroup an 8-bit payload into 7-bit wire characters.
///
/// Each group of up to 7 input bytes becomes `n + 1` output bytes holding the
/// same bits LSB first, every output byte limited to 7 bits so the channel's
/// start-of-packet marker (bit 7) stays unambiguous. Empty payloads pass
/// through untouched.
pub fn pack_7bit(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + payload.len() / 7 + 1);
    for group in payload.chunks(7) {
        let mut acc: u64 = 0;
        for (i, &b) in group.iter().enumerate() {
            acc |= u64::from(b) << (8 * i);
        }
        // n input bytes always need n+1 seven-bit characters
        for i in 0..=group.len() {
            out.push(((acc >> (7 * i)) & 0x7F) as u8);
        }
    }
    out
}

/// Inverse of [`pack_7bit`]: rebuild the 8-bit payload from wire characters.
///
/// A single wire character is a degenerate pass-through (no regrouping was
/// possible for it on the sending side).
pub fn unpack_7bit(wire: &[u8]) -> Vec<u8> {
    if wire.len() <= 1 {
        return wire.to_vec();
    }
    let mut out = Vec::with_capacity(wire.len() * 7 / 8);
    let mut acc: u32 = 0;
    let mut nbits = 0;
    for &b in wire {
        acc |= u32::from(b & 0x7F) << nbits;
        nbits += 7;
        if nbits >= 8 {
            out.push((acc & 0xFF) as u8);
            acc >>= 8;
            nbits -= 8;
        }
    }
    out
}
