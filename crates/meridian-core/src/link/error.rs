//! Link errors

use thiserror::Error;

/// Error classes a node can report in an error packet.
///
/// The first payload byte of an error packet carries the 5-bit error code in
/// its low bits and the 2-bit error class above it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeErrorClass {
    /// Network-level fault detected by the node (wiring/corruption)
    Net,
    /// Command rejected by the node's command processor
    Cmd,
    /// Extended error class (device specific)
    Extended,
}

impl NodeErrorClass {
    /// Decode the class bits from the first error-packet payload byte
    pub fn from_bits(bits: u8) -> Self {
        match (bits >> 5) & 0x3 {
            0 => NodeErrorClass::Net,
            1 => NodeErrorClass::Cmd,
            _ => NodeErrorClass::Extended,
        }
    }
}

/// Network error codes reported by nodes (error class `Net`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeNetCode {
    /// Packet fragment detected
    Fragment,
    /// Bad checksum detected
    Checksum,
    /// Stray data found between packets
    Stray,
    /// Receive overrun at the node's port
    Overrun,
    /// Framing error at the node's port
    Frame,
    /// Parity error at the node's port
    Parity,
    /// Babble detected on the net
    Babble,
    /// Unknown/future code
    Other(u8),
}

impl NodeNetCode {
    /// Decode from the 5-bit error code field
    pub fn from_code(code: u8) -> Self {
        match code & 0x1F {
            0 => NodeNetCode::Fragment,
            1 => NodeNetCode::Checksum,
            2 => NodeNetCode::Stray,
            3 => NodeNetCode::Overrun,
            4 => NodeNetCode::Frame,
            5 => NodeNetCode::Parity,
            6 => NodeNetCode::Babble,
            n => NodeNetCode::Other(n),
        }
    }
}

/// Errors that can occur while using a Meridian link
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LinkError {
    #[error("Serial port error: {0}")]
    Serial(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Link is closed")]
    Closed,

    #[error("Link is in flashing mode")]
    Flashing,

    #[error("Command issued from the read thread would deadlock")]
    FromReadThread,

    #[error("Command canceled while link diagnostics were running")]
    Canceled,

    #[error("Link is offline")]
    Offline,

    #[error("Command failed to transmit")]
    SendFailed,

    #[error("Response timeout")]
    ResponseTimeout,

    #[error("Payload too long: {len} bytes")]
    PayloadTooLong {
        /// Requested payload length
        len: usize,
    },

    #[error("Node address {addr} out of range")]
    BadNodeAddr {
        /// Offending address
        addr: u8,
    },

    #[error("Frame too short to be a packet")]
    ShortFrame,

    #[error("Malformed response")]
    RespFormat,

    #[error("Checksum error on frame claiming node {node}")]
    ChecksumError {
        /// Address field of the corrupted frame
        node: u8,
    },

    #[error("Fragmented packet detected")]
    Fragmented,

    #[error("{count} stray bytes on the link")]
    StrayBytes {
        /// Number of stray bytes discarded (saturates at 127)
        count: u8,
    },

    #[error("Receive overrun")]
    Overrun,

    #[error("Framing error on the link")]
    FramingError,

    #[error("Unsolicited response from node {node}")]
    Unsolicited {
        /// Responding address with no pending command
        node: u8,
    },

    #[error("Response from out-of-range address {node}")]
    AddrRange {
        /// Responding address beyond the known node count
        node: u8,
    },

    #[error("Response with unexpected source from node {node}")]
    WrongSource {
        /// Claimed address
        node: u8,
    },

    #[error("Command echoed back unexecuted by node {node} (node reset?)")]
    CommandEchoed {
        /// Address of the node that forwarded our command untouched
        node: u8,
    },

    #[error("Node {node} reported network error {code:?}")]
    NodeNetError {
        /// Reporting node
        node: u8,
        /// Reported network error code
        code: NodeNetCode,
    },

    #[error("Node {node} rejected command (code {code})")]
    NodeCmdError {
        /// Rejecting node
        node: u8,
        /// Node command error code
        code: u8,
    },

    #[error("Response tracking pool exhausted")]
    TrackerExhausted,

    #[error("Command pacing accounting underflow")]
    PaceUnderflow,

    #[error("More nodes than the link can address")]
    TooManyNodes,

    #[error("No nodes found on the link")]
    NoNodesFound,

    #[error("Link topology changed across recovery")]
    TopologyChanged,
}

impl LinkError {
    /// True for errors that indicate a probable physical/connectivity fault.
    ///
    /// These are the errors that arm the recovery engine; semantic command
    /// rejections and caller mistakes are excluded.
    pub fn is_link_class(&self) -> bool {
        matches!(
            self,
            LinkError::Serial(_)
                | LinkError::Io(_)
                | LinkError::SendFailed
                | LinkError::ResponseTimeout
                | LinkError::ChecksumError { .. }
                | LinkError::Fragmented
                | LinkError::StrayBytes { .. }
                | LinkError::Overrun
                | LinkError::FramingError
                | LinkError::Unsolicited { .. }
                | LinkError::AddrRange { .. }
                | LinkError::WrongSource { .. }
                | LinkError::CommandEchoed { .. }
                | LinkError::NodeNetError { .. }
                | LinkError::Offline
                | LinkError::RespFormat
        )
    }

    /// True when a node rejected the command semantically (not a link problem)
    pub fn is_command_class(&self) -> bool {
        matches!(self, LinkError::NodeCmdError { .. })
    }

    /// Compact numeric code used in trace records and dump files.
    ///
    /// Codes are grouped: 0 = none, 0x100.. link class, 0x200.. command
    /// class, 0x300.. resource class, 0x400.. usage class.
    pub fn trace_code(&self) -> u16 {
        match self {
            LinkError::Serial(_) => 0x101,
            LinkError::Io(_) => 0x102,
            LinkError::SendFailed => 0x103,
            LinkError::ResponseTimeout => 0x104,
            LinkError::ChecksumError { .. } => 0x105,
            LinkError::Fragmented => 0x106,
            LinkError::StrayBytes { .. } => 0x107,
            LinkError::Overrun => 0x108,
            LinkError::FramingError => 0x109,
            LinkError::Unsolicited { .. } => 0x10A,
            LinkError::AddrRange { .. } => 0x10B,
            LinkError::WrongSource { .. } => 0x10C,
            LinkError::CommandEchoed { .. } => 0x10D,
            LinkError::NodeNetError { .. } => 0x10E,
            LinkError::Offline => 0x10F,
            LinkError::RespFormat => 0x110,
            LinkError::NodeCmdError { code, .. } => 0x200 | u16::from(*code),
            LinkError::TrackerExhausted => 0x301,
            LinkError::PaceUnderflow => 0x302,
            LinkError::Closed => 0x401,
            LinkError::Flashing => 0x402,
            LinkError::FromReadThread => 0x403,
            LinkError::Canceled => 0x404,
            LinkError::PayloadTooLong { .. } => 0x405,
            LinkError::BadNodeAddr { .. } => 0x406,
            LinkError::ShortFrame => 0x407,
            LinkError::TooManyNodes => 0x408,
            LinkError::NoNodesFound => 0x409,
            LinkError::TopologyChanged => 0x40A,
        }
    }
}

impl From<std::io::Error> for LinkError {
    fn from(err: std::io::Error) -> Self {
        LinkError::Io(err.to_string())
    }
}

impl From<serialport::Error> for LinkError {
    fn from(err: serialport::Error) -> Self {
        LinkError::Serial(err.to_string())
    }
}
