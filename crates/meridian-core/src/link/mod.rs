//! Meridian link access
//!
//! The transport/session layer for a multi-drop, half-duplex serial network
//! of motor-control nodes: wire framing, command/response correlation,
//! pacing, disconnect detection and recovery.

use std::time::Duration;

pub mod codec;
pub mod error;
pub mod event;
pub mod net;
pub mod packet;
pub mod registry;
pub mod serial;
pub mod transport;

mod read;
mod recovery;
mod tracker;

#[cfg(test)]
pub(crate) mod mock;

pub use codec::{ParsedItem, StreamParser};
pub use error::{LinkError, NodeErrorClass, NodeNetCode};
pub use event::{EventHub, LinkEvent};
pub use net::{
    Attention, DataAcqSample, Inventory, LinkConfig, LinkHandle, LinkSessionState, NetRate,
};
pub use packet::{Packet, PacketSource, PacketType, MAX_NODES, PAYLOAD_MAX};
pub use registry::{LinkRegistry, LINKS_MAX};
pub use serial::{list_ports, PortInfo};
pub use tracker::{CompletionStats, DEFAULT_CMDS_IN_FLIGHT, RING_CMDS_LIMIT};
pub use transport::LinkTransport;

/// Max time for a frame to transmit
pub const FRAME_WRITE_TIMEOUT: Duration = Duration::from_millis(1000);

/// Max time to wait for one frame to arrive
pub const FRAME_READ_TIMEOUT: Duration = Duration::from_millis(1000);

/// Default `run_command` timeout: one frame time plus scheduling headroom
pub const RESPONSE_TIMEOUT: Duration = Duration::from_millis(1125);

/// Interval between recovery probe cycles
pub const RECOVERY_WAIT: Duration = Duration::from_millis(500);

/// Length of the break condition that resets the ring
pub const BREAK_DURATION: Duration = Duration::from_millis(40);
