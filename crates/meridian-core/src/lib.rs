//! # Meridian Core Library
//!
//! Host-side driver for Meridian multi-drop serial motor-control networks.
//!
//! This library provides:
//! - Wire packet framing with 7-bit channel transcoding and checksums
//! - Synchronous, thread-safe command/response dispatch with pacing
//! - A per-link read engine matching responses to blocked callers
//! - Automatic link recovery after cable faults and node resets
//! - Packet trace rings and binary dump files for diagnostics
//!
//! ## Example
//!
//! ```rust,ignore
//! use meridian_core::prelude::*;
//!
//! let registry = LinkRegistry::new();
//! let link = registry.open(LinkConfig {
//!     port_name: "/dev/ttyUSB0".into(),
//!     ..LinkConfig::default()
//! })?;
//!
//! // Read parameter 0 (device ID) of node 3
//! let cmd = Packet::command(3, vec![0])?;
//! let resp = link.run_command_default(&cmd)?;
//! println!("device id bytes: {:?}", resp.payload);
//! ```

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod link;
pub mod trace;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::link::{
        Attention, DataAcqSample, Inventory, LinkConfig, LinkError, LinkEvent, LinkHandle,
        LinkRegistry, LinkSessionState, NetRate, Packet, PacketSource, PacketType,
    };
    pub use crate::trace::TraceLog;
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
