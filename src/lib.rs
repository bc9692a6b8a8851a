//! overnet: an overlay IP router.
//!
//! A router process participates with configured neighbors to exchange
//! reachability information using a path-vector routing protocol,
//! maintains a longest-prefix-match forwarding table, and forwards
//! datagrams across an emulated link layer carried over UDP.

pub mod addr;
pub mod config;
pub mod forwarder;
pub mod packet;
pub mod protocol;
pub mod router;
pub mod substrate;
pub mod traffic;

// Re-export address types
pub use addr::{AddrError, OverlayAddr, Prefix};

// Re-export config types
pub use config::{Config, ConfigError, NeighborInfo};

// Re-export packet types
pub use packet::{Packet, Protocol, WireError, DEFAULT_TTL, MAX_PACKET_LEN};

// Re-export protocol types
pub use protocol::{ControlMsg, ProtocolError};

// Re-export component types
pub use forwarder::{AppHandle, Forwarder, ForwarderError, ForwardingTable, RouterHandle};
pub use router::Router;
pub use substrate::{Substrate, SubstrateError, SubstrateHandle, OVERLAY_PORT};
pub use traffic::Traffic;

/// Capacity of every inter-component queue.
pub(crate) const QUEUE_CAPACITY: usize = 1000;
