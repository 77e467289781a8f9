#![doc = include_str!("../README.md")]

pub mod bvlc;
pub mod error;
pub mod hub_connector;
pub mod hub_function;
pub mod node;
pub mod node_switch;
pub mod runloop;
pub mod socket;
pub mod util;

#[cfg(test)]
mod testing;

// Re-export the main types without glob imports to avoid conflicts
pub use error::{Result, ScError};
pub use hub_connector::{HubConnector, HubConnectorConfig, HubConnectorEvent, HubConnectorStatus};
pub use node::{AddressResolution, Node, NodeConfig, NodeEvent, NodePool, NodeState};
pub use runloop::Runloop;
pub use socket::{SocketEventSink, SocketTransport, SocketTransportFactory};
pub use util::{ScUuid, Vmac, UUID_SIZE, VMAC_SIZE};

/// Longest accepted `wss://` endpoint URL, in bytes.
pub const WSURL_MAX_LEN: usize = 256;

/// Most URLs kept from one address-resolution answer.
pub const RESOLUTION_URLS_MAX: usize = 4;

/// Direct connections (and cached address resolutions) per node.
pub const DIRECT_CONNECTIONS_MAX: usize = 8;

/// Peers a published hub function accepts.
pub const HUB_CONNECTIONS_MAX: usize = 16;

/// Size of the node pool.
pub const NODES_MAX: usize = 4;

/// Floor of the buffer locally synthesized control responses must fit.
pub const NPDU_BUF_SIZE: usize = 1497;
