//! kangaroo-core: policy library for the kangaroo forwarding gateway.
//!
//! Compiles named address sets, builds the ordered policy table and evaluates
//! it for a (source, destination) pair, and validates RFC 4254 `direct-tcpip`
//! forward requests. Everything here is pure: no sockets, no DNS, no clocks.

pub mod addrset;
pub mod error;
pub mod policy;
pub mod request;

// Re-export commonly used items at crate root.
pub use addrset::{AddressSet, AddressSets, ALL_SET};
pub use error::{KangarooError, KangarooResult};
pub use policy::{evaluate, DefaultAction, Decision, PolicySpec, PolicyTable};
pub use request::{parse_peer_ip, DirectTcpip, ForwardRequest};
