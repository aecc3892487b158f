//! Gateway module: authorizes `direct-tcpip` forward requests and splices
//! accepted channels to the dialed destination.
//!
//! # Submodule Architecture
//!
//! - **[`forwarder`]**: the [`GatewayForwarder`] runs one request through
//!   resolution, policy evaluation, the optional adjacency proof and the dial,
//!   then hands the pair of streams to the splice.
//!
//! - **[`resolver`]**: the [`DnsResolver`](resolver::DnsResolver) turns the
//!   requested host into the single address the policy is evaluated against.
//!
//! - **[`prober`]**: [`AdjacencyProber`](prober::AdjacencyProber) strategies
//!   that decide whether a destination sits on the local link.
//!
//! - **[`splice`]**: full-duplex copy between tunnel channel and socket.
//!
//! # Data Flow
//!
//! ```text
//! channel_open_direct_tcpip (server.rs, inside the session loop)
//!   → GatewayForwarder::admit
//!       → ForwardRequest::from_direct_tcpip
//!       → PolicyTable::evaluate (IP-literal destinations only)
//! spawned task
//!   → GatewayForwarder::open
//!       → DnsResolver::resolve_first
//!       → PolicyTable::evaluate
//!       → AdjacencyProber::is_link_local (samel2 policies only)
//!       → TcpStream::connect (requested host string)
//!       → accept channel → spawn_splice
//! ```

pub mod forwarder;
pub mod prober;
pub mod resolver;
pub mod splice;

pub use forwarder::GatewayForwarder;
pub use prober::ProbeStrategy;
