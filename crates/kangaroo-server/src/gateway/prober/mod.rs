//! Link-layer adjacency probing.
//!
//! Answers one question: is this destination on our broadcast domain (one
//! hop, no router in between)? Two strategies share the [`AdjacencyProber`]
//! contract:
//!
//! - **[`neighbor`]**: send one ICMP echo to provoke a neighbor-cache entry,
//!   then read the kernel neighbor table; adjacent iff the entry is
//!   `REACHABLE` or `DELAY`.
//! - **[`ttl`]**: send a UDP datagram with TTL / hop limit 1 and check that
//!   the ICMP answer comes from the destination itself.
//!
//! Every failure (missing privilege, socket error, timeout) yields `false`.
//! Probing never returns an error to the caller and never aborts the process.

pub mod icmp;
pub mod neighbor;
pub mod ttl;

use async_trait::async_trait;
use serde::Deserialize;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;

pub use neighbor::NeighborCacheProber;
pub use ttl::TtlProber;

/// Decides whether a destination is directly reachable on the local link.
#[async_trait]
pub trait AdjacencyProber: Send + Sync {
    /// Bounded by the strategy's timeout; `false` when undetermined.
    async fn is_link_local(&self, dst: IpAddr) -> bool;

    /// Short strategy name for logs.
    fn name(&self) -> &'static str;
}

/// Probe strategy selected by configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeStrategy {
    #[default]
    Neighbor,
    Ttl,
}

impl FromStr for ProbeStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "neighbor" | "neigh" | "arp" => Ok(Self::Neighbor),
            "ttl" | "ttl1" => Ok(Self::Ttl),
            other => Err(format!("unknown prober {other:?} (expected \"neighbor\" or \"ttl\")")),
        }
    }
}

impl fmt::Display for ProbeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Neighbor => "neighbor",
            Self::Ttl => "ttl",
        })
    }
}

/// Build the production prober for `strategy`.
pub fn build(strategy: ProbeStrategy) -> Arc<dyn AdjacencyProber> {
    match strategy {
        ProbeStrategy::Neighbor => Arc::new(NeighborCacheProber::system()),
        ProbeStrategy::Ttl => Arc::new(TtlProber::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_parse() {
        assert_eq!("neighbor".parse::<ProbeStrategy>().unwrap(), ProbeStrategy::Neighbor);
        assert_eq!("TTL".parse::<ProbeStrategy>().unwrap(), ProbeStrategy::Ttl);
        assert!("traceroute".parse::<ProbeStrategy>().is_err());
    }

    #[test]
    fn test_strategy_deserialize() {
        let s: ProbeStrategy = serde_json::from_str("\"ttl\"").unwrap();
        assert_eq!(s, ProbeStrategy::Ttl);
        assert_eq!(ProbeStrategy::default(), ProbeStrategy::Neighbor);
    }

    #[test]
    fn test_build_names() {
        assert_eq!(build(ProbeStrategy::Neighbor).name(), "neighbor");
        assert_eq!(build(ProbeStrategy::Ttl).name(), "ttl");
    }
}
