//! TTL-limited strategy: one UDP datagram with TTL / hop limit 1.
//!
//! A destination on the local link receives the datagram and answers (port
//! unreachable) from its own address. Anything further away makes the first
//! router drop the datagram and answer with time-exceeded from the router's
//! address. Needs a raw ICMP socket, so without `CAP_NET_RAW` the probe
//! cannot run and the answer is "not adjacent".

use super::icmp::{is_timeout, recv_from};
use super::AdjacencyProber;
use async_trait::async_trait;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Traceroute's base port; nothing is expected to listen there.
pub const PROBE_PORT: u16 = 33434;

const ICMP_DEST_UNREACHABLE: u8 = 3;
const ICMP_TIME_EXCEEDED: u8 = 11;
const ICMPV6_DEST_UNREACHABLE: u8 = 1;
const ICMPV6_TIME_EXCEEDED: u8 = 3;

/// Sends the hop-limited probe datagram.
pub trait ProbeTransport: Send + Sync {
    /// Send one datagram with TTL / hop limit 1 to `dst:PROBE_PORT` and return
    /// the receiver for the ICMP answers. The receiver is open before the
    /// datagram leaves.
    fn send_probe(&self, dst: IpAddr) -> io::Result<Box<dyn ProbeReplies>>;
}

/// ICMP packets received after a probe.
pub trait ProbeReplies {
    /// Next packet and its sender. Fails with a timeout error kind when
    /// nothing arrives within `timeout`.
    fn next(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<(usize, Option<IpAddr>)>;
}

/// Raw ICMP receive socket plus a throwaway UDP send socket.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawSocketTransport;

impl ProbeTransport for RawSocketTransport {
    fn send_probe(&self, dst: IpAddr) -> io::Result<Box<dyn ProbeReplies>> {
        let (domain, icmp) = match dst {
            IpAddr::V4(_) => (Domain::IPV4, Protocol::ICMPV4),
            IpAddr::V6(_) => (Domain::IPV6, Protocol::ICMPV6),
        };
        let recv = Socket::new(domain, Type::RAW, Some(icmp))?;
        let send = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        match dst {
            IpAddr::V4(_) => send.set_ttl(1)?,
            IpAddr::V6(_) => send.set_unicast_hops_v6(1)?,
        }
        send.send_to(&[0u8], &SockAddr::from(SocketAddr::new(dst, PROBE_PORT)))?;
        Ok(Box::new(RawReplies(recv)))
    }
}

struct RawReplies(Socket);

impl ProbeReplies for RawReplies {
    fn next(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<(usize, Option<IpAddr>)> {
        self.0.set_read_timeout(Some(timeout))?;
        recv_from(&self.0, buf)
    }
}

/// TTL-limited adjacency prober.
#[derive(Clone)]
pub struct TtlProber {
    timeout: Duration,
    transport: Arc<dyn ProbeTransport>,
}

impl Default for TtlProber {
    fn default() -> Self {
        Self::new(Duration::from_secs(2), Arc::new(RawSocketTransport))
    }
}

impl TtlProber {
    pub fn new(timeout: Duration, transport: Arc<dyn ProbeTransport>) -> Self {
        Self { timeout, transport }
    }

    /// Blocking probe. The sockets are dropped on every return path.
    fn probe(transport: &dyn ProbeTransport, dst: IpAddr, timeout: Duration) -> io::Result<bool> {
        let deadline = Instant::now() + timeout;
        let mut replies = transport.send_probe(dst)?;
        // Max reasonable MTU.
        let mut buf = vec![0u8; 9000];
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(false);
            }
            let (n, from) = match replies.next(&mut buf, remaining) {
                Ok((n, Some(from))) => (n, from),
                Ok(_) => continue,
                Err(e) if is_timeout(&e) => return Ok(false),
                Err(e) => return Err(e),
            };
            match classify(dst, from, &buf[..n]) {
                Some(adjacent) => {
                    debug!(dst = %dst, from = %from, adjacent, "TTL probe answered");
                    return Ok(adjacent);
                }
                None => trace!(from = %from, len = n, "ignoring unrelated ICMP"),
            }
        }
    }
}

#[async_trait]
impl AdjacencyProber for TtlProber {
    async fn is_link_local(&self, dst: IpAddr) -> bool {
        let timeout = self.timeout;
        let transport = self.transport.clone();
        match tokio::task::spawn_blocking(move || Self::probe(transport.as_ref(), dst, timeout)).await {
            Ok(Ok(adjacent)) => adjacent,
            Ok(Err(e)) => {
                warn!(dst = %dst, error = %e, "TTL probe failed, treating as not adjacent");
                false
            }
            Err(e) => {
                warn!(dst = %dst, error = %e, "TTL probe task failed");
                false
            }
        }
    }

    fn name(&self) -> &'static str {
        "ttl"
    }
}

/// Classify one received ICMP packet.
///
/// `Some(true)`: sent by the destination itself. `Some(false)`: an error
/// message from another address that quotes our probe (a router answered).
/// `None`: unrelated traffic.
///
/// IPv4 raw sockets deliver the IP header; ICMPv6 raw sockets do not.
pub(super) fn classify(dst: IpAddr, from: IpAddr, packet: &[u8]) -> Option<bool> {
    if from == dst {
        return Some(true);
    }
    let quoted = match dst {
        IpAddr::V4(_) => quoted_v4(packet).map(|(q, port)| (IpAddr::V4(q), port)),
        IpAddr::V6(_) => quoted_v6(packet).map(|(q, port)| (IpAddr::V6(q), port)),
    };
    match quoted {
        Some((quoted_dst, port)) if quoted_dst == dst && port.map_or(true, |p| p == PROBE_PORT) => {
            Some(false)
        }
        _ => None,
    }
}

/// Destination (and UDP port, if present) of the datagram quoted in an ICMP
/// error carried in an IPv4 packet.
fn quoted_v4(packet: &[u8]) -> Option<(Ipv4Addr, Option<u16>)> {
    let ihl = usize::from(*packet.first()? & 0x0f) * 4;
    let icmp = packet.get(ihl..)?;
    if !matches!(*icmp.first()?, ICMP_TIME_EXCEEDED | ICMP_DEST_UNREACHABLE) {
        return None;
    }
    let inner = icmp.get(8..)?;
    let dst = inner.get(16..20)?;
    let inner_ihl = usize::from(*inner.first()? & 0x0f) * 4;
    let port = inner
        .get(inner_ihl + 2..inner_ihl + 4)
        .map(|p| u16::from_be_bytes([p[0], p[1]]));
    Some((Ipv4Addr::new(dst[0], dst[1], dst[2], dst[3]), port))
}

/// Same for ICMPv6, whose raw socket delivers no IP header.
fn quoted_v6(packet: &[u8]) -> Option<(Ipv6Addr, Option<u16>)> {
    if !matches!(*packet.first()?, ICMPV6_TIME_EXCEEDED | ICMPV6_DEST_UNREACHABLE) {
        return None;
    }
    let inner = packet.get(8..)?;
    let dst: [u8; 16] = inner.get(24..40)?.try_into().ok()?;
    let port = inner.get(42..44).map(|p| u16::from_be_bytes([p[0], p[1]]));
    Some((Ipv6Addr::from(dst), port))
}
