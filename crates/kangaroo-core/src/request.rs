//! Forward requests: the RFC 4254 §7.2 `direct-tcpip` fields and the peer
//! address of the session that sent them.
//!
//! The SSH transport decodes the channel-open payload; this module validates
//! the decoded fields and pins the request to the peer's canonical IP.

use crate::error::{KangarooError, KangarooResult};
use std::net::{IpAddr, SocketAddr};

/// `direct-tcpip` channel-open fields, ports still as sent on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectTcpip {
    pub host: String,
    pub port: u32,
    pub originator: String,
    pub originator_port: u32,
}

/// Extract the IP from a raw peer address.
///
/// Accepts `1.2.3.4:22`, `[2001:db8::1]:22`, `[2001:db8::1]` and bare IPs.
/// IPv4-mapped IPv6 addresses (dual-stack listeners) come back as IPv4.
pub fn parse_peer_ip(raw: &str) -> KangarooResult<IpAddr> {
    let raw = raw.trim();
    let ip = if let Ok(sock) = raw.parse::<SocketAddr>() {
        sock.ip()
    } else if let Ok(ip) = raw.parse::<IpAddr>() {
        ip
    } else if let Some(inner) = raw.strip_prefix('[').and_then(|s| s.split(']').next()) {
        inner
            .parse::<IpAddr>()
            .map_err(|_| KangarooError::Malformed(format!("bad peer address {raw:?}")))?
    } else {
        return Err(KangarooError::Malformed(format!("bad peer address {raw:?}")));
    };
    Ok(ip.to_canonical())
}

/// One port-forward attempt, ready for policy evaluation once the destination
/// host has been resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardRequest {
    pub source: IpAddr,
    pub dest_host: String,
    pub dest_port: u16,
    pub origin_host: String,
    pub origin_port: u16,
}

impl ForwardRequest {
    /// Build a request from the peer's raw address and a decoded payload.
    ///
    /// # Errors
    ///
    /// [`KangarooError::Malformed`] if the peer address cannot be parsed, the
    /// destination host is empty, or a port does not fit in 16 bits.
    pub fn from_direct_tcpip(peer: &str, payload: DirectTcpip) -> KangarooResult<Self> {
        let source = parse_peer_ip(peer)?;
        if payload.host.is_empty() {
            return Err(KangarooError::Malformed("empty destination host".into()));
        }
        let dest_port = u16::try_from(payload.port)
            .map_err(|_| KangarooError::Malformed(format!("port {} out of range", payload.port)))?;
        let origin_port = u16::try_from(payload.originator_port).map_err(|_| {
            KangarooError::Malformed(format!(
                "originator port {} out of range",
                payload.originator_port
            ))
        })?;
        Ok(Self {
            source,
            dest_host: payload.host,
            dest_port,
            origin_host: payload.originator,
            origin_port,
        })
    }
}
