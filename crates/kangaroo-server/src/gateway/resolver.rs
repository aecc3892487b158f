//! DNS resolution via `tokio::net::lookup_host`.
//!
//! The forwarder needs exactly one concrete address per request: policy is
//! never evaluated against a hostname.

use std::net::IpAddr;
use tokio::net;
use tracing::{debug, warn};

/// Stateless async DNS resolver.
///
/// All methods are static; the struct exists only for namespacing.
pub struct DnsResolver;

impl DnsResolver {
    /// Resolve `host` to its first address.
    ///
    /// IP literals (including bracketed IPv6) are returned without a lookup.
    /// A dummy port (`:0`) is appended for `lookup_host`, which requires a
    /// `host:port` pair.
    ///
    /// # Errors
    ///
    /// Returns `Err(String)` if the lookup fails (e.g. NXDOMAIN) or yields no
    /// addresses.
    pub async fn resolve_first(host: &str) -> Result<IpAddr, String> {
        if let Some(ip) = Self::literal(host) {
            return Ok(ip);
        }

        let lookup_addr = format!("{}:0", host);
        let result = net::lookup_host(&lookup_addr).await;
        match result {
            Ok(mut addrs) => match addrs.next() {
                Some(addr) => {
                    debug!(name = %host, ip = %addr.ip(), "resolved");
                    Ok(addr.ip().to_canonical())
                }
                None => {
                    debug!(name = %host, "no addresses found");
                    Err(format!("no IP found for {}", host))
                }
            },
            Err(e) => {
                warn!(name = %host, error = %e, "DNS resolution failed");
                Err(format!("error looking up {}: {}", host, e))
            }
        }
    }

    /// Parse `host` as an IP literal, bracketed or not, without any lookup.
    pub fn literal(host: &str) -> Option<IpAddr> {
        let literal = host.trim_start_matches('[').trim_end_matches(']');
        literal.parse::<IpAddr>().ok().map(|ip| ip.to_canonical())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_localhost() {
        let result = DnsResolver::resolve_first("localhost").await;
        assert!(result.is_ok(), "localhost should resolve: {:?}", result);
        assert!(result.unwrap().is_loopback());
    }

    #[tokio::test]
    async fn test_resolve_literals() {
        assert_eq!(
            DnsResolver::resolve_first("10.1.2.3").await.unwrap(),
            "10.1.2.3".parse::<IpAddr>().unwrap()
        );
        assert_eq!(
            DnsResolver::resolve_first("[2001:db8::5]").await.unwrap(),
            "2001:db8::5".parse::<IpAddr>().unwrap()
        );
        assert_eq!(
            DnsResolver::resolve_first("::ffff:192.0.2.9").await.unwrap(),
            "192.0.2.9".parse::<IpAddr>().unwrap()
        );
    }

    #[tokio::test]
    async fn test_resolve_invalid() {
        let result = DnsResolver::resolve_first("this.host.definitely.does.not.exist.invalid").await;
        assert!(result.is_err());
    }

    #[test]
    fn test_literal_skips_names() {
        assert_eq!(DnsResolver::literal("[::1]"), Some("::1".parse::<IpAddr>().unwrap()));
        assert_eq!(DnsResolver::literal("127.0.0.2"), Some("127.0.0.2".parse::<IpAddr>().unwrap()));
        assert_eq!(DnsResolver::literal("db.internal"), None);
    }
}
