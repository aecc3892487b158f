//! Neighbor-cache strategy: ping once, then read the kernel neighbor table.
//!
//! The table is read natively through an `RTM_GETNEIGH` netlink dump on
//! Linux. Both the echo and the table read sit behind traits so the strategy
//! can be driven by fakes in tests.

use super::icmp::IcmpEcho;
use super::AdjacencyProber;
use async_trait::async_trait;
use std::io;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Kernel neighbor (ARP / NDP) entry state, from the `NUD_*` flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NeighborState {
    Incomplete,
    Reachable,
    Stale,
    Delay,
    Probe,
    Failed,
    NoArp,
    Permanent,
    Unknown(u16),
}

impl NeighborState {
    pub fn from_nud(state: u16) -> Self {
        match state {
            0x01 => Self::Incomplete,
            0x02 => Self::Reachable,
            0x04 => Self::Stale,
            0x08 => Self::Delay,
            0x10 => Self::Probe,
            0x20 => Self::Failed,
            0x40 => Self::NoArp,
            0x80 => Self::Permanent,
            other => Self::Unknown(other),
        }
    }

    /// Confirmed (`REACHABLE`) or provisionally confirmed (`DELAY`) mapping.
    pub fn is_adjacent(self) -> bool {
        matches!(self, Self::Reachable | Self::Delay)
    }
}

/// Read access to the OS neighbor table.
pub trait NeighborTableReader: Send + Sync {
    /// State of the entry for `ip`, or `None` if there is no entry.
    fn lookup(&self, ip: IpAddr) -> io::Result<Option<NeighborState>>;
}

/// One echo toward a destination, to provoke neighbor resolution.
pub trait EchoProbe: Send + Sync {
    /// `Ok(true)` if the destination replied, `Ok(false)` on timeout.
    fn echo(&self, dst: IpAddr, timeout: Duration) -> io::Result<bool>;
}

impl EchoProbe for IcmpEcho {
    fn echo(&self, dst: IpAddr, timeout: Duration) -> io::Result<bool> {
        IcmpEcho::ping(dst, timeout)
    }
}

/// Neighbor-cache adjacency prober.
#[derive(Clone)]
pub struct NeighborCacheProber {
    echo: Arc<dyn EchoProbe>,
    table: Arc<dyn NeighborTableReader>,
    echo_timeout: Duration,
}

impl NeighborCacheProber {
    pub fn new(echo: Arc<dyn EchoProbe>, table: Arc<dyn NeighborTableReader>) -> Self {
        Self {
            echo,
            table,
            echo_timeout: Duration::from_secs(1),
        }
    }

    /// ICMP echo plus the platform's native neighbor table.
    pub fn system() -> Self {
        Self::new(Arc::new(IcmpEcho), Arc::new(SystemNeighborTable))
    }

    fn check(&self, dst: IpAddr) -> bool {
        check(self.echo.as_ref(), self.table.as_ref(), dst, self.echo_timeout)
    }
}

fn check(echo: &dyn EchoProbe, table: &dyn NeighborTableReader, dst: IpAddr, timeout: Duration) -> bool {
    match echo.echo(dst, timeout) {
        Ok(replied) => debug!(dst = %dst, replied, "echo probe sent"),
        Err(e) => {
            warn!(dst = %dst, error = %e, "echo probe failed, treating as not adjacent");
            return false;
        }
    }

    match table.lookup(dst) {
        Ok(Some(state)) => {
            debug!(dst = %dst, ?state, "neighbor entry found");
            state.is_adjacent()
        }
        Ok(None) => {
            debug!(dst = %dst, "no neighbor entry");
            false
        }
        Err(e) => {
            warn!(dst = %dst, error = %e, "neighbor table unavailable, treating as not adjacent");
            false
        }
    }
}

#[async_trait]
impl AdjacencyProber for NeighborCacheProber {
    async fn is_link_local(&self, dst: IpAddr) -> bool {
        let prober = self.clone();
        tokio::task::spawn_blocking(move || prober.check(dst))
            .await
            .unwrap_or_else(|e| {
                warn!(dst = %dst, error = %e, "neighbor probe task failed");
                false
            })
    }

    fn name(&self) -> &'static str {
        "neighbor"
    }
}

/// The native neighbor table of the running OS.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemNeighborTable;

#[cfg(target_os = "linux")]
impl NeighborTableReader for SystemNeighborTable {
    fn lookup(&self, ip: IpAddr) -> io::Result<Option<NeighborState>> {
        let entries = netlink::dump(ip)?;
        Ok(best_state(&entries, ip))
    }
}

#[cfg(not(target_os = "linux"))]
impl NeighborTableReader for SystemNeighborTable {
    fn lookup(&self, _ip: IpAddr) -> io::Result<Option<NeighborState>> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "neighbor table queries are only implemented for Linux",
        ))
    }
}

/// An address can have entries on several interfaces; any adjacent one wins.
fn best_state(entries: &[(IpAddr, NeighborState)], ip: IpAddr) -> Option<NeighborState> {
    entries
        .iter()
        .filter(|(addr, _)| *addr == ip)
        .map(|(_, state)| *state)
        .max_by_key(|state| state.is_adjacent())
}

/// Minimal rtnetlink client for `RTM_GETNEIGH` dumps.
mod netlink {
    use super::NeighborState;
    use std::io;
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

    const NLMSG_HDRLEN: usize = 16;
    const NDMSG_LEN: usize = 12;
    const RTA_HDRLEN: usize = 4;

    const NLMSG_ERROR: u16 = 2;
    const NLMSG_DONE: u16 = 3;
    const RTM_NEWNEIGH: u16 = 28;
    const RTM_GETNEIGH: u16 = 30;
    const NLM_F_REQUEST: u16 = 0x01;
    const NLM_F_DUMP: u16 = 0x300;
    const NDA_DST: u16 = 1;

    const AF_INET: u8 = 2;
    const AF_INET6: u8 = 10;

    fn align(len: usize) -> usize {
        (len + 3) & !3
    }

    fn family_of(ip: IpAddr) -> u8 {
        match ip {
            IpAddr::V4(_) => AF_INET,
            IpAddr::V6(_) => AF_INET6,
        }
    }

    /// Dump request for one address family.
    pub(super) fn request(family: u8, seq: u32) -> Vec<u8> {
        let len = (NLMSG_HDRLEN + NDMSG_LEN) as u32;
        let mut buf = Vec::with_capacity(len as usize);
        buf.extend_from_slice(&len.to_ne_bytes());
        buf.extend_from_slice(&RTM_GETNEIGH.to_ne_bytes());
        buf.extend_from_slice(&(NLM_F_REQUEST | NLM_F_DUMP).to_ne_bytes());
        buf.extend_from_slice(&seq.to_ne_bytes());
        buf.extend_from_slice(&0u32.to_ne_bytes());
        buf.push(family);
        buf.extend_from_slice(&[0u8; NDMSG_LEN - 1]);
        buf
    }

    /// Parse one datagram of a dump. Returns `true` once `NLMSG_DONE` is seen.
    pub(super) fn parse(
        mut buf: &[u8],
        seq: u32,
        out: &mut Vec<(IpAddr, NeighborState)>,
    ) -> io::Result<bool> {
        while buf.len() >= NLMSG_HDRLEN {
            let len = u32::from_ne_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
            let kind = u16::from_ne_bytes([buf[4], buf[5]]);
            let msg_seq = u32::from_ne_bytes([buf[8], buf[9], buf[10], buf[11]]);
            if len < NLMSG_HDRLEN || len > buf.len() {
                return Err(io::Error::new(io::ErrorKind::InvalidData, "truncated netlink message"));
            }
            let body = &buf[NLMSG_HDRLEN..len];
            buf = &buf[align(len).min(buf.len())..];

            if msg_seq != seq {
                continue;
            }
            match kind {
                NLMSG_DONE => return Ok(true),
                NLMSG_ERROR => {
                    if body.len() >= 4 {
                        let errno = i32::from_ne_bytes([body[0], body[1], body[2], body[3]]);
                        if errno != 0 {
                            return Err(io::Error::from_raw_os_error(-errno));
                        }
                    }
                }
                RTM_NEWNEIGH => {
                    if let Some(entry) = parse_neighbor(body) {
                        out.push(entry);
                    }
                }
                _ => {}
            }
        }
        Ok(false)
    }

    fn parse_neighbor(body: &[u8]) -> Option<(IpAddr, NeighborState)> {
        if body.len() < NDMSG_LEN {
            return None;
        }
        let family = body[0];
        let state = NeighborState::from_nud(u16::from_ne_bytes([body[8], body[9]]));

        let mut attrs = &body[NDMSG_LEN..];
        while attrs.len() >= RTA_HDRLEN {
            let len = u16::from_ne_bytes([attrs[0], attrs[1]]) as usize;
            let kind = u16::from_ne_bytes([attrs[2], attrs[3]]);
            if len < RTA_HDRLEN || len > attrs.len() {
                return None;
            }
            let value = &attrs[RTA_HDRLEN..len];
            if kind == NDA_DST {
                let ip = match (family, value.len()) {
                    (AF_INET, 4) => IpAddr::V4(Ipv4Addr::new(value[0], value[1], value[2], value[3])),
                    (AF_INET6, 16) => {
                        let mut octets = [0u8; 16];
                        octets.copy_from_slice(value);
                        IpAddr::V6(Ipv6Addr::from(octets))
                    }
                    _ => return None,
                };
                return Some((ip, state));
            }
            attrs = &attrs[align(len).min(attrs.len())..];
        }
        None
    }

    /// Dump every neighbor entry of `ip`'s family.
    #[cfg(target_os = "linux")]
    pub(super) fn dump(ip: IpAddr) -> io::Result<Vec<(IpAddr, NeighborState)>> {
        use socket2::{Domain, Protocol, Socket, Type};
        use std::io::Read;
        use std::time::Duration;

        let socket = Socket::new(
            Domain::from(libc::AF_NETLINK),
            Type::RAW,
            Some(Protocol::from(libc::NETLINK_ROUTE)),
        )?;
        socket.set_read_timeout(Some(Duration::from_secs(1)))?;

        let seq: u32 = rand::random();
        socket.send(&request(family_of(ip), seq))?;

        let mut entries = Vec::new();
        let mut buf = vec![0u8; 32 * 1024];
        loop {
            let n = (&socket).read(&mut buf)?;
            if n == 0 || parse(&buf[..n], seq, &mut entries)? {
                return Ok(entries);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeEcho {
        fail: bool,
        calls: AtomicUsize,
    }

    impl FakeEcho {
        fn ok() -> Arc<Self> {
            Arc::new(Self {
                fail: false,
                calls: AtomicUsize::new(0),
            })
        }
    }

    impl EchoProbe for FakeEcho {
        fn echo(&self, _dst: IpAddr, _timeout: Duration) -> io::Result<bool> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(io::Error::from(io::ErrorKind::PermissionDenied))
            } else {
                Ok(true)
            }
        }
    }

    struct FakeTable(HashMap<IpAddr, NeighborState>);

    impl NeighborTableReader for FakeTable {
        fn lookup(&self, ip: IpAddr) -> io::Result<Option<NeighborState>> {
            Ok(self.0.get(&ip).copied())
        }
    }

    struct BrokenTable;

    impl NeighborTableReader for BrokenTable {
        fn lookup(&self, _ip: IpAddr) -> io::Result<Option<NeighborState>> {
            Err(io::Error::new(io::ErrorKind::NotFound, "no neighbor table"))
        }
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn table() -> Arc<FakeTable> {
        Arc::new(FakeTable(HashMap::from([
            (ip("192.168.1.10"), NeighborState::Reachable),
            (ip("192.168.1.11"), NeighborState::Delay),
            (ip("192.168.1.12"), NeighborState::Stale),
            (ip("192.168.1.13"), NeighborState::Failed),
            (ip("fe80::1"), NeighborState::Reachable),
        ])))
    }

    #[tokio::test]
    async fn test_reachable_and_delay_are_adjacent() {
        let prober = NeighborCacheProber::new(FakeEcho::ok(), table());
        assert!(prober.is_link_local(ip("192.168.1.10")).await);
        assert!(prober.is_link_local(ip("192.168.1.11")).await);
        assert!(prober.is_link_local(ip("fe80::1")).await);
    }

    #[tokio::test]
    async fn test_stale_failed_and_absent_are_not() {
        let prober = NeighborCacheProber::new(FakeEcho::ok(), table());
        assert!(!prober.is_link_local(ip("192.168.1.12")).await);
        assert!(!prober.is_link_local(ip("192.168.1.13")).await);
        // Several hops away: the kernel never learns a neighbor entry for it.
        assert!(!prober.is_link_local(ip("8.8.8.8")).await);
    }

    #[tokio::test]
    async fn test_echo_failure_is_not_adjacent() {
        let echo = Arc::new(FakeEcho {
            fail: true,
            calls: AtomicUsize::new(0),
        });
        let prober = NeighborCacheProber::new(echo.clone(), table());
        assert!(!prober.is_link_local(ip("192.168.1.10")).await);
        assert_eq!(echo.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_clones_share_echo_and_table() {
        let echo = FakeEcho::ok();
        let prober = NeighborCacheProber::new(echo.clone(), table());
        let copy = prober.clone();
        assert!(copy.is_link_local(ip("192.168.1.10")).await);
        assert!(prober.is_link_local(ip("192.168.1.11")).await);
        assert_eq!(echo.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_table_failure_is_not_adjacent() {
        let prober = NeighborCacheProber::new(FakeEcho::ok(), Arc::new(BrokenTable));
        assert!(!prober.is_link_local(ip("192.168.1.10")).await);
    }

    #[test]
    fn test_state_flags() {
        assert!(NeighborState::from_nud(0x02).is_adjacent());
        assert!(NeighborState::from_nud(0x08).is_adjacent());
        assert!(!NeighborState::from_nud(0x04).is_adjacent());
        assert!(!NeighborState::from_nud(0x80).is_adjacent());
        assert_eq!(NeighborState::from_nud(0x300), NeighborState::Unknown(0x300));
    }

    #[test]
    fn test_best_state_prefers_adjacent_entry() {
        let addr = ip("10.0.0.7");
        let entries = vec![
            (addr, NeighborState::Stale),
            (ip("10.0.0.8"), NeighborState::Reachable),
            (addr, NeighborState::Reachable),
        ];
        assert_eq!(best_state(&entries, addr), Some(NeighborState::Reachable));
        assert_eq!(best_state(&entries, ip("10.0.0.9")), None);
    }

    fn neighbor_message(seq: u32, family: u8, state: u16, dst: &[u8]) -> Vec<u8> {
        let attr_len = 4 + dst.len();
        let len = 16 + 12 + ((attr_len + 3) & !3);
        let mut msg = Vec::new();
        msg.extend_from_slice(&(len as u32).to_ne_bytes());
        msg.extend_from_slice(&28u16.to_ne_bytes());
        msg.extend_from_slice(&2u16.to_ne_bytes());
        msg.extend_from_slice(&seq.to_ne_bytes());
        msg.extend_from_slice(&0u32.to_ne_bytes());
        msg.push(family);
        msg.extend_from_slice(&[0, 0, 0]);
        msg.extend_from_slice(&3i32.to_ne_bytes());
        msg.extend_from_slice(&state.to_ne_bytes());
        msg.extend_from_slice(&[0, 1]);
        msg.extend_from_slice(&(attr_len as u16).to_ne_bytes());
        msg.extend_from_slice(&1u16.to_ne_bytes());
        msg.extend_from_slice(dst);
        msg.resize(len, 0);
        msg
    }

    fn done_message(seq: u32) -> Vec<u8> {
        let mut msg = Vec::new();
        msg.extend_from_slice(&20u32.to_ne_bytes());
        msg.extend_from_slice(&3u16.to_ne_bytes());
        msg.extend_from_slice(&2u16.to_ne_bytes());
        msg.extend_from_slice(&seq.to_ne_bytes());
        msg.extend_from_slice(&0u32.to_ne_bytes());
        msg.extend_from_slice(&0i32.to_ne_bytes());
        msg
    }

    #[test]
    fn test_netlink_request_layout() {
        let req = netlink::request(10, 99);
        assert_eq!(req.len(), 28);
        assert_eq!(u32::from_ne_bytes([req[0], req[1], req[2], req[3]]), 28);
        assert_eq!(u16::from_ne_bytes([req[4], req[5]]), 30);
        assert_eq!(u16::from_ne_bytes([req[6], req[7]]), 0x301);
        assert_eq!(req[16], 10);
    }

    #[test]
    fn test_netlink_parse_dump() {
        let mut datagram = neighbor_message(7, 2, 0x02, &[192, 168, 1, 10]);
        datagram.extend(neighbor_message(7, 2, 0x04, &[192, 168, 1, 12]));
        let mut v6 = [0u8; 16];
        v6[0] = 0xfe;
        v6[1] = 0x80;
        v6[15] = 1;
        datagram.extend(neighbor_message(7, 10, 0x08, &v6));

        let mut entries = Vec::new();
        let done = netlink::parse(&datagram, 7, &mut entries).unwrap();
        assert!(!done);
        assert_eq!(
            entries,
            vec![
                (ip("192.168.1.10"), NeighborState::Reachable),
                (ip("192.168.1.12"), NeighborState::Stale),
                (ip("fe80::1"), NeighborState::Delay),
            ]
        );

        assert!(netlink::parse(&done_message(7), 7, &mut entries).unwrap());
    }

    #[test]
    fn test_netlink_parse_skips_foreign_sequence() {
        let datagram = neighbor_message(1, 2, 0x02, &[10, 0, 0, 1]);
        let mut entries = Vec::new();
        netlink::parse(&datagram, 2, &mut entries).unwrap();
        assert!(entries.is_empty());
    }

    #[test]
    fn test_netlink_parse_error_message() {
        let mut msg = done_message(5);
        msg[4..6].copy_from_slice(&2u16.to_ne_bytes());
        msg[16..20].copy_from_slice(&(-1i32).to_ne_bytes());
        let mut entries = Vec::new();
        let err = netlink::parse(&msg, 5, &mut entries).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(1));
    }

    #[test]
    fn test_netlink_parse_truncated() {
        let msg = neighbor_message(1, 2, 0x02, &[10, 0, 0, 1]);
        let mut entries = Vec::new();
        assert!(netlink::parse(&msg[..20], 1, &mut entries).is_err());
    }
}
