//! Single ICMP / ICMPv6 echo, used to make the kernel resolve (or re-confirm)
//! the link-layer address of a destination before its neighbor entry is read.
//!
//! Prefers an unprivileged datagram ping socket and falls back to a raw
//! socket. Blocking; callers run it on the blocking pool.

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io;
use std::mem::MaybeUninit;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

const ICMP_ECHO_REQUEST: u8 = 8;
const ICMPV6_ECHO_REQUEST: u8 = 128;
const ECHO_PAYLOAD: &[u8] = b"kangaroo";

/// Sends one echo request and waits for a reply from the destination.
#[derive(Debug, Clone, Copy, Default)]
pub struct IcmpEcho;

impl IcmpEcho {
    /// Returns `Ok(true)` if a reply from `dst` arrived within `timeout`,
    /// `Ok(false)` on timeout, and `Err` if the probe could not be sent.
    pub fn ping(dst: IpAddr, timeout: Duration) -> io::Result<bool> {
        let socket = open_socket(dst)?;
        let packet = echo_request(dst, rand::random(), 1);
        socket.send_to(&packet, &SockAddr::from(SocketAddr::new(dst, 0)))?;

        let deadline = Instant::now() + timeout;
        let mut buf = [0u8; 1500];
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(false);
            }
            socket.set_read_timeout(Some(remaining))?;
            match recv_from(&socket, &mut buf) {
                Ok((_, Some(from))) if from == dst => return Ok(true),
                Ok((n, from)) => trace!(?from, len = n, "ignoring unrelated ICMP"),
                Err(e) if is_timeout(&e) => return Ok(false),
                Err(e) => return Err(e),
            }
        }
    }
}

fn open_socket(dst: IpAddr) -> io::Result<Socket> {
    let (domain, protocol) = match dst {
        IpAddr::V4(_) => (Domain::IPV4, Protocol::ICMPV4),
        IpAddr::V6(_) => (Domain::IPV6, Protocol::ICMPV6),
    };
    Socket::new(domain, Type::DGRAM, Some(protocol)).or_else(|e| {
        debug!(error = %e, "datagram ping socket unavailable, trying raw socket");
        Socket::new(domain, Type::RAW, Some(protocol))
    })
}

/// Build an echo request. The ICMPv6 checksum is left zero: the kernel
/// computes it over the pseudo-header.
pub(super) fn echo_request(dst: IpAddr, ident: u16, seq: u16) -> Vec<u8> {
    let kind = match dst {
        IpAddr::V4(_) => ICMP_ECHO_REQUEST,
        IpAddr::V6(_) => ICMPV6_ECHO_REQUEST,
    };
    let mut packet = Vec::with_capacity(8 + ECHO_PAYLOAD.len());
    packet.extend_from_slice(&[kind, 0, 0, 0]);
    packet.extend_from_slice(&ident.to_be_bytes());
    packet.extend_from_slice(&seq.to_be_bytes());
    packet.extend_from_slice(ECHO_PAYLOAD);
    if dst.is_ipv4() {
        let checksum = internet_checksum(&packet);
        packet[2..4].copy_from_slice(&checksum.to_be_bytes());
    }
    packet
}

/// RFC 1071 checksum.
pub(super) fn internet_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);
    for pair in &mut chunks {
        sum += u32::from(u16::from_be_bytes([pair[0], pair[1]]));
    }
    if let [last] = chunks.remainder() {
        sum += u32::from(*last) << 8;
    }
    while sum > 0xFFFF {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !sum as u16
}

/// `recvfrom` into an initialised buffer, returning the sender's IP.
pub(super) fn recv_from(socket: &Socket, buf: &mut [u8]) -> io::Result<(usize, Option<IpAddr>)> {
    // SAFETY: `MaybeUninit<u8>` has the same layout as `u8` and the kernel
    // only writes initialised bytes into the buffer.
    let uninit = unsafe { &mut *(buf as *mut [u8] as *mut [MaybeUninit<u8>]) };
    let (n, addr) = socket.recv_from(uninit)?;
    Ok((n, addr.as_socket().map(|s| s.ip().to_canonical())))
}

pub(super) fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_of_valid_packet_is_zero() {
        let dst: IpAddr = "192.0.2.1".parse().unwrap();
        let packet = echo_request(dst, 0x1234, 7);
        assert_eq!(packet[0], ICMP_ECHO_REQUEST);
        assert_eq!(internet_checksum(&packet), 0);
    }

    #[test]
    fn test_checksum_odd_length() {
        // 0x0100 + 0x0200 (odd trailing byte padded) = 0x0300
        assert_eq!(internet_checksum(&[0x01, 0x00, 0x02]), !0x0300u16);
    }

    #[test]
    fn test_icmpv6_request_leaves_checksum_to_kernel() {
        let dst: IpAddr = "2001:db8::1".parse().unwrap();
        let packet = echo_request(dst, 1, 1);
        assert_eq!(packet[0], ICMPV6_ECHO_REQUEST);
        assert_eq!(&packet[2..4], &[0, 0]);
        assert_eq!(&packet[8..], ECHO_PAYLOAD);
    }
}
