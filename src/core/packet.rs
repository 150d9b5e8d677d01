//! Transport-level packet representation
//!
//! A `Packet` is built by the frame decoder once the IP and transport layers
//! of a frame are known, handed to exactly one transport handler, then
//! dropped.

use std::net::{IpAddr, Ipv4Addr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// TCP flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TcpFlags {
    pub fin: bool,
    pub syn: bool,
    pub rst: bool,
    pub psh: bool,
    pub ack: bool,
    pub urg: bool,
    pub ece: bool,
    pub cwr: bool,
}

impl TcpFlags {
    pub fn from_u8(flags: u8) -> Self {
        Self {
            fin: flags & 0x01 != 0,
            syn: flags & 0x02 != 0,
            rst: flags & 0x04 != 0,
            psh: flags & 0x08 != 0,
            ack: flags & 0x10 != 0,
            urg: flags & 0x20 != 0,
            ece: flags & 0x40 != 0,
            cwr: flags & 0x80 != 0,
        }
    }
}

/// Packet direction relative to connection initiator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// From client to server (initiator -> responder)
    ToServer,
    /// From server to client (responder -> initiator)
    ToClient,
}

/// Size of a hashable IP/port tuple: family, two 16 byte addresses, two ports.
pub const HASHABLE_TUPLE_SIZE: usize = 1 + 16 + 16 + 2 + 2;

/// Fixed-size, hashable form of an `IpPortTuple`
pub type HashableIpPortTuple = [u8; HASHABLE_TUPLE_SIZE];

/// Address/port 4-tuple of a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IpPortTuple {
    /// 4 or 6
    pub ip_length: u8,
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
}

impl Default for IpPortTuple {
    fn default() -> Self {
        Self {
            ip_length: 4,
            src_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            dst_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            src_port: 0,
            dst_port: 0,
        }
    }
}

impl IpPortTuple {
    pub fn new(src_ip: IpAddr, src_port: u16, dst_ip: IpAddr, dst_port: u16) -> Self {
        let ip_length = if src_ip.is_ipv4() { 4 } else { 6 };
        Self {
            ip_length,
            src_ip,
            dst_ip,
            src_port,
            dst_port,
        }
    }

    /// Swap source and destination
    pub fn reverse(&self) -> Self {
        Self {
            ip_length: self.ip_length,
            src_ip: self.dst_ip,
            dst_ip: self.src_ip,
            src_port: self.dst_port,
            dst_port: self.src_port,
        }
    }

    pub fn hashable(&self) -> HashableIpPortTuple {
        let mut raw = [0u8; HASHABLE_TUPLE_SIZE];
        raw[0] = self.ip_length;
        raw[1..17].copy_from_slice(&ip_bytes16(self.src_ip));
        raw[17..33].copy_from_slice(&ip_bytes16(self.dst_ip));
        raw[33..35].copy_from_slice(&self.src_port.to_be_bytes());
        raw[35..37].copy_from_slice(&self.dst_port.to_be_bytes());
        raw
    }
}

impl std::fmt::Display for IpPortTuple {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "IpPortTuple src[{}:{}] dst[{}:{}]",
            self.src_ip, self.src_port, self.dst_ip, self.dst_port
        )
    }
}

/// Address widened to 16 bytes (IPv4 is stored v4-mapped).
pub fn ip_bytes16(ip: IpAddr) -> [u8; 16] {
    match ip {
        IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
        IpAddr::V6(v6) => v6.octets(),
    }
}

/// Decoded transport-level packet
#[derive(Debug, Clone)]
pub struct Packet {
    /// Capture timestamp
    pub ts: DateTime<Utc>,
    pub tuple: IpPortTuple,
    /// Transport payload (empty for header-only segments)
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn new(ts: DateTime<Utc>, tuple: IpPortTuple, payload: Vec<u8>) -> Self {
        Self { ts, tuple, payload }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tcp_flags() {
        let flags = TcpFlags::from_u8(0x12); // SYN+ACK
        assert!(flags.syn);
        assert!(flags.ack);
        assert!(!flags.fin);
        assert!(TcpFlags::from_u8(0x11).fin);
    }

    #[test]
    fn test_tuple_reverse_hashable() {
        let tuple = IpPortTuple::new(
            "192.168.1.1".parse().unwrap(),
            40000,
            "10.0.0.1".parse().unwrap(),
            80,
        );
        let rev = tuple.reverse();
        assert_eq!(rev.src_port, 80);
        assert_eq!(rev.dst_ip, tuple.src_ip);
        assert_ne!(tuple.hashable(), rev.hashable());
        assert_eq!(rev.reverse().hashable(), tuple.hashable());
    }

    #[test]
    fn test_ip_bytes16_maps_v4() {
        let v4: IpAddr = "10.1.2.3".parse().unwrap();
        let raw = ip_bytes16(v4);
        assert_eq!(&raw[..12], &[0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xff, 0xff]);
        assert_eq!(&raw[12..], &[10, 1, 2, 3]);

        let v6: IpAddr = "fe80::1".parse().unwrap();
        assert_eq!(ip_bytes16(v6)[0], 0xfe);
    }
}
