//! Decoded header fields for each supported layer
//!
//! The decoder fills these in place; payload bytes are not copied here.

use std::net::{Ipv4Addr, Ipv6Addr};

use super::packet::TcpFlags;

/// Ethernet II header
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EthernetInfo {
    pub src_mac: [u8; 6],
    pub dst_mac: [u8; 6],
    pub ether_type: u16,
}

/// 802.1Q tag
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VlanInfo {
    pub vlan_id: u16,
    pub ether_type: u16,
}

/// IPv4 header information
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Info {
    pub src_addr: Ipv4Addr,
    pub dst_addr: Ipv4Addr,
    pub protocol: u8,
    pub ttl: u8,
    pub more_fragments: bool,
    pub fragment_offset: u16,
    pub header_length: usize,
    pub total_length: u16,
}

impl Default for Ipv4Info {
    fn default() -> Self {
        Self {
            src_addr: Ipv4Addr::UNSPECIFIED,
            dst_addr: Ipv4Addr::UNSPECIFIED,
            protocol: 0,
            ttl: 64,
            more_fragments: false,
            fragment_offset: 0,
            header_length: 20,
            total_length: 0,
        }
    }
}

impl Ipv4Info {
    /// Check if packet is fragmented
    pub fn is_fragmented(&self) -> bool {
        self.fragment_offset > 0 || self.more_fragments
    }
}

/// IPv6 header information, extension headers already skipped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv6Info {
    pub src_addr: Ipv6Addr,
    pub dst_addr: Ipv6Addr,
    /// Upper-layer protocol after the extension chain
    pub next_header: u8,
    pub hop_limit: u8,
    pub payload_length: u16,
    /// Fixed header plus extension headers
    pub header_length: usize,
    pub fragmented: bool,
}

impl Default for Ipv6Info {
    fn default() -> Self {
        Self {
            src_addr: Ipv6Addr::UNSPECIFIED,
            dst_addr: Ipv6Addr::UNSPECIFIED,
            next_header: 0,
            hop_limit: 64,
            payload_length: 0,
            header_length: 40,
            fragmented: false,
        }
    }
}

/// TCP segment header
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpInfo {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub window: u16,
    pub header_length: usize,
}

impl TcpInfo {
    pub fn is_fin(&self) -> bool {
        self.flags.fin
    }
}

/// UDP datagram header
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UdpInfo {
    pub src_port: u16,
    pub dst_port: u16,
    pub length: u16,
}

/// ICMPv4 or ICMPv6 message header
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IcmpInfo {
    pub icmp_type: u8,
    pub code: u8,
    /// Bytes 4..8 of the header: identifier and sequence for query types
    pub rest_of_header: [u8; 4],
    /// Whole ICMP message length
    pub length: usize,
}

impl IcmpInfo {
    pub fn identifier(&self) -> u16 {
        u16::from_be_bytes([self.rest_of_header[0], self.rest_of_header[1]])
    }

    pub fn sequence(&self) -> u16 {
        u16::from_be_bytes([self.rest_of_header[2], self.rest_of_header[3]])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_icmp_id_seq() {
        let icmp = IcmpInfo {
            icmp_type: 8,
            code: 0,
            rest_of_header: [0x12, 0x34, 0x00, 0x07],
            length: 64,
        };
        assert_eq!(icmp.identifier(), 0x1234);
        assert_eq!(icmp.sequence(), 7);
    }

    #[test]
    fn test_ipv4_fragmented() {
        let mut ip = Ipv4Info::default();
        assert!(!ip.is_fragmented());
        ip.more_fragments = true;
        assert!(ip.is_fragmented());
        ip.more_fragments = false;
        ip.fragment_offset = 185;
        assert!(ip.is_fragmented());
    }
}
