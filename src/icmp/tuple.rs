use std::fmt;
use std::net::IpAddr;

use crate::core::packet::ip_bytes16;

/// version, two 16 byte addresses, identifier, sequence
pub const HASHABLE_ICMP_TUPLE_SIZE: usize = 1 + 16 + 16 + 2 + 2;

pub type HashableIcmpTuple = [u8; HASHABLE_ICMP_TUPLE_SIZE];

/// Identifies one ICMP request/response exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IcmpTuple {
    /// 4 or 6
    pub version: u8,
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub id: u16,
    pub seq: u16,
}

impl IcmpTuple {
    pub fn reverse(&self) -> Self {
        Self {
            src_ip: self.dst_ip,
            dst_ip: self.src_ip,
            ..*self
        }
    }

    pub fn hashable(&self) -> HashableIcmpTuple {
        let mut raw = [0u8; HASHABLE_ICMP_TUPLE_SIZE];
        raw[0] = self.version;
        raw[1..17].copy_from_slice(&ip_bytes16(self.src_ip));
        raw[17..33].copy_from_slice(&ip_bytes16(self.dst_ip));
        raw[33..35].copy_from_slice(&self.id.to_be_bytes());
        raw[35..37].copy_from_slice(&self.seq.to_be_bytes());
        raw
    }
}

impl fmt::Display for IcmpTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "IcmpTuple version[{}] src[{}] dst[{}] id[{}] seq[{}]",
            self.version, self.src_ip, self.dst_ip, self.id, self.seq
        )
    }
}
