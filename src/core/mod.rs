//! Shared packet types
//!
//! - `packet`: transport-level `Packet` and its address/port tuple
//! - `layers`: decoded header fields per layer

pub mod layers;
pub mod packet;

pub use layers::{EthernetInfo, IcmpInfo, Ipv4Info, Ipv6Info, TcpInfo, UdpInfo, VlanInfo};
pub use packet::{
    Direction, HashableIpPortTuple, IpPortTuple, Packet, TcpFlags, HASHABLE_TUPLE_SIZE,
};
