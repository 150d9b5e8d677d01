//! Application protocol identification
//!
//! Protocols are recognized by port only. Each transport keeps its own
//! `PortMap`; the TCP and UDP dispatchers use it to pick the plugin that
//! receives a packet.

pub mod registry;
pub mod traits;

pub use registry::{PortMap, ProtocolRegistration, ProtocolRegistry};
pub use traits::{TcpConnection, TcpPlugin, UdpPlugin};

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Known application protocols
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Unknown,
    Http,
    Memcache,
    Mysql,
    Redis,
    Pgsql,
    Thrift,
    Mongodb,
    Dns,
    Amqp,
    Cassandra,
    Nfs,
    Tls,
    Sip,
    Dhcpv4,
}

impl Protocol {
    pub const ALL: [Protocol; 15] = [
        Protocol::Unknown,
        Protocol::Http,
        Protocol::Memcache,
        Protocol::Mysql,
        Protocol::Redis,
        Protocol::Pgsql,
        Protocol::Thrift,
        Protocol::Mongodb,
        Protocol::Dns,
        Protocol::Amqp,
        Protocol::Cassandra,
        Protocol::Nfs,
        Protocol::Tls,
        Protocol::Sip,
        Protocol::Dhcpv4,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Unknown => "unknown",
            Protocol::Http => "http",
            Protocol::Memcache => "memcache",
            Protocol::Mysql => "mysql",
            Protocol::Redis => "redis",
            Protocol::Pgsql => "pgsql",
            Protocol::Thrift => "thrift",
            Protocol::Mongodb => "mongodb",
            Protocol::Dns => "dns",
            Protocol::Amqp => "amqp",
            Protocol::Cassandra => "cassandra",
            Protocol::Nfs => "nfs",
            Protocol::Tls => "tls",
            Protocol::Sip => "sip",
            Protocol::Dhcpv4 => "dhcpv4",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_ascii_lowercase();
        Protocol::ALL
            .iter()
            .copied()
            .find(|p| p.as_str() == lower)
            .ok_or_else(|| format!("unknown protocol: {}", s))
    }
}
