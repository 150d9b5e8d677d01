//! Application protocol plugin interface
//!
//! Payload parsing lives outside this crate. A plugin receives transport
//! packets for the ports its protocol claims.

use std::time::Duration;

use crate::core::packet::{Direction, IpPortTuple, Packet};

use super::Protocol;

/// TCP connection a segment belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpConnection {
    /// Unique per dispatcher, increasing
    pub id: u64,
    pub protocol: Protocol,
    /// Oriented from the side that sent the first segment
    pub tuple: IpPortTuple,
}

/// TCP protocol plugin
pub trait TcpPlugin: Send + Sync {
    /// Handle a segment carrying payload
    fn parse_tcp(&self, pkt: &Packet, conn: &TcpConnection, dir: Direction);

    /// Peer in `dir` sent FIN
    fn received_fin(&self, _conn: &TcpConnection, _dir: Direction) {}

    /// Idle time before connection state is dropped; `None` uses the
    /// dispatcher default
    fn connection_timeout(&self) -> Option<Duration> {
        None
    }
}

/// UDP protocol plugin
pub trait UdpPlugin: Send + Sync {
    fn parse_udp(&self, pkt: &Packet);
}
