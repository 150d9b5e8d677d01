//! TCP port dispatch with connection tracking
//!
//! Connections are keyed by their address/port tuple in either orientation
//! and expire after the plugin's connection timeout. Each one gets an id
//! that is also folded into the flow id, so reused port pairs show up as
//! separate flows.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace};

use crate::cache::{JanitorHandle, TtlCache};
use crate::core::layers::TcpInfo;
use crate::core::packet::{Direction, HashableIpPortTuple, Packet};
use crate::decoder::TcpProcessor;
use crate::error::Result;
use crate::flow::FlowIdBuilder;
use crate::protocols::{PortMap, Protocol, ProtocolRegistry, TcpConnection};

pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(15 * 60);

const STREAM_CAPACITY: usize = 4096;

/// `a` comes before `b` in sequence space
fn seq_before(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

fn dir_index(dir: Direction) -> usize {
    match dir {
        Direction::ToServer => 0,
        Direction::ToClient => 1,
    }
}

struct TcpStream {
    conn: TcpConnection,
    /// Next expected sequence number per direction
    next_seq: [Option<u32>; 2],
}

impl TcpStream {
    /// Returns the connection and whether the segment carries new data
    fn track(&mut self, dir: Direction, tcp: &TcpInfo, len: usize) -> (TcpConnection, bool) {
        if len == 0 {
            return (self.conn, true);
        }
        let slot = &mut self.next_seq[dir_index(dir)];
        if let Some(next) = *slot {
            if seq_before(tcp.seq, next) {
                return (self.conn, false);
            }
        }
        *slot = Some(tcp.seq.wrapping_add(len as u32));
        (self.conn, true)
    }
}

/// Routes segments to the TCP plugin of the protocol owning the port
pub struct TcpDispatcher {
    registry: Arc<ProtocolRegistry>,
    ports: PortMap,
    streams: Arc<TtlCache<HashableIpPortTuple, TcpStream>>,
    next_id: u64,
}

impl TcpDispatcher {
    pub fn new(registry: Arc<ProtocolRegistry>) -> Result<Self> {
        let ports = registry.tcp_port_map()?;
        let timeout = registry
            .iter()
            .filter_map(|reg| reg.tcp.as_ref().and_then(|p| p.connection_timeout()))
            .max()
            .unwrap_or(DEFAULT_CONNECTION_TIMEOUT);

        Ok(Self {
            registry,
            ports,
            streams: Arc::new(TtlCache::new(timeout, STREAM_CAPACITY)),
            next_id: 1,
        })
    }

    pub fn connection_timeout(&self) -> Duration {
        self.streams.ttl()
    }

    /// Tracked connections
    pub fn connections(&self) -> usize {
        self.streams.len()
    }

    /// Drop idle connections on the current tokio runtime
    pub fn start_janitor(&self, interval: Duration) -> JanitorHandle {
        self.streams.start_janitor(interval)
    }

    fn lookup(&mut self, tcp: &TcpInfo, pkt: &Packet) -> Option<(TcpConnection, Direction, bool)> {
        let len = pkt.payload.len();

        let key = pkt.tuple.hashable();
        if let Some((conn, fresh)) = self
            .streams
            .with_mut(&key, |s| s.track(Direction::ToServer, tcp, len))
        {
            return Some((conn, Direction::ToServer, fresh));
        }

        let reverse = pkt.tuple.reverse().hashable();
        if let Some((conn, fresh)) = self
            .streams
            .with_mut(&reverse, |s| s.track(Direction::ToClient, tcp, len))
        {
            return Some((conn, Direction::ToClient, fresh));
        }

        let protocol = self.ports.decide(&pkt.tuple);
        if protocol == Protocol::Unknown {
            return None;
        }

        let conn = TcpConnection {
            id: self.next_id,
            protocol,
            tuple: pkt.tuple,
        };
        self.next_id += 1;
        debug!("New {} connection {} ({})", protocol, conn.id, pkt.tuple);

        let mut stream = TcpStream {
            conn,
            next_seq: [None, None],
        };
        let (conn, fresh) = stream.track(Direction::ToServer, tcp, len);
        self.streams.put(key, stream);
        Some((conn, Direction::ToServer, fresh))
    }
}

impl TcpProcessor for TcpDispatcher {
    fn process(&mut self, flow_id: Option<&mut FlowIdBuilder>, tcp: &TcpInfo, pkt: &Packet) {
        let Some((conn, dir, fresh)) = self.lookup(tcp, pkt) else {
            trace!("unknown tcp protocol for {}", pkt.tuple);
            return;
        };

        if let Some(flow_id) = flow_id {
            flow_id.add_connection_id(conn.id);
        }

        if !fresh {
            debug!("Ignoring retransmitted segment on connection {}", conn.id);
            return;
        }

        let Some(plugin) = self.registry.tcp_plugin(conn.protocol) else {
            trace!("no tcp plugin loaded for {}", conn.protocol);
            return;
        };

        if !pkt.payload.is_empty() {
            plugin.parse_tcp(pkt, &conn, dir);
        }
        if tcp.is_fin() {
            plugin.received_fin(&conn, dir);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::packet::{IpPortTuple, TcpFlags};
    use crate::flow::FlowIdView;
    use crate::protocols::{ProtocolRegistration, TcpPlugin};
    use chrono::Utc;
    use parking_lot::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    enum Seen {
        Data(u64, Direction, Vec<u8>),
        Fin(u64, Direction),
    }

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<Seen>>,
    }

    impl TcpPlugin for Recorder {
        fn parse_tcp(&self, pkt: &Packet, conn: &TcpConnection, dir: Direction) {
            self.seen
                .lock()
                .push(Seen::Data(conn.id, dir, pkt.payload.clone()));
        }

        fn received_fin(&self, conn: &TcpConnection, dir: Direction) {
            self.seen.lock().push(Seen::Fin(conn.id, dir));
        }

        fn connection_timeout(&self) -> Option<Duration> {
            Some(Duration::from_secs(60))
        }
    }

    const CLIENT: &str = "10.0.0.2";
    const SERVER: &str = "10.0.0.1";

    fn segment(from_client: bool, cport: u16, seq: u32, flags: u8, payload: &[u8]) -> (TcpInfo, Packet) {
        let (src, sport, dst, dport) = if from_client {
            (CLIENT, cport, SERVER, 80)
        } else {
            (SERVER, 80, CLIENT, cport)
        };
        let tcp = TcpInfo {
            src_port: sport,
            dst_port: dport,
            seq,
            flags: TcpFlags::from_u8(flags),
            header_length: 20,
            ..Default::default()
        };
        let pkt = Packet::new(
            Utc::now(),
            IpPortTuple::new(src.parse().unwrap(), sport, dst.parse().unwrap(), dport),
            payload.to_vec(),
        );
        (tcp, pkt)
    }

    fn dispatcher() -> (TcpDispatcher, Arc<Recorder>) {
        let http = Arc::new(Recorder::default());
        let mut registry = ProtocolRegistry::new();
        registry.register(ProtocolRegistration::tcp(Protocol::Http, &[80], http.clone()));
        (TcpDispatcher::new(Arc::new(registry)).unwrap(), http)
    }

    fn feed(tcp: &mut TcpDispatcher, seg: (TcpInfo, Packet)) -> FlowIdBuilder {
        let mut id = FlowIdBuilder::new();
        tcp.process(Some(&mut id), &seg.0, &seg.1);
        id
    }

    #[test]
    fn test_request_response_and_fin() {
        let (mut tcp, http) = dispatcher();
        assert_eq!(tcp.connection_timeout(), Duration::from_secs(60));

        let id = feed(&mut tcp, segment(true, 40000, 100, 0x18, b"GET /"));
        assert_eq!(id.connection_id(), Some(1));
        feed(&mut tcp, segment(false, 40000, 900, 0x18, b"200 OK"));
        feed(&mut tcp, segment(true, 40000, 105, 0x11, b""));

        assert_eq!(
            *http.seen.lock(),
            vec![
                Seen::Data(1, Direction::ToServer, b"GET /".to_vec()),
                Seen::Data(1, Direction::ToClient, b"200 OK".to_vec()),
                Seen::Fin(1, Direction::ToServer),
            ]
        );
        assert_eq!(tcp.connections(), 1);
    }

    #[test]
    fn test_retransmission_dropped() {
        let (mut tcp, http) = dispatcher();
        feed(&mut tcp, segment(true, 40000, 100, 0x18, b"hello"));
        let id = feed(&mut tcp, segment(true, 40000, 100, 0x18, b"hello"));
        // still attributed to the connection
        assert_eq!(id.connection_id(), Some(1));
        feed(&mut tcp, segment(true, 40000, 105, 0x18, b"world"));

        let seen = http.seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1], Seen::Data(1, Direction::ToServer, b"world".to_vec()));
    }

    #[test]
    fn test_sequence_wraparound() {
        assert!(seq_before(u32::MAX - 1, 3));
        assert!(!seq_before(3, u32::MAX - 1));
        assert!(!seq_before(7, 7));
    }

    #[test]
    fn test_connection_ids_increase() {
        let (mut tcp, _) = dispatcher();
        let a = feed(&mut tcp, segment(true, 40000, 1, 0x02, b""));
        let b = feed(&mut tcp, segment(true, 40001, 1, 0x02, b""));
        let a_reply = feed(&mut tcp, segment(false, 40000, 1, 0x12, b""));
        assert_eq!(a.connection_id(), Some(1));
        assert_eq!(b.connection_id(), Some(2));
        assert_eq!(a_reply.connection_id(), Some(1));
    }

    #[test]
    fn test_unknown_port_not_tracked() {
        let (mut tcp, http) = dispatcher();
        let (info, mut pkt) = segment(true, 40000, 1, 0x18, b"ssh");
        pkt.tuple.dst_port = 22;
        let mut id = FlowIdBuilder::new();
        tcp.process(Some(&mut id), &info, &pkt);
        assert_eq!(id.connection_id(), None);
        assert_eq!(tcp.connections(), 0);
        assert!(http.seen.lock().is_empty());
    }
}
