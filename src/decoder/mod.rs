//! Frame decoder
//!
//! One `Decoder` per capture source. Every frame is decoded into the
//! reusable `DecodedLayers`, the transport packet goes to exactly one
//! handler, and the frame is then counted against its flow.

pub mod layers;

pub use layers::{DecodeError, DecodedLayers, LayerKind, LinkType};

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, trace};

use crate::core::layers::{IcmpInfo, TcpInfo};
use crate::core::packet::{IpPortTuple, Packet};
use crate::error::Result;
use crate::flow::{FlowIdBuilder, FlowIdView, FlowTable, Flows, UintCounter};

/// Receives ICMPv4 messages
pub trait Icmpv4Processor: Send + Sync {
    fn process_icmpv4(&self, flow_id: Option<&mut FlowIdBuilder>, icmp: &IcmpInfo, pkt: &Packet);
}

/// Receives ICMPv6 messages
pub trait Icmpv6Processor: Send + Sync {
    fn process_icmpv6(&self, flow_id: Option<&mut FlowIdBuilder>, icmp: &IcmpInfo, pkt: &Packet);
}

/// Receives TCP segments carrying payload or FIN
pub trait TcpProcessor: Send {
    fn process(&mut self, flow_id: Option<&mut FlowIdBuilder>, tcp: &TcpInfo, pkt: &Packet);
}

/// Receives UDP datagrams
pub trait UdpProcessor: Send {
    fn process(&mut self, flow_id: Option<&mut FlowIdBuilder>, pkt: &Packet);
}

/// Transport handlers; a missing handler drops that traffic after decode
#[derive(Default)]
pub struct Processors {
    pub icmp4: Option<Arc<dyn Icmpv4Processor>>,
    pub icmp6: Option<Arc<dyn Icmpv6Processor>>,
    pub tcp: Option<Box<dyn TcpProcessor>>,
    pub udp: Option<Box<dyn UdpProcessor>>,
}

/// Frame counts since the decoder was created
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecoderStats {
    pub frames: u64,
    /// Frames dropped on a decode error
    pub dropped: u64,
    /// Frames counted against a flow
    pub flows_updated: u64,
}

struct FlowUpdater {
    table: Arc<FlowTable>,
    id: FlowIdBuilder,
    packets: UintCounter,
    bytes: UintCounter,
}

pub struct Decoder {
    link: LinkType,
    layers: DecodedLayers,
    flows: Option<FlowUpdater>,
    processors: Processors,
    stats: DecoderStats,
}

impl Decoder {
    /// Fails on a link type without a decoder
    pub fn new(dlt: u32, flows: Option<&Flows>, processors: Processors) -> Result<Self> {
        let link = LinkType::from_dlt(dlt)?;
        debug!("Decoder for link type {:?} (dlt {})", link, dlt);

        let flows = flows.map(|flows| FlowUpdater {
            table: Arc::clone(flows.table()),
            id: FlowIdBuilder::new(),
            packets: flows.counters().uint("packets"),
            bytes: flows.counters().uint("bytes"),
        });

        Ok(Self {
            link,
            layers: DecodedLayers::default(),
            flows,
            processors,
            stats: DecoderStats::default(),
        })
    }

    pub fn link_type(&self) -> LinkType {
        self.link
    }

    pub fn stats(&self) -> DecoderStats {
        self.stats
    }

    /// Decode one frame and hand it on. Errors are logged and counted,
    /// never returned.
    ///
    /// `wire_len` is the frame length before snaplen truncation and is what
    /// the `bytes` counter adds up; a value below `data.len()` falls back to
    /// the captured length.
    pub fn on_packet(&mut self, data: &[u8], wire_len: u32, ts: DateTime<Utc>) {
        let Self {
            link,
            layers: decoded,
            flows,
            processors,
            stats,
        } = self;

        stats.frames += 1;
        decoded.reset();
        let mut flow_id = flows.as_mut().map(|f| {
            f.id.reset();
            &mut f.id
        });

        match layers::decode(*link, data, decoded, flow_id.as_deref_mut()) {
            Ok(()) => {}
            // tunnel or application port without a decoder here; the
            // datagram still goes to the udp handler with its payload
            Err(DecodeError::UnsupportedLayer {
                last: LayerKind::Udp,
                next,
            }) => trace!("udp payload left undecoded ({})", next),
            Err(err) => {
                debug!("Dropping frame: {}", err);
                stats.dropped += 1;
                return;
            }
        }

        dispatch(decoded, processors, data, ts, flow_id);

        let Some(f) = flows.as_mut() else {
            return;
        };
        if f.id.flags().is_empty() {
            return;
        }
        let shard = f.table.shard(&f.id);
        let mut guard = shard.lock();
        let mut flow = guard.get_or_create(&f.id, ts);
        f.packets.add(&mut flow, 1);
        f.bytes.add(&mut flow, u64::from(wire_len).max(data.len() as u64));
        stats.flows_updated += 1;
    }
}

fn dispatch(
    layers: &DecodedLayers,
    processors: &mut Processors,
    data: &[u8],
    ts: DateTime<Utc>,
    mut flow_id: Option<&mut FlowIdBuilder>,
) {
    let Some((src_ip, dst_ip)) = layers.addrs else {
        return;
    };
    let packet = |src_port, dst_port| {
        Packet::new(
            ts,
            IpPortTuple::new(src_ip, src_port, dst_ip, dst_port),
            layers.payload(data).to_vec(),
        )
    };

    if let Some(udp) = layers.udp {
        if let Some(handler) = processors.udp.as_deref_mut() {
            handler.process(flow_id.as_deref_mut(), &packet(udp.src_port, udp.dst_port));
        }
    } else if let Some(tcp) = layers.tcp {
        if layers.payload.is_empty() && !tcp.is_fin() {
            return;
        }
        if let Some(handler) = processors.tcp.as_deref_mut() {
            handler.process(
                flow_id.as_deref_mut(),
                &tcp,
                &packet(tcp.src_port, tcp.dst_port),
            );
        }
    } else if let Some(icmp) = layers.icmpv4 {
        if let Some(handler) = processors.icmp4.as_deref() {
            handler.process_icmpv4(flow_id.as_deref_mut(), &icmp, &packet(0, 0));
        }
    } else if let Some(icmp) = layers.icmpv6 {
        if let Some(handler) = processors.icmp6.as_deref() {
            handler.process_icmpv6(flow_id.as_deref_mut(), &icmp, &packet(0, 0));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::layers::frames::*;
    use super::*;
    use crate::flow::table::ScanAction;
    use crate::flow::{FlowDirection, FlowsConfig};
    use crate::core::packet::Direction;
    use crate::icmp::{IcmpAnalyzer, IcmpConfig};
    use crate::protocols::{
        Protocol, ProtocolRegistration, ProtocolRegistry, TcpConnection, TcpPlugin, UdpPlugin,
    };
    use crate::tcp::TcpDispatcher;
    use crate::udp::UdpDispatcher;
    use crate::publish::MemoryPublisher;
    use chrono::TimeZone;
    use parking_lot::Mutex;
    use serde_json::Value;

    const A: [u8; 4] = [10, 0, 0, 1];
    const B: [u8; 4] = [10, 0, 0, 2];

    #[derive(Default)]
    struct Seen {
        udp: Vec<(u16, u16, Vec<u8>)>,
        tcp: Vec<(u16, u16, Vec<u8>)>,
    }

    struct RecordUdp(Arc<Mutex<Seen>>);

    impl UdpProcessor for RecordUdp {
        fn process(&mut self, _flow_id: Option<&mut FlowIdBuilder>, pkt: &Packet) {
            self.0
                .lock()
                .udp
                .push((pkt.tuple.src_port, pkt.tuple.dst_port, pkt.payload.clone()));
        }
    }

    struct RecordTcp(Arc<Mutex<Seen>>);

    impl TcpProcessor for RecordTcp {
        fn process(&mut self, flow_id: Option<&mut FlowIdBuilder>, _tcp: &TcpInfo, pkt: &Packet) {
            if let Some(id) = flow_id {
                id.add_connection_id(9);
            }
            self.0
                .lock()
                .tcp
                .push((pkt.tuple.src_port, pkt.tuple.dst_port, pkt.payload.clone()));
        }
    }

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn recording(flows: Option<&Flows>) -> (Decoder, Arc<Mutex<Seen>>) {
        let seen = Arc::new(Mutex::new(Seen::default()));
        let processors = Processors {
            tcp: Some(Box::new(RecordTcp(Arc::clone(&seen)))),
            udp: Some(Box::new(RecordUdp(Arc::clone(&seen)))),
            ..Default::default()
        };
        (Decoder::new(1, flows, processors).unwrap(), seen)
    }

    /// (packets, bytes) per direction of every live flow
    fn flow_counts(flows: &Flows) -> Vec<(FlowDirection, Vec<(String, Value)>, Vec<(String, Value)>)> {
        let names = flows.counters().snapshot();
        let mut out = Vec::new();
        for shard in flows.table().shards() {
            shard.lock().scan(|flow| {
                let src = flow
                    .source_stats()
                    .named_values(&names)
                    .map(|(n, v)| (n.to_string(), v))
                    .collect();
                let dst = flow
                    .dest_stats()
                    .named_values(&names)
                    .map(|(n, v)| (n.to_string(), v))
                    .collect();
                out.push((flow.key().direction(), src, dst));
                ScanAction::Keep
            });
        }
        out
    }

    #[test]
    fn test_unsupported_link_type() {
        assert!(Decoder::new(147, None, Processors::default()).is_err());
        let decoder = Decoder::new(113, None, Processors::default()).unwrap();
        assert_eq!(decoder.link_type(), LinkType::LinuxSll);
    }

    #[test]
    fn test_registers_flow_counters() {
        let flows = Flows::new(&FlowsConfig::default()).unwrap();
        let _decoder = Decoder::new(1, Some(&flows), Processors::default()).unwrap();
        let _second = Decoder::new(1, Some(&flows), Processors::default()).unwrap();
        assert_eq!(flows.counters().snapshot().uints, vec!["packets", "bytes"]);
    }

    #[test]
    fn test_bidirectional_counts() {
        let flows = Flows::new(&FlowsConfig::default()).unwrap();
        let (mut decoder, seen) = recording(Some(&flows));

        let request = ethernet(
            MAC_A,
            MAC_B,
            0x0800,
            &ipv4(A, B, 17, &udp(40000, 9000, b"ask")),
        );
        let reply = ethernet(
            MAC_B,
            MAC_A,
            0x0800,
            &ipv4(B, A, 17, &udp(9000, 40000, b"answer")),
        );
        decoder.on_packet(&request, request.len() as u32, ts(0));
        decoder.on_packet(&request, request.len() as u32, ts(1));
        decoder.on_packet(&reply, reply.len() as u32, ts(2));

        assert_eq!(seen.lock().udp.len(), 3);
        assert_eq!(flows.table().len(), 1);

        let counts = flow_counts(&flows);
        let (_, src, dst) = &counts[0];
        assert_eq!(
            src,
            &vec![
                ("packets".to_string(), Value::from(2u64)),
                ("bytes".to_string(), Value::from(2 * request.len() as u64)),
            ]
        );
        assert_eq!(
            dst,
            &vec![
                ("packets".to_string(), Value::from(1u64)),
                ("bytes".to_string(), Value::from(reply.len() as u64)),
            ]
        );
        assert_eq!(decoder.stats().flows_updated, 3);
    }

    #[test]
    fn test_udp_unsupported_next_layer_is_benign() {
        let flows = Flows::new(&FlowsConfig::default()).unwrap();
        let (mut decoder, seen) = recording(Some(&flows));

        let frame = ethernet(
            MAC_A,
            MAC_B,
            0x0800,
            &ipv4(A, B, 17, &udp(50000, 4789, &[8, 0, 0, 0, 0, 0, 1, 0])),
        );
        decoder.on_packet(&frame, frame.len() as u32, ts(0));

        assert_eq!(seen.lock().udp, vec![(50000, 4789, vec![8, 0, 0, 0, 0, 0, 1, 0])]);
        assert_eq!(decoder.stats().dropped, 0);
        assert_eq!(flows.table().len(), 1);
    }

    #[derive(Default)]
    struct Plugin {
        udp: Mutex<Vec<(u16, Vec<u8>)>>,
        tcp: Mutex<Vec<(u64, Direction, Vec<u8>)>>,
        fins: Mutex<Vec<(u64, Direction)>>,
    }

    impl UdpPlugin for Plugin {
        fn parse_udp(&self, pkt: &Packet) {
            self.udp.lock().push((pkt.tuple.dst_port, pkt.payload.clone()));
        }
    }

    impl TcpPlugin for Plugin {
        fn parse_tcp(&self, pkt: &Packet, conn: &TcpConnection, dir: Direction) {
            self.tcp.lock().push((conn.id, dir, pkt.payload.clone()));
        }

        fn received_fin(&self, conn: &TcpConnection, dir: Direction) {
            self.fins.lock().push((conn.id, dir));
        }
    }

    fn dispatching(registry: ProtocolRegistry, flows: Option<&Flows>) -> Decoder {
        let registry = Arc::new(registry);
        let processors = Processors {
            tcp: Some(Box::new(TcpDispatcher::new(Arc::clone(&registry)).unwrap())),
            udp: Some(Box::new(UdpDispatcher::new(registry).unwrap())),
            ..Default::default()
        };
        Decoder::new(1, flows, processors).unwrap()
    }

    #[test]
    fn test_udp_plugin_on_well_known_port_gets_payload() {
        let dns = Arc::new(Plugin::default());
        let mut registry = ProtocolRegistry::new();
        registry.register(ProtocolRegistration::udp(Protocol::Dns, &[53], dns.clone()));
        let flows = Flows::new(&FlowsConfig::default()).unwrap();
        let mut decoder = dispatching(registry, Some(&flows));

        let query = ethernet(
            MAC_A,
            MAC_B,
            0x0800,
            &ipv4(A, B, 17, &udp(40000, 53, b"\x12\x34query")),
        );
        let unclaimed = ethernet(MAC_A, MAC_B, 0x0800, &ipv4(A, B, 17, &udp(40000, 54, b"x")));
        decoder.on_packet(&query, query.len() as u32, ts(0));
        decoder.on_packet(&unclaimed, unclaimed.len() as u32, ts(0));

        assert_eq!(*dns.udp.lock(), vec![(53, b"\x12\x34query".to_vec())]);
        assert_eq!(decoder.stats().dropped, 0);
        assert_eq!(flows.table().len(), 2);
    }

    #[test]
    fn test_tcp_plugin_on_registered_port() {
        let http = Arc::new(Plugin::default());
        let mut registry = ProtocolRegistry::new();
        registry.register(ProtocolRegistration::tcp(Protocol::Http, &[8080], http.clone()));
        let flows = Flows::new(&FlowsConfig::default()).unwrap();
        let mut decoder = dispatching(registry, Some(&flows));

        let request = ethernet(
            MAC_A,
            MAC_B,
            0x0800,
            &ipv4(A, B, 6, &tcp(40000, 8080, 100, 0x18, b"GET / HTTP/1.1")),
        );
        let response = ethernet(
            MAC_B,
            MAC_A,
            0x0800,
            &ipv4(B, A, 6, &tcp(8080, 40000, 500, 0x18, b"HTTP/1.1 200 OK")),
        );
        let fin = ethernet(MAC_A, MAC_B, 0x0800, &ipv4(A, B, 6, &tcp(40000, 8080, 114, 0x11, b"")));
        for frame in [&request, &response, &request, &fin] {
            decoder.on_packet(frame, frame.len() as u32, ts(0));
        }

        // the repeated request is a retransmission
        assert_eq!(
            *http.tcp.lock(),
            vec![
                (1, Direction::ToServer, b"GET / HTTP/1.1".to_vec()),
                (1, Direction::ToClient, b"HTTP/1.1 200 OK".to_vec()),
            ]
        );
        assert_eq!(*http.fins.lock(), vec![(1, Direction::ToServer)]);
        // both directions share the flow keyed by the connection id
        assert_eq!(flows.table().len(), 1);
    }

    #[test]
    fn test_bytes_count_wire_length() {
        let flows = Flows::new(&FlowsConfig::default()).unwrap();
        let (mut decoder, _) = recording(Some(&flows));

        let frame = ethernet(MAC_A, MAC_B, 0x0800, &ipv4(A, B, 17, &udp(1, 2, b"x")));
        decoder.on_packet(&frame, 1514, ts(0));
        // a bogus wire length never undercounts the captured bytes
        decoder.on_packet(&frame, 0, ts(1));

        let counts = flow_counts(&flows);
        assert_eq!(
            counts[0].1[1],
            ("bytes".to_string(), Value::from(1514 + frame.len() as u64))
        );
    }

    #[test]
    fn test_tcp_without_payload_or_fin_skips_handler() {
        let flows = Flows::new(&FlowsConfig::default()).unwrap();
        let (mut decoder, seen) = recording(Some(&flows));

        let ack = ethernet(MAC_A, MAC_B, 0x0800, &ipv4(A, B, 6, &tcp(40000, 80, 1, 0x10, b"")));
        let fin = ethernet(MAC_A, MAC_B, 0x0800, &ipv4(A, B, 6, &tcp(40000, 80, 1, 0x11, b"")));
        let data = ethernet(MAC_A, MAC_B, 0x0800, &ipv4(A, B, 6, &tcp(40000, 80, 1, 0x18, b"GET")));
        decoder.on_packet(&ack, ack.len() as u32, ts(0));
        decoder.on_packet(&fin, fin.len() as u32, ts(1));
        decoder.on_packet(&data, data.len() as u32, ts(2));

        let seen = seen.lock();
        assert_eq!(
            seen.tcp,
            vec![(40000, 80, Vec::new()), (40000, 80, b"GET".to_vec())]
        );
        // the bare ack never reached the handler, so it lacks a connection id
        assert_eq!(flows.table().len(), 2);
        assert_eq!(decoder.stats().flows_updated, 3);
    }

    #[test]
    fn test_decode_error_drops_frame() {
        let flows = Flows::new(&FlowsConfig::default()).unwrap();
        let (mut decoder, seen) = recording(Some(&flows));

        let arp = ethernet(MAC_A, MAC_B, 0x0806, &[0u8; 28]);
        decoder.on_packet(&arp, arp.len() as u32, ts(0));
        decoder.on_packet(&[0xff; 9], 9, ts(0));

        assert_eq!(decoder.stats().frames, 2);
        assert_eq!(decoder.stats().dropped, 2);
        assert!(flows.table().is_empty());
        assert!(seen.lock().udp.is_empty());
    }

    #[test]
    fn test_without_flows() {
        let (mut decoder, seen) = recording(None);
        let frame = ethernet(MAC_A, MAC_B, 0x0800, &ipv4(A, B, 17, &udp(1, 2, b"x")));
        decoder.on_packet(&frame, frame.len() as u32, ts(0));
        assert_eq!(seen.lock().udp.len(), 1);
        assert_eq!(decoder.stats().flows_updated, 0);
    }

    #[tokio::test]
    async fn test_icmp_echo_pair_shares_flow() {
        let flows = Flows::new(&FlowsConfig::default()).unwrap();
        let publisher = MemoryPublisher::new();
        let config = IcmpConfig {
            resolve_local_ips: false,
            ..Default::default()
        };
        let analyzer = IcmpAnalyzer::with_local_ips(&config, publisher.clone(), Vec::new());
        let processors = Processors {
            icmp4: Some(analyzer.clone()),
            ..Default::default()
        };
        let mut decoder = Decoder::new(1, Some(&flows), processors).unwrap();

        let request = ethernet(MAC_A, MAC_B, 0x0800, &ipv4(B, A, 1, &icmp(8, 0, 7, 1, b"ping")));
        let reply = ethernet(MAC_B, MAC_A, 0x0800, &ipv4(A, B, 1, &icmp(0, 0, 7, 1, b"ping")));
        decoder.on_packet(&request, request.len() as u32, ts(0));
        decoder.on_packet(&reply, reply.len() as u32, ts(1));

        assert_eq!(flows.table().len(), 1);
        let counts = flow_counts(&flows);
        assert_eq!(counts[0].1[0], ("packets".to_string(), Value::from(1u64)));
        assert_eq!(counts[0].2[0], ("packets".to_string(), Value::from(1u64)));

        let events = publisher.take();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].get("status"), Some(&Value::from("OK")));
        assert_eq!(analyzer.pending(), 0);
    }
}
