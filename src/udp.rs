//! UDP port dispatch

use std::sync::Arc;

use tracing::trace;

use crate::core::packet::Packet;
use crate::decoder::UdpProcessor;
use crate::error::Result;
use crate::flow::FlowIdBuilder;
use crate::protocols::{PortMap, Protocol, ProtocolRegistry};

/// Routes datagrams to the UDP plugin of the protocol owning the port
pub struct UdpDispatcher {
    registry: Arc<ProtocolRegistry>,
    ports: PortMap,
}

impl UdpDispatcher {
    pub fn new(registry: Arc<ProtocolRegistry>) -> Result<Self> {
        let ports = registry.udp_port_map()?;
        Ok(Self { registry, ports })
    }

    pub fn decide_protocol(&self, pkt: &Packet) -> Protocol {
        self.ports.decide(&pkt.tuple)
    }
}

impl UdpProcessor for UdpDispatcher {
    fn process(&mut self, _flow_id: Option<&mut FlowIdBuilder>, pkt: &Packet) {
        let protocol = self.decide_protocol(pkt);
        if protocol == Protocol::Unknown {
            trace!("unknown udp protocol for {}", pkt.tuple);
            return;
        }
        let Some(plugin) = self.registry.udp_plugin(protocol) else {
            trace!("no udp plugin loaded for {}", protocol);
            return;
        };
        if pkt.payload.is_empty() {
            return;
        }
        plugin.parse_udp(pkt);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::packet::IpPortTuple;
    use crate::protocols::{ProtocolRegistration, UdpPlugin};
    use chrono::Utc;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(u16, u16, usize)>>,
    }

    impl UdpPlugin for Recorder {
        fn parse_udp(&self, pkt: &Packet) {
            self.seen
                .lock()
                .push((pkt.tuple.src_port, pkt.tuple.dst_port, pkt.payload.len()));
        }
    }

    fn packet(src_port: u16, dst_port: u16, payload: &[u8]) -> Packet {
        Packet::new(
            Utc::now(),
            IpPortTuple::new(
                "10.0.0.1".parse().unwrap(),
                src_port,
                "10.0.0.2".parse().unwrap(),
                dst_port,
            ),
            payload.to_vec(),
        )
    }

    fn dispatcher() -> (UdpDispatcher, Arc<Recorder>) {
        let dns = Arc::new(Recorder::default());
        let mut registry = ProtocolRegistry::new();
        registry.register(ProtocolRegistration::udp(Protocol::Dns, &[53], dns.clone()));
        registry.register(ProtocolRegistration::ports_only(Protocol::Sip, &[5060]));
        (UdpDispatcher::new(Arc::new(registry)).unwrap(), dns)
    }

    #[test]
    fn test_dispatch_by_either_port() {
        let (mut udp, dns) = dispatcher();
        udp.process(None, &packet(40000, 53, b"query"));
        udp.process(None, &packet(53, 40000, b"answer!"));
        assert_eq!(*dns.seen.lock(), vec![(40000, 53, 5), (53, 40000, 7)]);
    }

    #[test]
    fn test_noop_cases() {
        let (mut udp, dns) = dispatcher();
        // unknown port
        udp.process(None, &packet(40000, 40001, b"x"));
        // port claimed but plugin not loaded
        udp.process(None, &packet(40000, 5060, b"INVITE"));
        // empty payload
        udp.process(None, &packet(40000, 53, b""));
        assert!(dns.seen.lock().is_empty());
        assert_eq!(udp.decide_protocol(&packet(40000, 5060, b"")), Protocol::Sip);
    }

    #[test]
    fn test_new_rejects_conflicting_ports() {
        let mut registry = ProtocolRegistry::new();
        registry.register(ProtocolRegistration::ports_only(Protocol::Dns, &[53]));
        registry.register(ProtocolRegistration::ports_only(Protocol::Mysql, &[53]));
        assert!(UdpDispatcher::new(Arc::new(registry)).is_err());
    }
}
