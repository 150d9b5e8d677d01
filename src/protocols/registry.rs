//! Protocol registry and port lookup
//!
//! Each protocol registers the ports it claims plus optional TCP/UDP
//! plugins. A protocol may claim ports without a loaded plugin; traffic on
//! those ports is then recognized but not parsed.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use super::traits::{TcpPlugin, UdpPlugin};
use super::Protocol;
use crate::config::Config;
use crate::core::packet::IpPortTuple;
use crate::error::{Error, Result};

/// Protocol registration entry
pub struct ProtocolRegistration {
    pub protocol: Protocol,

    /// Ports claimed on TCP
    pub tcp_ports: Vec<u16>,

    /// Ports claimed on UDP
    pub udp_ports: Vec<u16>,

    pub tcp: Option<Arc<dyn TcpPlugin>>,

    pub udp: Option<Arc<dyn UdpPlugin>>,
}

impl ProtocolRegistration {
    /// Claim `ports` on both transports without a plugin
    pub fn ports_only(protocol: Protocol, ports: &[u16]) -> Self {
        Self {
            protocol,
            tcp_ports: ports.to_vec(),
            udp_ports: ports.to_vec(),
            tcp: None,
            udp: None,
        }
    }

    pub fn tcp(protocol: Protocol, ports: &[u16], plugin: Arc<dyn TcpPlugin>) -> Self {
        Self {
            protocol,
            tcp_ports: ports.to_vec(),
            udp_ports: Vec::new(),
            tcp: Some(plugin),
            udp: None,
        }
    }

    pub fn udp(protocol: Protocol, ports: &[u16], plugin: Arc<dyn UdpPlugin>) -> Self {
        Self {
            protocol,
            tcp_ports: Vec::new(),
            udp_ports: ports.to_vec(),
            tcp: None,
            udp: Some(plugin),
        }
    }
}

/// Registered protocols in registration order
#[derive(Default)]
pub struct ProtocolRegistry {
    protocols: Vec<ProtocolRegistration>,
    by_protocol: HashMap<Protocol, usize>,
}

impl ProtocolRegistry {
    /// Create new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Port claims from the `[protocols]` config section, no plugins
    pub fn from_config(config: &Config) -> Self {
        let mut registry = Self::new();
        for (protocol, ports) in config.enabled_protocols() {
            registry.register(ProtocolRegistration::ports_only(protocol, ports));
        }
        registry
    }

    /// Register a protocol, replacing an earlier registration of the same
    /// protocol
    pub fn register(&mut self, reg: ProtocolRegistration) {
        debug!(
            "Registering {} (tcp ports {:?}, udp ports {:?})",
            reg.protocol, reg.tcp_ports, reg.udp_ports
        );
        match self.by_protocol.get(&reg.protocol) {
            Some(&idx) => self.protocols[idx] = reg,
            None => {
                self.by_protocol.insert(reg.protocol, self.protocols.len());
                self.protocols.push(reg);
            }
        }
    }

    pub fn get(&self, protocol: Protocol) -> Option<&ProtocolRegistration> {
        self.by_protocol.get(&protocol).map(|&idx| &self.protocols[idx])
    }

    pub fn tcp_plugin(&self, protocol: Protocol) -> Option<&Arc<dyn TcpPlugin>> {
        self.get(protocol).and_then(|reg| reg.tcp.as_ref())
    }

    pub fn udp_plugin(&self, protocol: Protocol) -> Option<&Arc<dyn UdpPlugin>> {
        self.get(protocol).and_then(|reg| reg.udp.as_ref())
    }

    pub fn tcp_port_map(&self) -> Result<PortMap> {
        PortMap::build(
            self.protocols
                .iter()
                .map(|reg| (reg.protocol, reg.tcp_ports.as_slice())),
        )
    }

    pub fn udp_port_map(&self) -> Result<PortMap> {
        PortMap::build(
            self.protocols
                .iter()
                .map(|reg| (reg.protocol, reg.udp_ports.as_slice())),
        )
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProtocolRegistration> {
        self.protocols.iter()
    }

    pub fn len(&self) -> usize {
        self.protocols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.protocols.is_empty()
    }
}

/// Port to protocol lookup for one transport
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortMap {
    ports: HashMap<u16, Protocol>,
}

impl PortMap {
    /// Fails when two different protocols claim the same port
    pub fn build<'a, I>(claims: I) -> Result<Self>
    where
        I: IntoIterator<Item = (Protocol, &'a [u16])>,
    {
        let mut ports = HashMap::new();
        for (protocol, claimed) in claims {
            for &port in claimed {
                match ports.get(&port) {
                    Some(&existing) if existing != protocol => {
                        return Err(Error::DuplicatePort {
                            port,
                            existing,
                            new: protocol,
                        });
                    }
                    Some(_) => {}
                    None => {
                        ports.insert(port, protocol);
                    }
                }
            }
        }
        Ok(Self { ports })
    }

    pub fn get(&self, port: u16) -> Protocol {
        self.ports.get(&port).copied().unwrap_or(Protocol::Unknown)
    }

    /// Source port wins over destination port
    pub fn decide(&self, tuple: &IpPortTuple) -> Protocol {
        match self.get(tuple.src_port) {
            Protocol::Unknown => self.get(tuple.dst_port),
            protocol => protocol,
        }
    }

    pub fn len(&self) -> usize {
        self.ports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::packet::Packet;

    struct NullUdp;

    impl UdpPlugin for NullUdp {
        fn parse_udp(&self, _pkt: &Packet) {}
    }

    fn tuple(src_port: u16, dst_port: u16) -> IpPortTuple {
        IpPortTuple::new(
            "10.0.0.1".parse().unwrap(),
            src_port,
            "10.0.0.2".parse().unwrap(),
            dst_port,
        )
    }

    #[test]
    fn test_duplicate_port_names_both_protocols() {
        let err = PortMap::build([
            (Protocol::Http, &[80u16, 8080][..]),
            (Protocol::Thrift, &[9090u16, 80][..]),
        ])
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "duplicate port (80) exists in http and thrift protocols"
        );
    }

    #[test]
    fn test_same_protocol_repeat_is_fine() {
        let map = PortMap::build([(Protocol::Dns, &[53u16, 53, 5353][..])]).unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map.get(53), Protocol::Dns);
        assert_eq!(map.get(54), Protocol::Unknown);
    }

    #[test]
    fn test_decide_prefers_source_port() {
        let map = PortMap::build([
            (Protocol::Dns, &[53u16][..]),
            (Protocol::Http, &[80u16][..]),
        ])
        .unwrap();
        assert_eq!(map.decide(&tuple(53, 80)), Protocol::Dns);
        assert_eq!(map.decide(&tuple(40000, 80)), Protocol::Http);
        assert_eq!(map.decide(&tuple(40000, 40001)), Protocol::Unknown);
    }

    #[test]
    fn test_registry_plugins_and_maps() {
        let mut registry = ProtocolRegistry::new();
        registry.register(ProtocolRegistration::ports_only(Protocol::Http, &[80]));
        registry.register(ProtocolRegistration::udp(Protocol::Dns, &[53], Arc::new(NullUdp)));

        assert_eq!(registry.len(), 2);
        assert!(registry.udp_plugin(Protocol::Dns).is_some());
        assert!(registry.udp_plugin(Protocol::Http).is_none());
        assert!(registry.tcp_plugin(Protocol::Dns).is_none());

        let udp = registry.udp_port_map().unwrap();
        assert_eq!(udp.get(53), Protocol::Dns);
        assert_eq!(udp.get(80), Protocol::Http);
        let tcp = registry.tcp_port_map().unwrap();
        assert_eq!(tcp.get(53), Protocol::Unknown);

        // re-registering replaces the entry
        registry.register(ProtocolRegistration::ports_only(Protocol::Dns, &[5353]));
        assert_eq!(registry.len(), 2);
        assert!(registry.udp_plugin(Protocol::Dns).is_none());
    }

    #[test]
    fn test_from_config() {
        let config: Config =
            toml::from_str("[protocols.http]\nports = [80]\n[protocols.dns]\nports = [53]\n")
                .unwrap();
        let registry = ProtocolRegistry::from_config(&config);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.tcp_port_map().unwrap().get(80), Protocol::Http);
    }
}
