//! Layer-by-layer frame decoding
//!
//! Each layer decoder reads its header from the front of the remaining
//! bytes, records what it found in `DecodedLayers`, feeds the flow id and
//! names the layer that follows. Header parsing goes through etherparse
//! slices; the framing etherparse has no slice type for (loopback, Linux
//! cooked capture, VLAN tags, IPv6 extension chains) is read by hand.

use std::fmt;
use std::net::IpAddr;
use std::ops::Range;

use etherparse::{
    Ethernet2HeaderSlice, Icmpv4Slice, Icmpv6Slice, IpNumber, Ipv4HeaderSlice, Ipv6HeaderSlice,
    TcpHeaderSlice, UdpHeaderSlice,
};
use thiserror::Error;

use crate::core::layers::{
    EthernetInfo, IcmpInfo, Ipv4Info, Ipv6Info, TcpInfo, UdpInfo, VlanInfo,
};
use crate::core::packet::TcpFlags;
use crate::error::{Error, Result};
use crate::flow::FlowIdBuilder;

const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_IPV6: u16 = 0x86dd;
const ETHERTYPE_VLAN: u16 = 0x8100;
const ETHERTYPE_QINQ: u16 = 0x88a8;

const NULL_HEADER_LEN: usize = 4;
const SLL_HEADER_LEN: usize = 16;
const VLAN_HEADER_LEN: usize = 4;
const UDP_HEADER_LEN: usize = 8;
const ICMP_HEADER_LEN: usize = 8;

const IP_IN_IP: u8 = 4;
const IPV6_IN_IP: u8 = 41;

const IPV6_HEADER_LEN: usize = 40;
const IPV6_HOP_BY_HOP: u8 = 0;
const IPV6_ROUTING: u8 = 43;
const IPV6_FRAGMENT: u8 = 44;
const IPV6_AUTH: u8 = 51;
const IPV6_NO_NEXT: u8 = 59;
const IPV6_DEST_OPTS: u8 = 60;

/// Data link type of a capture source (pcap DLT values)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkType {
    /// BSD loopback, address family in host byte order
    Null,
    Ethernet,
    /// Bare IPv4 or IPv6 packets
    Raw,
    /// OpenBSD loopback, address family in network byte order
    Loop,
    /// Linux cooked capture
    LinuxSll,
}

impl LinkType {
    pub fn from_dlt(dlt: u32) -> Result<Self> {
        match dlt {
            0 => Ok(LinkType::Null),
            1 => Ok(LinkType::Ethernet),
            12 | 14 | 101 => Ok(LinkType::Raw),
            108 => Ok(LinkType::Loop),
            113 => Ok(LinkType::LinuxSll),
            other => Err(Error::UnsupportedLinkType(other)),
        }
    }

    pub fn dlt(&self) -> u32 {
        match self {
            LinkType::Null => 0,
            LinkType::Ethernet => 1,
            LinkType::Raw => 101,
            LinkType::Loop => 108,
            LinkType::LinuxSll => 113,
        }
    }

    fn first_layer(&self) -> LayerKind {
        match self {
            LinkType::Null | LinkType::Loop => LayerKind::Loopback,
            LinkType::Ethernet => LayerKind::Ethernet,
            LinkType::Raw => LayerKind::RawIp,
            LinkType::LinuxSll => LayerKind::LinuxSll,
        }
    }
}

/// Layers the decode loop knows how to read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerKind {
    Loopback,
    LinuxSll,
    Ethernet,
    Vlan,
    RawIp,
    Ipv4,
    Ipv6,
    Tcp,
    Udp,
    Icmpv4,
    Icmpv6,
}

impl fmt::Display for LayerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LayerKind::Loopback => "loopback",
            LayerKind::LinuxSll => "linux_sll",
            LayerKind::Ethernet => "ethernet",
            LayerKind::Vlan => "vlan",
            LayerKind::RawIp => "raw_ip",
            LayerKind::Ipv4 => "ipv4",
            LayerKind::Ipv6 => "ipv6",
            LayerKind::Tcp => "tcp",
            LayerKind::Udp => "udp",
            LayerKind::Icmpv4 => "icmpv4",
            LayerKind::Icmpv6 => "icmpv6",
        };
        f.write_str(name)
    }
}

/// Per-frame decode failure; never leaves the decoder
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("malformed {layer} layer: {reason}")]
    Malformed { layer: LayerKind, reason: String },

    #[error("no decoder for {next} after {last}")]
    UnsupportedLayer { last: LayerKind, next: String },
}

impl DecodeError {
    fn malformed(layer: LayerKind, reason: impl fmt::Display) -> Self {
        DecodeError::Malformed {
            layer,
            reason: reason.to_string(),
        }
    }

    fn truncated(layer: LayerKind, need: usize, got: usize) -> Self {
        DecodeError::Malformed {
            layer,
            reason: format!("need {} bytes, got {}", need, got),
        }
    }
}

/// Decode targets reused across frames
#[derive(Debug, Clone, Default)]
pub struct DecodedLayers {
    pub ethernet: Option<EthernetInfo>,
    /// Innermost tag
    pub vlan: Option<VlanInfo>,
    pub vlan_count: usize,
    /// Innermost IPv4 header
    pub ipv4: Option<Ipv4Info>,
    /// Innermost IPv6 header
    pub ipv6: Option<Ipv6Info>,
    /// Addresses of the innermost IP layer of either family
    pub addrs: Option<(IpAddr, IpAddr)>,
    pub tcp: Option<TcpInfo>,
    pub udp: Option<UdpInfo>,
    pub icmpv4: Option<IcmpInfo>,
    pub icmpv6: Option<IcmpInfo>,
    /// Transport payload within the frame
    pub payload: Range<usize>,
}

impl DecodedLayers {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn payload<'a>(&self, frame: &'a [u8]) -> &'a [u8] {
        frame.get(self.payload.clone()).unwrap_or_default()
    }
}

enum Next {
    Layer(LayerKind),
    /// Rest of the window is payload
    Payload,
    /// Nothing worth reading follows (fragment, no-next-header)
    Done,
    Unsupported(String),
}

struct Step {
    header_len: usize,
    /// Upper bound of this layer's data, relative to its start
    bound: Option<usize>,
    next: Next,
}

impl Step {
    fn new(header_len: usize, next: Next) -> Self {
        Self {
            header_len,
            bound: None,
            next,
        }
    }

    fn bounded(mut self, bound: usize) -> Self {
        self.bound = Some(bound);
        self
    }
}

/// Decode `data` starting at the link layer
///
/// `layers` must be reset by the caller. On `UnsupportedLayer` the layers
/// decoded so far stay filled in. When the last decoded layer is UDP its
/// payload window is recorded as well, so port plugins still see the
/// datagram.
pub fn decode(
    link: LinkType,
    data: &[u8],
    layers: &mut DecodedLayers,
    mut flow_id: Option<&mut FlowIdBuilder>,
) -> std::result::Result<(), DecodeError> {
    let mut current = link.first_layer();
    let mut start = 0;
    let mut end = data.len();

    loop {
        let buf = &data[start..end];
        let id = flow_id.as_deref_mut();
        let step = match current {
            LayerKind::Loopback => decode_loopback(link, buf)?,
            LayerKind::LinuxSll => decode_sll(buf)?,
            LayerKind::Ethernet => decode_ethernet(buf, layers, id)?,
            LayerKind::Vlan => decode_vlan(buf, layers, id)?,
            LayerKind::RawIp => decode_raw_ip(buf)?,
            LayerKind::Ipv4 => decode_ipv4(buf, layers, id)?,
            LayerKind::Ipv6 => decode_ipv6(buf, layers, id)?,
            LayerKind::Tcp => decode_tcp(buf, layers, id)?,
            LayerKind::Udp => decode_udp(buf, layers, id)?,
            LayerKind::Icmpv4 => decode_icmp(buf, LayerKind::Icmpv4, layers)?,
            LayerKind::Icmpv6 => decode_icmp(buf, LayerKind::Icmpv6, layers)?,
        };

        if let Some(bound) = step.bound {
            end = start + bound.min(buf.len());
        }
        start = (start + step.header_len).min(end);

        match step.next {
            Next::Layer(next) => current = next,
            Next::Payload => {
                layers.payload = start..end;
                return Ok(());
            }
            Next::Done => return Ok(()),
            Next::Unsupported(next) => {
                if current == LayerKind::Udp {
                    layers.payload = start..end;
                }
                return Err(DecodeError::UnsupportedLayer {
                    last: current,
                    next,
                })
            }
        }
    }
}

fn ether_next(ether_type: u16) -> Next {
    match ether_type {
        ETHERTYPE_IPV4 => Next::Layer(LayerKind::Ipv4),
        ETHERTYPE_IPV6 => Next::Layer(LayerKind::Ipv6),
        ETHERTYPE_VLAN | ETHERTYPE_QINQ => Next::Layer(LayerKind::Vlan),
        other => Next::Unsupported(format!("ethertype 0x{:04x}", other)),
    }
}

fn ip_next(protocol: u8) -> Next {
    match IpNumber(protocol) {
        IpNumber::TCP => Next::Layer(LayerKind::Tcp),
        IpNumber::UDP => Next::Layer(LayerKind::Udp),
        IpNumber::ICMP => Next::Layer(LayerKind::Icmpv4),
        IpNumber::IPV6_ICMP => Next::Layer(LayerKind::Icmpv6),
        IpNumber(IP_IN_IP) => Next::Layer(LayerKind::Ipv4),
        IpNumber(IPV6_IN_IP) => Next::Layer(LayerKind::Ipv6),
        other => Next::Unsupported(format!("ip protocol {}", other.0)),
    }
}

/// Application layers addressed by well-known UDP ports
fn udp_next(src_port: u16, dst_port: u16) -> Next {
    fn known(port: u16) -> Option<&'static str> {
        match port {
            53 => Some("dns"),
            2152 => Some("gtp-u"),
            4789 => Some("vxlan"),
            6081 => Some("geneve"),
            6343 => Some("sflow"),
            _ => None,
        }
    }
    match known(dst_port).or_else(|| known(src_port)) {
        Some(name) => Next::Unsupported(name.to_string()),
        None => Next::Payload,
    }
}

fn decode_loopback(link: LinkType, buf: &[u8]) -> std::result::Result<Step, DecodeError> {
    let raw: [u8; NULL_HEADER_LEN] = buf
        .get(..NULL_HEADER_LEN)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| DecodeError::truncated(LayerKind::Loopback, NULL_HEADER_LEN, buf.len()))?;

    let family = match link {
        LinkType::Loop => u32::from_be_bytes(raw),
        _ => {
            // written by the capturing host, which may not be us
            let le = u32::from_le_bytes(raw);
            if le <= 0xff {
                le
            } else {
                u32::from_be_bytes(raw)
            }
        }
    };

    let next = match family {
        2 => Next::Layer(LayerKind::Ipv4),
        24 | 28 | 30 => Next::Layer(LayerKind::Ipv6),
        other => Next::Unsupported(format!("address family {}", other)),
    };
    Ok(Step::new(NULL_HEADER_LEN, next))
}

fn decode_sll(buf: &[u8]) -> std::result::Result<Step, DecodeError> {
    if buf.len() < SLL_HEADER_LEN {
        return Err(DecodeError::truncated(
            LayerKind::LinuxSll,
            SLL_HEADER_LEN,
            buf.len(),
        ));
    }
    let ether_type = u16::from_be_bytes([buf[14], buf[15]]);
    Ok(Step::new(SLL_HEADER_LEN, ether_next(ether_type)))
}

fn decode_ethernet(
    buf: &[u8],
    layers: &mut DecodedLayers,
    flow_id: Option<&mut FlowIdBuilder>,
) -> std::result::Result<Step, DecodeError> {
    let eth = Ethernet2HeaderSlice::from_slice(buf)
        .map_err(|e| DecodeError::malformed(LayerKind::Ethernet, e))?;
    let info = EthernetInfo {
        src_mac: eth.source(),
        dst_mac: eth.destination(),
        ether_type: eth.ether_type().0,
    };
    layers.ethernet = Some(info);
    if let Some(id) = flow_id {
        id.add_eth(info.src_mac, info.dst_mac);
    }
    Ok(Step::new(eth.slice().len(), ether_next(info.ether_type)))
}

fn decode_vlan(
    buf: &[u8],
    layers: &mut DecodedLayers,
    flow_id: Option<&mut FlowIdBuilder>,
) -> std::result::Result<Step, DecodeError> {
    if buf.len() < VLAN_HEADER_LEN {
        return Err(DecodeError::truncated(
            LayerKind::Vlan,
            VLAN_HEADER_LEN,
            buf.len(),
        ));
    }
    let info = VlanInfo {
        vlan_id: u16::from_be_bytes([buf[0], buf[1]]) & 0x0fff,
        ether_type: u16::from_be_bytes([buf[2], buf[3]]),
    };
    layers.vlan = Some(info);
    layers.vlan_count += 1;
    if let Some(id) = flow_id {
        id.add_vlan(info.vlan_id);
    }
    Ok(Step::new(VLAN_HEADER_LEN, ether_next(info.ether_type)))
}

fn decode_raw_ip(buf: &[u8]) -> std::result::Result<Step, DecodeError> {
    let first = buf
        .first()
        .ok_or_else(|| DecodeError::truncated(LayerKind::RawIp, 1, 0))?;
    let next = match first >> 4 {
        4 => Next::Layer(LayerKind::Ipv4),
        6 => Next::Layer(LayerKind::Ipv6),
        other => Next::Unsupported(format!("ip version {}", other)),
    };
    Ok(Step::new(0, next))
}

fn decode_ipv4(
    buf: &[u8],
    layers: &mut DecodedLayers,
    flow_id: Option<&mut FlowIdBuilder>,
) -> std::result::Result<Step, DecodeError> {
    let ip =
        Ipv4HeaderSlice::from_slice(buf).map_err(|e| DecodeError::malformed(LayerKind::Ipv4, e))?;

    let info = Ipv4Info {
        src_addr: ip.source_addr(),
        dst_addr: ip.destination_addr(),
        protocol: ip.protocol().0,
        ttl: ip.ttl(),
        more_fragments: ip.more_fragments(),
        fragment_offset: ip.fragments_offset().value(),
        header_length: ip.slice().len(),
        total_length: ip.total_len(),
    };
    layers.ipv4 = Some(info);
    layers.addrs = Some((IpAddr::V4(info.src_addr), IpAddr::V4(info.dst_addr)));
    if let Some(id) = flow_id {
        id.add_ipv4(info.src_addr, info.dst_addr);
    }

    let next = if info.is_fragmented() {
        Next::Done
    } else {
        ip_next(info.protocol)
    };
    // drops link-layer padding past the datagram
    Ok(Step::new(info.header_length, next).bounded(usize::from(info.total_length)))
}

fn decode_ipv6(
    buf: &[u8],
    layers: &mut DecodedLayers,
    flow_id: Option<&mut FlowIdBuilder>,
) -> std::result::Result<Step, DecodeError> {
    let ip =
        Ipv6HeaderSlice::from_slice(buf).map_err(|e| DecodeError::malformed(LayerKind::Ipv6, e))?;

    let mut next_header = ip.next_header().0;
    let mut header_length = IPV6_HEADER_LEN;
    let mut fragmented = false;
    loop {
        let ext_len = match next_header {
            IPV6_HOP_BY_HOP | IPV6_ROUTING | IPV6_DEST_OPTS => {
                let len = buf.get(header_length + 1).ok_or_else(|| {
                    DecodeError::truncated(LayerKind::Ipv6, header_length + 2, buf.len())
                })?;
                (usize::from(*len) + 1) * 8
            }
            IPV6_AUTH => {
                let len = buf.get(header_length + 1).ok_or_else(|| {
                    DecodeError::truncated(LayerKind::Ipv6, header_length + 2, buf.len())
                })?;
                (usize::from(*len) + 2) * 4
            }
            IPV6_FRAGMENT => {
                let raw = buf.get(header_length + 2..header_length + 4).ok_or_else(|| {
                    DecodeError::truncated(LayerKind::Ipv6, header_length + 8, buf.len())
                })?;
                let field = u16::from_be_bytes([raw[0], raw[1]]);
                fragmented = field >> 3 != 0 || field & 1 != 0;
                8
            }
            _ => break,
        };
        if buf.len() < header_length + ext_len {
            return Err(DecodeError::truncated(
                LayerKind::Ipv6,
                header_length + ext_len,
                buf.len(),
            ));
        }
        next_header = buf[header_length];
        header_length += ext_len;
    }

    let info = Ipv6Info {
        src_addr: ip.source_addr(),
        dst_addr: ip.destination_addr(),
        next_header,
        hop_limit: ip.hop_limit(),
        payload_length: ip.payload_length(),
        header_length,
        fragmented,
    };
    layers.ipv6 = Some(info);
    layers.addrs = Some((IpAddr::V6(info.src_addr), IpAddr::V6(info.dst_addr)));
    if let Some(id) = flow_id {
        id.add_ipv6(info.src_addr, info.dst_addr);
    }

    let next = if fragmented || next_header == IPV6_NO_NEXT {
        Next::Done
    } else {
        ip_next(next_header)
    };
    let step = Step::new(header_length, next);
    // zero payload length means a jumbogram
    if info.payload_length == 0 {
        Ok(step)
    } else {
        Ok(step.bounded(IPV6_HEADER_LEN + usize::from(info.payload_length)))
    }
}

fn decode_tcp(
    buf: &[u8],
    layers: &mut DecodedLayers,
    flow_id: Option<&mut FlowIdBuilder>,
) -> std::result::Result<Step, DecodeError> {
    let tcp = TcpHeaderSlice::from_slice(buf).map_err(|e| DecodeError::malformed(LayerKind::Tcp, e))?;
    let info = TcpInfo {
        src_port: tcp.source_port(),
        dst_port: tcp.destination_port(),
        seq: tcp.sequence_number(),
        ack: tcp.acknowledgment_number(),
        flags: TcpFlags {
            fin: tcp.fin(),
            syn: tcp.syn(),
            rst: tcp.rst(),
            psh: tcp.psh(),
            ack: tcp.ack(),
            urg: tcp.urg(),
            ece: tcp.ece(),
            cwr: tcp.cwr(),
        },
        window: tcp.window_size(),
        header_length: tcp.slice().len(),
    };
    layers.tcp = Some(info);
    if let Some(id) = flow_id {
        id.add_tcp(info.src_port, info.dst_port);
    }
    Ok(Step::new(info.header_length, Next::Payload))
}

fn decode_udp(
    buf: &[u8],
    layers: &mut DecodedLayers,
    flow_id: Option<&mut FlowIdBuilder>,
) -> std::result::Result<Step, DecodeError> {
    let udp = UdpHeaderSlice::from_slice(buf).map_err(|e| DecodeError::malformed(LayerKind::Udp, e))?;
    let info = UdpInfo {
        src_port: udp.source_port(),
        dst_port: udp.destination_port(),
        length: udp.length(),
    };
    layers.udp = Some(info);
    if let Some(id) = flow_id {
        id.add_udp(info.src_port, info.dst_port);
    }

    let step = Step::new(UDP_HEADER_LEN, udp_next(info.src_port, info.dst_port));
    let length = usize::from(info.length);
    if length >= UDP_HEADER_LEN {
        Ok(step.bounded(length))
    } else {
        Ok(step)
    }
}

fn decode_icmp(
    buf: &[u8],
    layer: LayerKind,
    layers: &mut DecodedLayers,
) -> std::result::Result<Step, DecodeError> {
    // the message runs to the end of the IP window
    if layer == LayerKind::Icmpv4 {
        Icmpv4Slice::from_slice(buf).map_err(|e| DecodeError::malformed(layer, e))?;
    } else {
        Icmpv6Slice::from_slice(buf).map_err(|e| DecodeError::malformed(layer, e))?;
    }
    let raw = buf;
    if raw.len() < ICMP_HEADER_LEN {
        return Err(DecodeError::truncated(layer, ICMP_HEADER_LEN, raw.len()));
    }

    let info = IcmpInfo {
        icmp_type: raw[0],
        code: raw[1],
        rest_of_header: [raw[4], raw[5], raw[6], raw[7]],
        length: raw.len(),
    };
    if layer == LayerKind::Icmpv4 {
        layers.icmpv4 = Some(info);
    } else {
        layers.icmpv6 = Some(info);
    }
    Ok(Step::new(ICMP_HEADER_LEN, Next::Payload))
}

#[cfg(test)]
pub(crate) mod frames {
    //! Hand-built frames shared by the decoder tests

    pub const MAC_A: [u8; 6] = [0x02, 0, 0, 0, 0, 0x0a];
    pub const MAC_B: [u8; 6] = [0x02, 0, 0, 0, 0, 0x0b];

    pub fn ethernet(src: [u8; 6], dst: [u8; 6], ether_type: u16, body: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(14 + body.len());
        out.extend_from_slice(&dst);
        out.extend_from_slice(&src);
        out.extend_from_slice(&ether_type.to_be_bytes());
        out.extend_from_slice(body);
        out
    }

    pub fn vlan(id: u16, ether_type: u16, body: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + body.len());
        out.extend_from_slice(&id.to_be_bytes());
        out.extend_from_slice(&ether_type.to_be_bytes());
        out.extend_from_slice(body);
        out
    }

    pub fn ipv4(src: [u8; 4], dst: [u8; 4], protocol: u8, body: &[u8]) -> Vec<u8> {
        ipv4_frag(src, dst, protocol, 0, body)
    }

    pub fn ipv4_frag(
        src: [u8; 4],
        dst: [u8; 4],
        protocol: u8,
        flags_offset: u16,
        body: &[u8],
    ) -> Vec<u8> {
        let total = (20 + body.len()) as u16;
        let mut out = vec![0x45, 0];
        out.extend_from_slice(&total.to_be_bytes());
        out.extend_from_slice(&[0, 1]);
        out.extend_from_slice(&flags_offset.to_be_bytes());
        out.extend_from_slice(&[64, protocol, 0, 0]);
        out.extend_from_slice(&src);
        out.extend_from_slice(&dst);
        out.extend_from_slice(body);
        out
    }

    pub fn ipv6(src: [u8; 16], dst: [u8; 16], next_header: u8, body: &[u8]) -> Vec<u8> {
        let mut out = vec![0x60, 0, 0, 0];
        out.extend_from_slice(&(body.len() as u16).to_be_bytes());
        out.extend_from_slice(&[next_header, 64]);
        out.extend_from_slice(&src);
        out.extend_from_slice(&dst);
        out.extend_from_slice(body);
        out
    }

    pub fn tcp(src_port: u16, dst_port: u16, seq: u32, flags: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(20 + payload.len());
        out.extend_from_slice(&src_port.to_be_bytes());
        out.extend_from_slice(&dst_port.to_be_bytes());
        out.extend_from_slice(&seq.to_be_bytes());
        out.extend_from_slice(&0u32.to_be_bytes());
        out.extend_from_slice(&[0x50, flags]);
        out.extend_from_slice(&1024u16.to_be_bytes());
        out.extend_from_slice(&[0, 0, 0, 0]);
        out.extend_from_slice(payload);
        out
    }

    pub fn udp(src_port: u16, dst_port: u16, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + payload.len());
        out.extend_from_slice(&src_port.to_be_bytes());
        out.extend_from_slice(&dst_port.to_be_bytes());
        out.extend_from_slice(&((8 + payload.len()) as u16).to_be_bytes());
        out.extend_from_slice(&[0, 0]);
        out.extend_from_slice(payload);
        out
    }

    pub fn icmp(icmp_type: u8, code: u8, id: u16, seq: u16, payload: &[u8]) -> Vec<u8> {
        let mut out = vec![icmp_type, code, 0, 0];
        out.extend_from_slice(&id.to_be_bytes());
        out.extend_from_slice(&seq.to_be_bytes());
        out.extend_from_slice(payload);
        out
    }
}
