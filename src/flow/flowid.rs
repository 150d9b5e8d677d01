//! Canonical bidirectional flow identity
//!
//! A flow id is built layer by layer while a frame is decoded. Every layer
//! that carries an address pair writes the smaller address first, so both
//! directions of a session produce the same bytes. The direction flag
//! remembers whether the packet's own source went first.

use std::cmp::Ordering;
use std::net::{Ipv4Addr, Ipv6Addr};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};

use crate::error::{Error, Result};

/// Bitset of the layers that contributed to a flow id
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FlowIdFlags(u16);

impl FlowIdFlags {
    pub const ETH: Self = Self(1 << 0);
    pub const OUTER_VLAN: Self = Self(1 << 1);
    pub const VLAN: Self = Self(1 << 2);
    pub const OUTER_IPV4: Self = Self(1 << 3);
    pub const IPV4: Self = Self(1 << 4);
    pub const OUTER_IPV6: Self = Self(1 << 5);
    pub const IPV6: Self = Self(1 << 6);
    pub const ICMPV4: Self = Self(1 << 7);
    pub const ICMPV6: Self = Self(1 << 8);
    pub const UDP: Self = Self(1 << 9);
    pub const TCP: Self = Self(1 << 10);
    pub const CONNECTION_ID: Self = Self(1 << 11);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn bits(self) -> u16 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }
}

impl std::ops::BitOr for FlowIdFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Which endpoint of the packet was written first into canonical order
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum FlowDirection {
    #[default]
    Unset,
    /// Packet source went first
    Forward,
    /// Packet destination went first
    Reversed,
}

/// Key segments, in flag bit order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Segment {
    Eth,
    OuterVlan,
    Vlan,
    OuterIpv4,
    Ipv4,
    OuterIpv6,
    Ipv6,
    Icmpv4,
    Icmpv6,
    Udp,
    Tcp,
    ConnectionId,
}

pub const SEGMENT_COUNT: usize = 12;

pub const SEGMENTS: [Segment; SEGMENT_COUNT] = [
    Segment::Eth,
    Segment::OuterVlan,
    Segment::Vlan,
    Segment::OuterIpv4,
    Segment::Ipv4,
    Segment::OuterIpv6,
    Segment::Ipv6,
    Segment::Icmpv4,
    Segment::Icmpv6,
    Segment::Udp,
    Segment::Tcp,
    Segment::ConnectionId,
];

impl Segment {
    const fn index(self) -> usize {
        self as usize
    }

    pub const fn flag(self) -> FlowIdFlags {
        FlowIdFlags(1 << self as u16)
    }

    /// Bytes the segment occupies in the key
    pub const fn size(self) -> usize {
        match self {
            Segment::Eth => 12,
            Segment::OuterVlan | Segment::Vlan => 2,
            Segment::OuterIpv4 | Segment::Ipv4 => 8,
            Segment::OuterIpv6 | Segment::Ipv6 => 32,
            Segment::Icmpv4 | Segment::Icmpv6 => 2,
            Segment::Udp | Segment::Tcp => 4,
            Segment::ConnectionId => 8,
        }
    }
}

/// Largest key any combination of segments can produce
pub fn max_key_size() -> usize {
    SEGMENTS.iter().map(|s| s.size()).sum()
}

/// Segment offsets are stored as single bytes, so the whole layout has to
/// fit into 255 bytes.
pub fn validate_layout() -> Result<()> {
    let size = max_key_size();
    if size > u8::MAX as usize {
        return Err(Error::FlowKeyTooLarge { size });
    }
    Ok(())
}

type Offsets = [u8; SEGMENT_COUNT];

/// Read access shared by the per-packet builder and the stored key
pub trait FlowIdView {
    fn flags(&self) -> FlowIdFlags;
    fn direction(&self) -> FlowDirection;
    fn bytes(&self) -> &[u8];
    fn offsets(&self) -> &Offsets;

    fn segment(&self, seg: Segment) -> Option<&[u8]> {
        if !self.flags().contains(seg.flag()) {
            return None;
        }
        let off = self.offsets()[seg.index()] as usize;
        self.bytes().get(off..off + seg.size())
    }

    /// Address pair re-oriented to the order it was passed in
    fn pair<const N: usize>(&self, seg: Segment) -> Option<([u8; N], [u8; N])> {
        let raw = self.segment(seg)?;
        let (a, b) = raw.split_at(N);
        let a: [u8; N] = a.try_into().ok()?;
        let b: [u8; N] = b.try_into().ok()?;
        if self.direction() == FlowDirection::Reversed {
            Some((b, a))
        } else {
            Some((a, b))
        }
    }

    fn eth(&self) -> Option<([u8; 6], [u8; 6])> {
        self.pair::<6>(Segment::Eth)
    }

    fn outer_vlan(&self) -> Option<u16> {
        self.segment(Segment::OuterVlan).map(read_u16)
    }

    fn vlan(&self) -> Option<u16> {
        self.segment(Segment::Vlan).map(read_u16)
    }

    fn outer_ipv4(&self) -> Option<(Ipv4Addr, Ipv4Addr)> {
        self.pair::<4>(Segment::OuterIpv4)
            .map(|(a, b)| (Ipv4Addr::from(a), Ipv4Addr::from(b)))
    }

    fn ipv4(&self) -> Option<(Ipv4Addr, Ipv4Addr)> {
        self.pair::<4>(Segment::Ipv4)
            .map(|(a, b)| (Ipv4Addr::from(a), Ipv4Addr::from(b)))
    }

    fn outer_ipv6(&self) -> Option<(Ipv6Addr, Ipv6Addr)> {
        self.pair::<16>(Segment::OuterIpv6)
            .map(|(a, b)| (Ipv6Addr::from(a), Ipv6Addr::from(b)))
    }

    fn ipv6(&self) -> Option<(Ipv6Addr, Ipv6Addr)> {
        self.pair::<16>(Segment::Ipv6)
            .map(|(a, b)| (Ipv6Addr::from(a), Ipv6Addr::from(b)))
    }

    fn icmpv4_id(&self) -> Option<u16> {
        self.segment(Segment::Icmpv4).map(read_u16)
    }

    fn icmpv6_id(&self) -> Option<u16> {
        self.segment(Segment::Icmpv6).map(read_u16)
    }

    fn udp(&self) -> Option<(u16, u16)> {
        self.pair::<2>(Segment::Udp)
            .map(|(a, b)| (u16::from_be_bytes(a), u16::from_be_bytes(b)))
    }

    fn tcp(&self) -> Option<(u16, u16)> {
        self.pair::<2>(Segment::Tcp)
            .map(|(a, b)| (u16::from_be_bytes(a), u16::from_be_bytes(b)))
    }

    fn connection_id(&self) -> Option<u64> {
        let raw = self.segment(Segment::ConnectionId)?;
        let raw: [u8; 8] = raw.try_into().ok()?;
        Some(u64::from_be_bytes(raw))
    }

    /// Printable identifier: url-safe base64 of flags, offsets and key bytes
    fn encoded(&self) -> String {
        let mut raw = Vec::with_capacity(2 + SEGMENT_COUNT + self.bytes().len());
        raw.extend_from_slice(&self.flags().bits().to_le_bytes());
        raw.extend_from_slice(self.offsets());
        raw.extend_from_slice(self.bytes());
        URL_SAFE_NO_PAD.encode(raw)
    }
}

fn read_u16(raw: &[u8]) -> u16 {
    u16::from_be_bytes([raw[0], raw[1]])
}

/// Per-packet flow id builder
///
/// Owned by a decoder and reset before every frame. The backing buffer is
/// allocated once at `max_key_size()` and never grows past it.
#[derive(Debug, Clone)]
pub struct FlowIdBuilder {
    buf: Vec<u8>,
    offsets: Offsets,
    flags: FlowIdFlags,
    dir: FlowDirection,
}

impl Default for FlowIdBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl FlowIdBuilder {
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(max_key_size()),
            offsets: [0; SEGMENT_COUNT],
            flags: FlowIdFlags::empty(),
            dir: FlowDirection::Unset,
        }
    }

    /// Clear for the next packet, keeping the allocation
    pub fn reset(&mut self) {
        self.buf.clear();
        self.offsets = [0; SEGMENT_COUNT];
        self.flags = FlowIdFlags::empty();
        self.dir = FlowDirection::Unset;
    }

    pub fn add_eth(&mut self, src: [u8; 6], dst: [u8; 6]) {
        if self.flags.contains(FlowIdFlags::ETH) {
            return;
        }
        self.begin(Segment::Eth);
        self.push_pair(&src, &dst, FlowDirection::Unset);
    }

    pub fn add_vlan(&mut self, id: u16) {
        if self.begin_repeatable(Segment::Vlan, Segment::OuterVlan) {
            self.buf.extend_from_slice(&id.to_be_bytes());
        }
    }

    pub fn add_ipv4(&mut self, src: Ipv4Addr, dst: Ipv4Addr) {
        if self.begin_repeatable(Segment::Ipv4, Segment::OuterIpv4) {
            self.push_pair(&src.octets(), &dst.octets(), FlowDirection::Unset);
        }
    }

    pub fn add_ipv6(&mut self, src: Ipv6Addr, dst: Ipv6Addr) {
        if self.begin_repeatable(Segment::Ipv6, Segment::OuterIpv6) {
            self.push_pair(&src.octets(), &dst.octets(), FlowDirection::Unset);
        }
    }

    pub fn add_icmpv4_request(&mut self, id: u16) {
        self.add_icmp_id(Segment::Icmpv4, id, FlowDirection::Forward);
    }

    pub fn add_icmpv4_response(&mut self, id: u16) {
        self.add_icmp_id(Segment::Icmpv4, id, FlowDirection::Reversed);
    }

    pub fn add_icmpv6_request(&mut self, id: u16) {
        self.add_icmp_id(Segment::Icmpv6, id, FlowDirection::Forward);
    }

    pub fn add_icmpv6_response(&mut self, id: u16) {
        self.add_icmp_id(Segment::Icmpv6, id, FlowDirection::Reversed);
    }

    pub fn add_udp(&mut self, src: u16, dst: u16) {
        if self.flags.contains(FlowIdFlags::UDP) {
            return;
        }
        self.begin(Segment::Udp);
        self.push_pair(&src.to_be_bytes(), &dst.to_be_bytes(), FlowDirection::Unset);
    }

    pub fn add_tcp(&mut self, src: u16, dst: u16) {
        if self.flags.contains(FlowIdFlags::TCP) {
            return;
        }
        self.begin(Segment::Tcp);
        self.push_pair(&src.to_be_bytes(), &dst.to_be_bytes(), FlowDirection::Unset);
    }

    pub fn add_connection_id(&mut self, id: u64) {
        if self.flags.contains(FlowIdFlags::CONNECTION_ID) {
            return;
        }
        self.begin(Segment::ConnectionId);
        self.buf.extend_from_slice(&id.to_be_bytes());
    }

    /// Owned copy for storage in the flow table
    pub fn to_key(&self) -> FlowKey {
        FlowKey {
            bytes: self.buf.clone().into_boxed_slice(),
            offsets: self.offsets,
            flags: self.flags,
            dir: self.dir,
        }
    }

    fn begin(&mut self, seg: Segment) {
        self.offsets[seg.index()] = self.buf.len() as u8;
        self.flags.insert(seg.flag());
    }

    /// First occurrence is recorded as inner. A second occurrence turns the
    /// existing segment into the outer one and appends the new inner one, so
    /// outer bytes always precede inner bytes. Returns false when both slots
    /// are taken.
    fn begin_repeatable(&mut self, inner: Segment, outer: Segment) -> bool {
        if self.flags.contains(outer.flag()) {
            return false;
        }
        if self.flags.contains(inner.flag()) {
            self.offsets[outer.index()] = self.offsets[inner.index()];
            self.flags.insert(outer.flag());
        }
        self.begin(inner);
        true
    }

    fn add_icmp_id(&mut self, seg: Segment, id: u16, hint: FlowDirection) {
        if self.flags.contains(seg.flag()) {
            return;
        }
        if self.dir == FlowDirection::Unset {
            self.dir = hint;
        }
        self.begin(seg);
        self.buf.extend_from_slice(&id.to_be_bytes());
    }

    fn push_pair(&mut self, a: &[u8], b: &[u8], hint: FlowDirection) {
        let forward = match self.dir {
            FlowDirection::Forward => true,
            FlowDirection::Reversed => false,
            FlowDirection::Unset => match a.cmp(b) {
                Ordering::Less => {
                    self.dir = FlowDirection::Forward;
                    true
                }
                Ordering::Greater => {
                    self.dir = FlowDirection::Reversed;
                    false
                }
                Ordering::Equal => {
                    self.dir = hint;
                    true
                }
            },
        };

        if forward {
            self.buf.extend_from_slice(a);
            self.buf.extend_from_slice(b);
        } else {
            self.buf.extend_from_slice(b);
            self.buf.extend_from_slice(a);
        }
    }
}

impl FlowIdView for FlowIdBuilder {
    fn flags(&self) -> FlowIdFlags {
        self.flags
    }

    fn direction(&self) -> FlowDirection {
        self.dir
    }

    fn bytes(&self) -> &[u8] {
        &self.buf
    }

    fn offsets(&self) -> &Offsets {
        &self.offsets
    }
}

/// Immutable flow id stored with a flow
///
/// Keeps the direction of the packet that created the flow, so accessors
/// report the initiator as source.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FlowKey {
    bytes: Box<[u8]>,
    offsets: Offsets,
    flags: FlowIdFlags,
    dir: FlowDirection,
}

impl FlowIdView for FlowKey {
    fn flags(&self) -> FlowIdFlags {
        self.flags
    }

    fn direction(&self) -> FlowDirection {
        self.dir
    }

    fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    fn offsets(&self) -> &Offsets {
        &self.offsets
    }
}
