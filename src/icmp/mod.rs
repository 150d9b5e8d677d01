//! ICMP request/response correlation
//!
//! Requests that expect an answer (echo, timestamp, information, address
//! mask) wait in a TTL cache for their response. Matched pairs, orphans,
//! duplicates and one-off messages are all published as `type=icmp`
//! events.

pub mod message;
pub mod transaction;
pub mod tuple;

pub use message::IcmpMessage;
pub use transaction::IcmpTransaction;
pub use tuple::{HashableIcmpTuple, IcmpTuple};

use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cache::{JanitorHandle, TtlCache};
use crate::core::layers::IcmpInfo;
use crate::core::packet::Packet;
use crate::decoder::{Icmpv4Processor, Icmpv6Processor};
use crate::flow::FlowIdBuilder;
use crate::publish::{Event, Publisher};

use transaction::{DUPLICATE_REQUEST, ORPHANED_REQUEST};

const CACHE_CAPACITY: usize = 10_000;

/// Configuration for the ICMP analyzer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IcmpConfig {
    pub enabled: bool,

    /// Add a readable `request` field to events
    pub send_request: bool,

    /// Add a readable `response` field to events
    pub send_response: bool,

    /// How long a request waits for its response
    #[serde(with = "crate::config::duration")]
    pub transaction_timeout: Duration,

    /// Look up interface addresses to classify traffic direction
    pub resolve_local_ips: bool,
}

impl Default for IcmpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            send_request: false,
            send_response: false,
            transaction_timeout: Duration::from_secs(10),
            resolve_local_ips: true,
        }
    }
}

/// Anomaly counters
#[derive(Debug, Default)]
pub struct IcmpStats {
    duplicate_requests: AtomicU64,
    unmatched_requests: AtomicU64,
    unmatched_responses: AtomicU64,
}

impl IcmpStats {
    pub fn duplicate_requests(&self) -> u64 {
        self.duplicate_requests.load(Ordering::Relaxed)
    }

    pub fn unmatched_requests(&self) -> u64 {
        self.unmatched_requests.load(Ordering::Relaxed)
    }

    pub fn unmatched_responses(&self) -> u64 {
        self.unmatched_responses.load(Ordering::Relaxed)
    }
}

/// Where a transaction's request came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrafficDirection {
    LocalOnly,
    FromInside,
    FromOutside,
}

impl TrafficDirection {
    fn as_str(self) -> &'static str {
        match self {
            TrafficDirection::LocalOnly => "internal",
            TrafficDirection::FromInside => "outbound",
            TrafficDirection::FromOutside => "inbound",
        }
    }
}

/// Interface addresses of this host; empty when none can be found
pub fn resolve_local_ips() -> Vec<IpAddr> {
    let ips: Vec<IpAddr> = pnet::datalink::interfaces()
        .into_iter()
        .flat_map(|iface| iface.ips)
        .map(|net| net.ip())
        .collect();
    if ips.is_empty() {
        warn!("No local addresses found, only loopback traffic counts as local");
    }
    ips
}

/// Publishes transactions; shared with the cache's expiry listener
struct Reporter {
    send_request: bool,
    send_response: bool,
    local_ips: Vec<IpAddr>,
    publisher: Arc<dyn Publisher>,
    stats: IcmpStats,
}

impl Reporter {
    fn is_local(&self, ip: IpAddr) -> bool {
        ip.is_loopback() || self.local_ips.contains(&ip)
    }

    fn direction(&self, tuple: &IcmpTuple) -> TrafficDirection {
        match (self.is_local(tuple.src_ip), self.is_local(tuple.dst_ip)) {
            (true, true) => TrafficDirection::LocalOnly,
            (true, false) => TrafficDirection::FromInside,
            _ => TrafficDirection::FromOutside,
        }
    }

    fn publish(&self, trans: IcmpTransaction) {
        debug!("Publishing ICMP transaction {}", trans.tuple);
        self.publisher.publish(self.event(&trans));
    }

    fn event(&self, trans: &IcmpTransaction) -> Event {
        let tuple = &trans.tuple;
        let version = tuple.version;
        let mut event = Event::new(trans.ts);

        event
            .put("type", "icmp")
            .put("event.dataset", "icmp")
            .put("status", if trans.has_error() { "Error" } else { "OK" })
            .put("icmp.version", version)
            .put("network.type", if version == 4 { "ipv4" } else { "ipv6" })
            .put("network.transport", if version == 4 { "icmp" } else { "ipv6-icmp" })
            .put("source.ip", tuple.src_ip.to_string())
            .put("destination.ip", tuple.dst_ip.to_string())
            .put("path", tuple.dst_ip.to_string())
            .put("event.start", trans.ts.to_rfc3339())
            .put("event.end", trans.end().to_rfc3339());

        if !trans.notes.is_empty() {
            event.put("notes", trans.notes.clone());
        }

        let direction = self.direction(tuple);
        event.put("network.direction", direction.as_str());

        let request_bytes = trans.request.map_or(0, |m| m.length as u64);
        let response_bytes = trans.response.map_or(0, |m| m.length as u64);
        let (bytes_in, bytes_out) = match direction {
            TrafficDirection::FromOutside => (request_bytes, response_bytes),
            TrafficDirection::FromInside | TrafficDirection::LocalOnly => {
                (response_bytes, request_bytes)
            }
        };
        event.put("bytes_in", bytes_in).put("bytes_out", bytes_out);

        if let Some(request) = &trans.request {
            event
                .put("source.bytes", request_bytes)
                .put("icmp.request.type", request.icmp_type)
                .put("icmp.request.code", request.code)
                .put("icmp.request.message", message::human_readable(version, request));
            if self.send_request {
                event.put("request", message::human_readable(version, request));
            }
        }
        if let Some(response) = &trans.response {
            event
                .put("destination.bytes", response_bytes)
                .put("icmp.response.type", response.icmp_type)
                .put("icmp.response.code", response.code)
                .put("icmp.response.message", message::human_readable(version, response));
            if self.send_response {
                event.put("response", message::human_readable(version, response));
            }
        }
        if let (Some(request), Some(response)) = (&trans.request, &trans.response) {
            if let Some(ns) = response.ts.signed_duration_since(request.ts).num_nanoseconds() {
                event.put("event.duration", ns);
            }
        }

        event
    }
}

/// ICMPv4 and ICMPv6 transaction tracker
pub struct IcmpAnalyzer {
    reporter: Arc<Reporter>,
    transactions: Arc<TtlCache<HashableIcmpTuple, IcmpTransaction>>,
    janitor: Mutex<Option<JanitorHandle>>,
}

impl IcmpAnalyzer {
    /// Analyzer without a janitor; expired requests are only reported when
    /// `cleanup` runs.
    pub fn new(config: &IcmpConfig, publisher: Arc<dyn Publisher>) -> Arc<Self> {
        let local_ips = if config.resolve_local_ips {
            resolve_local_ips()
        } else {
            Vec::new()
        };
        Self::with_local_ips(config, publisher, local_ips)
    }

    pub fn with_local_ips(
        config: &IcmpConfig,
        publisher: Arc<dyn Publisher>,
        local_ips: Vec<IpAddr>,
    ) -> Arc<Self> {
        debug!("ICMP local addresses: {:?}", local_ips);
        let reporter = Arc::new(Reporter {
            send_request: config.send_request,
            send_response: config.send_response,
            local_ips,
            publisher,
            stats: IcmpStats::default(),
        });

        let expired = Arc::clone(&reporter);
        let transactions = Arc::new(TtlCache::with_removal_listener(
            config.transaction_timeout,
            CACHE_CAPACITY,
            Box::new(move |_key, mut trans: IcmpTransaction| {
                trans.add_note(ORPHANED_REQUEST);
                expired.stats.unmatched_requests.fetch_add(1, Ordering::Relaxed);
                expired.publish(trans);
            }),
        ));

        Arc::new(Self {
            reporter,
            transactions,
            janitor: Mutex::new(None),
        })
    }

    /// `new` plus a janitor on the current tokio runtime
    pub fn start(config: &IcmpConfig, publisher: Arc<dyn Publisher>) -> Arc<Self> {
        let analyzer = Self::new(config, publisher);
        let interval = config.transaction_timeout.max(Duration::from_secs(1));
        *analyzer.janitor.lock() = Some(analyzer.transactions.start_janitor(interval));
        info!(
            "ICMP analyzer started (transaction timeout {:?})",
            config.transaction_timeout
        );
        analyzer
    }

    /// Stop the janitor, if one was started
    pub async fn stop(&self) {
        let janitor = self.janitor.lock().take();
        if let Some(janitor) = janitor {
            janitor.stop().await;
        }
    }

    pub fn stats(&self) -> &IcmpStats {
        &self.reporter.stats
    }

    /// Requests still waiting for a response
    pub fn pending(&self) -> usize {
        self.transactions.len()
    }

    /// Report requests whose timeout passed
    pub fn cleanup(&self) -> usize {
        self.transactions.cleanup(tokio::time::Instant::now())
    }

    fn process(
        &self,
        version: u8,
        flow_id: Option<&mut FlowIdBuilder>,
        icmp: &IcmpInfo,
        pkt: &Packet,
    ) {
        let (id, seq) = if message::has_id_and_seq(version, icmp.icmp_type) {
            (icmp.identifier(), icmp.sequence())
        } else {
            (0, 0)
        };
        let tuple = IcmpTuple {
            version,
            src_ip: pkt.tuple.src_ip,
            dst_ip: pkt.tuple.dst_ip,
            id,
            seq,
        };
        let msg = IcmpMessage {
            ts: pkt.ts,
            icmp_type: icmp.icmp_type,
            code: icmp.code,
            length: icmp.length,
        };

        let response = message::is_response(version, icmp.icmp_type);
        if let Some(flow_id) = flow_id {
            match (version, response) {
                (4, false) => flow_id.add_icmpv4_request(id),
                (4, true) => flow_id.add_icmpv4_response(id),
                (_, false) => flow_id.add_icmpv6_request(id),
                (_, true) => flow_id.add_icmpv6_response(id),
            }
        }

        if response {
            self.process_response(tuple, msg);
        } else {
            self.process_request(tuple, msg);
        }
    }

    pub fn process_request(&self, tuple: IcmpTuple, msg: IcmpMessage) {
        let key = tuple.hashable();
        if let Some(mut previous) = self.transactions.delete(&key) {
            previous.add_note(DUPLICATE_REQUEST);
            self.reporter
                .stats
                .duplicate_requests
                .fetch_add(1, Ordering::Relaxed);
            self.reporter.publish(previous);
        }

        let trans = IcmpTransaction::from_request(tuple, msg);
        if message::is_request(tuple.version, msg.icmp_type) {
            self.transactions.put(key, trans);
        } else {
            self.reporter.publish(trans);
        }
    }

    pub fn process_response(&self, tuple: IcmpTuple, msg: IcmpMessage) {
        let key = tuple.reverse().hashable();
        let trans = match self.transactions.delete(&key) {
            Some(mut trans) => {
                trans.response = Some(msg);
                trans
            }
            None => {
                self.reporter
                    .stats
                    .unmatched_responses
                    .fetch_add(1, Ordering::Relaxed);
                IcmpTransaction::orphaned_response(tuple, msg)
            }
        };
        self.reporter.publish(trans);
    }
}

impl Icmpv4Processor for IcmpAnalyzer {
    fn process_icmpv4(&self, flow_id: Option<&mut FlowIdBuilder>, icmp: &IcmpInfo, pkt: &Packet) {
        self.process(4, flow_id, icmp, pkt);
    }
}

impl Icmpv6Processor for IcmpAnalyzer {
    fn process_icmpv6(&self, flow_id: Option<&mut FlowIdBuilder>, icmp: &IcmpInfo, pkt: &Packet) {
        self.process(6, flow_id, icmp, pkt);
    }
}
