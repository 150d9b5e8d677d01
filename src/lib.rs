//! flowtap: flow and ICMP transaction tracking over captured frames
//!
//! Frames from a `CaptureSource` are decoded layer by layer, handed to the
//! TCP/UDP dispatchers or the ICMP analyzer, and counted against their
//! bidirectional flow. Flow reports and ICMP transactions come out as
//! `Event`s through a `Publisher`.

pub mod cache;
pub mod config;
pub mod core;
pub mod decoder;
pub mod error;
pub mod flow;
pub mod icmp;
pub mod protocols;
pub mod publish;
pub mod sniffer;
pub mod tcp;
pub mod udp;

pub use error::{Error, Result};

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info};

use config::Config;
use decoder::{Decoder, DecoderStats, Icmpv4Processor, Icmpv6Processor, Processors};
use flow::Flows;
use icmp::IcmpAnalyzer;
use protocols::ProtocolRegistry;
use publish::Publisher;
use sniffer::{CaptureSource, CaptureStats, Captured};
use tcp::TcpDispatcher;
use udp::UdpDispatcher;

const TCP_JANITOR_INTERVAL: Duration = Duration::from_secs(60);

/// Totals of one capture run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub decoder: DecoderStats,
    pub capture: CaptureStats,
}

/// Wires the decoder, flow tracking and ICMP analysis to a capture source
pub struct Sniffer {
    config: Config,
    registry: Arc<ProtocolRegistry>,
    publisher: Arc<dyn Publisher>,
    flows: Option<Flows>,
}

impl Sniffer {
    /// Fails on invalid flow settings or conflicting protocol ports
    pub fn new(
        config: Config,
        registry: ProtocolRegistry,
        publisher: Arc<dyn Publisher>,
    ) -> Result<Self> {
        let registry = Arc::new(registry);
        registry.tcp_port_map()?;
        registry.udp_port_map()?;

        let flows = if config.flows.enabled {
            Some(Flows::new(&config.flows)?)
        } else {
            info!("Flow tracking is disabled");
            None
        };

        Ok(Self {
            config,
            registry,
            publisher,
            flows,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn flows(&self) -> Option<&Flows> {
        self.flows.as_ref()
    }

    /// Read `source` until it is exhausted or `stop` turns true, then stop
    /// the background tasks and flush final flow reports.
    pub async fn run(
        &self,
        mut source: Box<dyn CaptureSource>,
        stop: watch::Receiver<bool>,
    ) -> Result<RunSummary> {
        let worker = match &self.flows {
            Some(flows) => Some(flows.start(Arc::clone(&self.publisher))?),
            None => None,
        };
        let icmp = if self.config.icmp.enabled {
            Some(IcmpAnalyzer::start(
                &self.config.icmp,
                Arc::clone(&self.publisher),
            ))
        } else {
            info!("ICMP analysis is disabled");
            None
        };

        let tcp = TcpDispatcher::new(Arc::clone(&self.registry))?;
        let tcp_janitor = tcp.start_janitor(TCP_JANITOR_INTERVAL);
        let udp = UdpDispatcher::new(Arc::clone(&self.registry))?;

        let processors = Processors {
            icmp4: icmp.clone().map(|a| a as Arc<dyn Icmpv4Processor>),
            icmp6: icmp.clone().map(|a| a as Arc<dyn Icmpv6Processor>),
            tcp: Some(Box::new(tcp)),
            udp: Some(Box::new(udp)),
        };
        let mut decoder = Decoder::new(source.link_type(), self.flows.as_ref(), processors)?;

        info!("Capture started");
        let capture = tokio::task::spawn_blocking(move || -> Result<RunSummary> {
            loop {
                if *stop.borrow() {
                    debug!("Capture stop requested");
                    break;
                }
                match source.next_frame()? {
                    Captured::Frame(frame) => {
                        decoder.on_packet(&frame.data, frame.orig_len, frame.ts)
                    }
                    Captured::Timeout => continue,
                    Captured::Eof => break,
                }
            }
            Ok(RunSummary {
                decoder: decoder.stats(),
                capture: source.stats(),
            })
        })
        .await
        .map_err(|e| Error::Capture(format!("capture task failed: {}", e)));

        tcp_janitor.stop().await;
        if let Some(icmp) = &icmp {
            icmp.stop().await;
        }
        if let Some(worker) = worker {
            worker.stop().await;
        }

        let summary = capture??;
        info!(
            "Capture finished: {} frames, {} dropped, {} counted against flows",
            summary.decoder.frames, summary.decoder.dropped, summary.decoder.flows_updated
        );
        Ok(summary)
    }
}
