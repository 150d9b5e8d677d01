//! Live capture through libpcap

use pcap::{Active, Capture};
use tracing::info;

use super::{timestamp, CaptureConfig, CaptureSource, CaptureStats, Captured, CapturedFrame};
use crate::error::{Error, Result};

pub struct LiveSource {
    cap: Capture<Active>,
    link_type: u32,
    received: u64,
}

impl LiveSource {
    pub fn open(interface: &str, config: &CaptureConfig) -> Result<Self> {
        let buffer_size = config.buffer_size_mb.saturating_mul(1024 * 1024);
        let cap = Capture::from_device(interface)
            .map_err(|e| Error::Capture(e.to_string()))?
            .promisc(config.promiscuous)
            .snaplen(config.snaplen as i32)
            .timeout(config.timeout_ms as i32)
            .buffer_size(buffer_size as i32)
            .open()
            .map_err(|e| Error::Capture(format!("cannot open {}: {}", interface, e)))?;
        let link_type = cap.get_datalink().0 as u32;
        info!("Capturing on {} (link type {})", interface, link_type);

        Ok(Self {
            cap,
            link_type,
            received: 0,
        })
    }
}

impl CaptureSource for LiveSource {
    fn link_type(&self) -> u32 {
        self.link_type
    }

    fn next_frame(&mut self) -> Result<Captured> {
        match self.cap.next_packet() {
            Ok(packet) => {
                let ts = timestamp(
                    packet.header.ts.tv_sec as i64,
                    (packet.header.ts.tv_usec as u32).saturating_mul(1000),
                )?;
                self.received += 1;
                Ok(Captured::Frame(CapturedFrame {
                    data: packet.data.to_vec(),
                    ts,
                    orig_len: packet.header.len,
                }))
            }
            Err(pcap::Error::TimeoutExpired) => Ok(Captured::Timeout),
            Err(pcap::Error::NoMorePackets) => Ok(Captured::Eof),
            Err(e) => Err(Error::Capture(e.to_string())),
        }
    }

    fn stats(&mut self) -> CaptureStats {
        match self.cap.stats() {
            Ok(stat) => CaptureStats {
                received: self.received,
                dropped: u64::from(stat.dropped),
                if_dropped: u64::from(stat.if_dropped),
            },
            Err(_) => CaptureStats {
                received: self.received,
                ..Default::default()
            },
        }
    }
}
