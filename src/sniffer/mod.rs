//! Frame capture sources
//!
//! Supported sources:
//! - pcap file replay (`PcapFileSource`)
//! - live capture through libpcap (`LiveSource`, `live` feature)

mod file;
#[cfg(feature = "live")]
mod live;

pub use file::PcapFileSource;
#[cfg(feature = "live")]
pub use live::LiveSource;

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Capture configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Interface for live capture
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
    /// pcap file to replay; takes precedence over `interface`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
    /// Snapshot length
    pub snaplen: u32,
    /// Kernel buffer size in MiB
    pub buffer_size_mb: u32,
    /// Read timeout in milliseconds
    pub timeout_ms: u32,
    pub promiscuous: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            interface: None,
            file: None,
            snaplen: 65535,
            buffer_size_mb: 10,
            timeout_ms: 500,
            promiscuous: true,
        }
    }
}

/// One frame as read from the source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedFrame {
    pub data: Vec<u8>,
    pub ts: DateTime<Utc>,
    /// Length on the wire, before snaplen truncation
    pub orig_len: u32,
}

/// Result of a single read
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Captured {
    Frame(CapturedFrame),
    /// Read timeout passed without traffic
    Timeout,
    /// Source is exhausted
    Eof,
}

/// Capture statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureStats {
    /// Frames received
    pub received: u64,
    /// Frames dropped by the kernel
    pub dropped: u64,
    /// Interface drops
    pub if_dropped: u64,
}

/// Source of raw frames for one decoder
pub trait CaptureSource: Send {
    /// pcap DLT value of every frame this source yields
    fn link_type(&self) -> u32;

    fn next_frame(&mut self) -> Result<Captured>;

    fn stats(&mut self) -> CaptureStats;
}

/// Open the source named by `config`: the file when set, else the interface
pub fn open_source(config: &CaptureConfig) -> Result<Box<dyn CaptureSource>> {
    if let Some(path) = &config.file {
        return Ok(Box::new(PcapFileSource::open(path)?));
    }
    match &config.interface {
        Some(interface) => open_live(interface, config),
        None => Err(Error::Capture(
            "no capture file or interface configured".to_string(),
        )),
    }
}

#[cfg(feature = "live")]
fn open_live(interface: &str, config: &CaptureConfig) -> Result<Box<dyn CaptureSource>> {
    Ok(Box::new(LiveSource::open(interface, config)?))
}

#[cfg(not(feature = "live"))]
fn open_live(interface: &str, _config: &CaptureConfig) -> Result<Box<dyn CaptureSource>> {
    Err(Error::Capture(format!(
        "cannot capture on {}: built without the `live` feature",
        interface
    )))
}

fn timestamp(secs: i64, nanos: u32) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(secs, nanos)
        .ok_or_else(|| Error::Capture(format!("timestamp out of range: {}s", secs)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_config_default() {
        let config = CaptureConfig::default();
        assert_eq!(config.snaplen, 65535);
        assert_eq!(config.buffer_size_mb, 10);
        assert!(config.file.is_none());
    }

    #[test]
    fn test_open_source_requires_target() {
        let err = open_source(&CaptureConfig::default()).err().unwrap();
        assert!(err.to_string().contains("no capture file or interface"));
    }

    #[cfg(not(feature = "live"))]
    #[test]
    fn test_live_needs_feature() {
        let config = CaptureConfig {
            interface: Some("eth0".to_string()),
            ..Default::default()
        };
        let err = open_source(&config).err().unwrap();
        assert!(err.to_string().contains("live"));
    }

    #[test]
    fn test_timestamp() {
        let ts = timestamp(1_700_000_000, 500).unwrap();
        assert_eq!(ts.timestamp(), 1_700_000_000);
        assert_eq!(ts.timestamp_subsec_nanos(), 500);
        assert!(timestamp(i64::MAX, 0).is_err());
    }
}
