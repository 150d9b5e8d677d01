//! pcap and pcapng file replay

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use pcap_file::pcap::PcapReader;
use pcap_file::pcapng::{Block, PcapNgReader};
use tracing::{debug, info};

use super::{timestamp, CaptureSource, CaptureStats, Captured, CapturedFrame};
use crate::error::{Error, Result};

/// Section header block type, first four bytes of every pcapng file
const PCAPNG_MAGIC: [u8; 4] = [0x0a, 0x0d, 0x0d, 0x0a];

enum Reader<R: BufRead> {
    Pcap(PcapReader<R>),
    PcapNg {
        reader: PcapNgReader<R>,
        /// Link type of each interface, by interface id
        link_types: Vec<u32>,
    },
}

/// Replays frames from a pcap or pcapng file
pub struct PcapFileSource<R: BufRead = BufReader<File>> {
    reader: Reader<R>,
    link_type: u32,
    stats: CaptureStats,
}

impl PcapFileSource {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path.as_ref()).map_err(|e| {
            Error::Capture(format!("cannot open {}: {}", path.as_ref().display(), e))
        })?;
        let source = Self::from_reader(BufReader::new(file))?;
        info!(
            "Replaying {} (link type {})",
            path.as_ref().display(),
            source.link_type
        );
        Ok(source)
    }
}

impl<R: BufRead> PcapFileSource<R> {
    /// The format is picked from the magic number
    pub fn from_reader(mut reader: R) -> Result<Self> {
        let is_pcapng = reader.fill_buf()?.starts_with(&PCAPNG_MAGIC);
        if is_pcapng {
            Self::from_pcapng(reader)
        } else {
            let reader = PcapReader::new(reader)
                .map_err(|e| Error::Capture(format!("invalid pcap header: {}", e)))?;
            let link_type = u32::from(reader.header().datalink);
            Ok(Self {
                reader: Reader::Pcap(reader),
                link_type,
                stats: CaptureStats::default(),
            })
        }
    }

    // the link type is only known once the first interface is described
    fn from_pcapng(reader: R) -> Result<Self> {
        let mut reader = PcapNgReader::new(reader)
            .map_err(|e| Error::Capture(format!("invalid pcapng header: {}", e)))?;
        let link_type = loop {
            match reader.next_block() {
                Some(Ok(Block::InterfaceDescription(idb))) => break u32::from(idb.linktype),
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    return Err(Error::Capture(format!("invalid pcapng block: {}", e)))
                }
                None => {
                    return Err(Error::Capture(
                        "pcapng file has no interface description".to_string(),
                    ))
                }
            }
        };
        Ok(Self {
            reader: Reader::PcapNg {
                reader,
                link_types: vec![link_type],
            },
            link_type,
            stats: CaptureStats::default(),
        })
    }
}

impl<R: BufRead + Send> CaptureSource for PcapFileSource<R> {
    fn link_type(&self) -> u32 {
        self.link_type
    }

    fn next_frame(&mut self) -> Result<Captured> {
        let frame = match &mut self.reader {
            Reader::Pcap(reader) => {
                let Some(packet) = reader.next_packet() else {
                    return Ok(Captured::Eof);
                };
                let packet =
                    packet.map_err(|e| Error::Capture(format!("invalid pcap record: {}", e)))?;
                CapturedFrame {
                    ts: timestamp(
                        packet.timestamp.as_secs() as i64,
                        packet.timestamp.subsec_nanos(),
                    )?,
                    orig_len: packet.orig_len,
                    data: packet.data.into_owned(),
                }
            }
            Reader::PcapNg { reader, link_types } => {
                match next_pcapng_frame(reader, link_types, self.link_type)? {
                    Some(frame) => frame,
                    None => return Ok(Captured::Eof),
                }
            }
        };
        self.stats.received += 1;
        Ok(Captured::Frame(frame))
    }

    fn stats(&mut self) -> CaptureStats {
        self.stats
    }
}

/// Next packet block on an interface of link type `link_type`
fn next_pcapng_frame<R: BufRead>(
    reader: &mut PcapNgReader<R>,
    link_types: &mut Vec<u32>,
    link_type: u32,
) -> Result<Option<CapturedFrame>> {
    loop {
        let Some(block) = reader.next_block() else {
            return Ok(None);
        };
        let block = block.map_err(|e| Error::Capture(format!("invalid pcapng block: {}", e)))?;
        let (interface, frame) = match block {
            Block::InterfaceDescription(idb) => {
                link_types.push(u32::from(idb.linktype));
                continue;
            }
            Block::EnhancedPacket(epb) => {
                let frame = CapturedFrame {
                    ts: timestamp(
                        epb.timestamp.as_secs() as i64,
                        epb.timestamp.subsec_nanos(),
                    )?,
                    orig_len: epb.original_len,
                    data: epb.data.into_owned(),
                };
                (epb.interface_id as usize, frame)
            }
            // no timestamp; carried on the first interface
            Block::SimplePacket(spb) => {
                let frame = CapturedFrame {
                    ts: timestamp(0, 0)?,
                    orig_len: spb.original_len,
                    data: spb.data.into_owned(),
                };
                (0, frame)
            }
            _ => continue,
        };

        if link_types.get(interface) == Some(&link_type) {
            return Ok(Some(frame));
        }
        debug!("Skipping packet on interface {} with another link type", interface);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pcap_file::pcap::{PcapPacket, PcapWriter};
    use pcap_file::pcapng::blocks::enhanced_packet::EnhancedPacketBlock;
    use pcap_file::pcapng::blocks::interface_description::InterfaceDescriptionBlock;
    use pcap_file::pcapng::PcapNgWriter;
    use pcap_file::DataLink;
    use std::borrow::Cow;
    use std::time::Duration;
    use tempfile::TempDir;

    fn write_pcap(path: &Path, frames: &[(u64, &[u8])]) {
        let file = File::create(path).unwrap();
        let mut writer = PcapWriter::new(file).unwrap();
        for (secs, data) in frames {
            let packet = PcapPacket::new(Duration::from_secs(*secs), data.len() as u32, data);
            writer.write_packet(&packet).unwrap();
        }
    }

    fn interface(linktype: DataLink) -> Block<'static> {
        Block::InterfaceDescription(InterfaceDescriptionBlock {
            linktype,
            snaplen: 0,
            options: vec![],
        })
    }

    fn packet(interface_id: u32, secs: u64, data: &[u8], original_len: u32) -> Block<'_> {
        Block::EnhancedPacket(EnhancedPacketBlock {
            interface_id,
            timestamp: Duration::from_secs(secs),
            original_len,
            data: Cow::Borrowed(data),
            options: vec![],
        })
    }

    #[test]
    fn test_replay_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("two.pcap");
        write_pcap(
            &path,
            &[(1_700_000_000, &b"first"[..]), (1_700_000_001, &b"second"[..])],
        );

        let mut source = PcapFileSource::open(&path).unwrap();
        // writer default is ethernet
        assert_eq!(source.link_type(), 1);

        let Captured::Frame(first) = source.next_frame().unwrap() else {
            panic!("expected a frame");
        };
        assert_eq!(first.data, b"first");
        assert_eq!(first.orig_len, 5);
        assert_eq!(first.ts.timestamp(), 1_700_000_000);

        assert!(matches!(source.next_frame().unwrap(), Captured::Frame(_)));
        assert_eq!(source.next_frame().unwrap(), Captured::Eof);
        assert_eq!(source.stats().received, 2);
    }

    #[test]
    fn test_replay_pcapng() {
        let mut writer = PcapNgWriter::new(Vec::new()).unwrap();
        writer.write_block(&interface(DataLink::ETHERNET)).unwrap();
        writer.write_block(&packet(0, 1_700_000_000, b"first", 60)).unwrap();
        // second interface with another link type is skipped
        writer.write_block(&interface(DataLink::RAW)).unwrap();
        writer.write_block(&packet(1, 1_700_000_001, b"raw", 3)).unwrap();
        writer.write_block(&packet(0, 1_700_000_002, b"second", 6)).unwrap();
        let bytes = writer.into_inner();

        let mut source = PcapFileSource::from_reader(&bytes[..]).unwrap();
        assert_eq!(source.link_type(), 1);

        let Captured::Frame(first) = source.next_frame().unwrap() else {
            panic!("expected a frame");
        };
        assert_eq!(first.data, b"first");
        assert_eq!(first.orig_len, 60);
        assert_eq!(first.ts.timestamp(), 1_700_000_000);

        let Captured::Frame(second) = source.next_frame().unwrap() else {
            panic!("expected a frame");
        };
        assert_eq!(second.data, b"second");
        assert_eq!(source.next_frame().unwrap(), Captured::Eof);
        assert_eq!(source.stats().received, 2);
    }

    #[test]
    fn test_rejects_non_pcap() {
        let err = PcapFileSource::from_reader(&b"definitely not a pcap file"[..])
            .err()
            .unwrap();
        assert!(err.to_string().contains("invalid pcap header"));

        assert!(PcapFileSource::open("/nonexistent/flowtap.pcap").is_err());
    }
}
