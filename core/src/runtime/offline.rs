use super::PacketProcessor;
use crate::protocols::packet::LinkType;

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use pcap::{Capture, Offline};

/// Replay of a capture file.
///
/// Reassembly age is measured on the packet clock: the elapsed time between a packet's capture
/// timestamp and the first packet's, so idle flushing behaves the same as during the live capture.
pub(crate) struct OfflineRuntime {
    cap: Capture<Offline>,
    link: LinkType,
    path: PathBuf,
}

impl OfflineRuntime {
    pub(crate) fn new(path: &Path, filter: &str) -> Result<Self> {
        let mut cap = Capture::from_file(path)
            .with_context(|| format!("Error opening pcap {}", path.display()))?;
        cap.filter(filter, true)
            .with_context(|| format!("Invalid capture filter {:?}", filter))?;
        let link = LinkType::from_dlt(cap.get_datalink().0)?;
        Ok(OfflineRuntime {
            cap,
            link,
            path: path.to_owned(),
        })
    }

    pub(crate) fn run(
        mut self,
        mut processor: PacketProcessor,
        flush_interval: Duration,
    ) -> Result<()> {
        log::info!(
            "Launched offline analysis. Processing pcap: {}",
            self.path.display()
        );

        let start = Instant::now();
        let mut first_ts = None;
        let mut next_flush = start + flush_interval;
        let mut nb_pkts = 0u64;
        let mut nb_bytes = 0u64;
        let result = loop {
            let packet = match self.cap.next_packet() {
                Ok(packet) => packet,
                Err(pcap::Error::NoMorePackets) => break Ok(()),
                Err(err) => break Err(err).context("Error reading pcap"),
            };
            let ts = timestamp(packet.header.ts.tv_sec as i64, packet.header.ts.tv_usec as i64);
            let first = *first_ts.get_or_insert(ts);
            let now = start + ts.saturating_sub(first);
            if now >= next_flush {
                processor.maintain(now);
                next_flush = now + flush_interval;
            }
            nb_pkts += 1;
            nb_bytes += packet.data.len() as u64;
            processor.process(self.link, packet.data, now);
        };

        processor.finish();
        log::info!("Processed: {} pkts, {} bytes", nb_pkts, nb_bytes);
        log::info!("Replay time: {:?}", start.elapsed());
        result
    }
}

/// Converts a capture timestamp to a duration since the epoch. Negative values clamp to zero.
fn timestamp(sec: i64, usec: i64) -> Duration {
    let secs = u64::try_from(sec).unwrap_or(0);
    let micros = u64::try_from(usec).unwrap_or(0);
    Duration::from_secs(secs) + Duration::from_micros(micros)
}
