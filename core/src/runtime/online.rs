use super::PacketProcessor;
use crate::config::CaptureConfig;
use crate::protocols::packet::LinkType;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use crossbeam::channel::{tick, Receiver};
use pcap::{Active, Capture};

/// Live capture from a network interface.
pub(crate) struct OnlineRuntime {
    cap: Capture<Active>,
    link: LinkType,
    config: CaptureConfig,
    is_running: Arc<AtomicBool>,
}

impl OnlineRuntime {
    pub(crate) fn new(config: CaptureConfig) -> Result<Self> {
        let (cap, link) = open_live(&config)?;

        // Set up signal handler
        let is_running = Arc::new(AtomicBool::new(true));
        let r = Arc::clone(&is_running);
        ctrlc::set_handler(move || {
            r.store(false, Ordering::Relaxed);
        })
        .context("Error setting Ctrl-C handler")?;

        Ok(OnlineRuntime {
            cap,
            link,
            config,
            is_running,
        })
    }

    pub(crate) fn run(
        mut self,
        mut processor: PacketProcessor,
        flush_interval: Duration,
    ) -> Result<()> {
        log::info!(
            "Capturing on {} with filter {:?}",
            self.config.device,
            self.config.filter
        );
        let ticker = tick(flush_interval);
        let result = self.capture(&mut processor, &ticker);
        log::info!("Exiting capture loop...");
        processor.finish();
        result
    }

    fn capture(
        &mut self,
        processor: &mut PacketProcessor,
        ticker: &Receiver<Instant>,
    ) -> Result<()> {
        while self.is_running.load(Ordering::Relaxed) {
            if let Ok(now) = ticker.try_recv() {
                processor.maintain(now);
            }
            let err = match self.cap.next_packet() {
                Ok(packet) => {
                    processor.process(self.link, packet.data, Instant::now());
                    continue;
                }
                Err(pcap::Error::TimeoutExpired) => continue,
                Err(err) => err,
            };
            log::warn!("Error reading packet: {}. Reopening capture handle", err);
            std::thread::sleep(self.config.read_timeout());
            let (cap, link) = open_live(&self.config)?;
            self.cap = cap;
            self.link = link;
        }
        Ok(())
    }
}

/// Opens and filters a live capture handle. The read timeout bounds each blocking read so the
/// capture loop can observe maintenance ticks and shutdown.
fn open_live(config: &CaptureConfig) -> Result<(Capture<Active>, LinkType)> {
    let timeout_ms = i32::try_from(config.read_timeout().as_millis()).unwrap_or(i32::MAX);
    let mut cap = Capture::from_device(config.device.as_str())
        .with_context(|| format!("Unknown capture device {}", config.device))?
        .promisc(config.promisc)
        .snaplen(config.snaplen)
        .timeout(timeout_ms)
        .open()
        .with_context(|| format!("Failed to open capture handle on {}", config.device))?;
    cap.filter(&config.filter, true)
        .with_context(|| format!("Invalid capture filter {:?}", config.filter))?;
    let link = LinkType::from_dlt(cap.get_datalink().0)?;
    log::debug!("Opened {} with link type {:?}", config.device, link);
    Ok((cap, link))
}
