//! Sensor runtime.
//!
//! The runtime opens the capture handle, starts service discovery, runs the serial capture loop
//! on a dedicated thread and the transaction consumer on the tokio runtime, and reports
//! statistics at exit.

mod offline;
mod online;
use self::offline::*;
use self::online::*;

use crate::config::RuntimeConfig;
use crate::conntrack::pdu::L4Pdu;
use crate::conntrack::reassembly::Assembler;
use crate::conntrack::{FlowTable, SessionContext};
use crate::protocols::packet::LinkType;
use crate::protocols::stream::http::{HttpDecoder, MessageDecoder};
use crate::services::{KubernetesProvider, ServiceIpCache};
use crate::stats::SensorStats;
use crate::subscription::{ContentFilter, Subscription, TransactionSink};

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::runtime::Handle;
use tokio::sync::mpsc;

/// The sensor runtime.
pub struct Runtime<S>
where
    S: TransactionSink + 'static,
{
    config: RuntimeConfig,
    sink: S,
    decoder: Arc<dyn MessageDecoder>,
    stats: Arc<SensorStats>,
}

impl<S> Runtime<S>
where
    S: TransactionSink + 'static,
{
    /// Creates a new runtime from the `config` settings, forwarding transactions to `sink`.
    ///
    /// # Example
    ///
    /// ```no_run
    /// # async fn run() -> anyhow::Result<()> {
    /// use reqtap_core::config::default_config;
    /// use reqtap_core::subscription::JsonlSink;
    /// use reqtap_core::Runtime;
    ///
    /// let runtime = Runtime::new(default_config(), JsonlSink::stdout())?;
    /// runtime.run().await
    /// # }
    /// ```
    pub fn new(config: RuntimeConfig, sink: S) -> Result<Self> {
        config.validate()?;
        Ok(Runtime {
            config,
            sink,
            decoder: Arc::new(HttpDecoder),
            stats: Arc::new(SensorStats::new()),
        })
    }

    /// Replaces the HTTP/1.x decoder.
    pub fn with_decoder(mut self, decoder: Arc<dyn MessageDecoder>) -> Self {
        self.decoder = decoder;
        self
    }

    pub fn stats(&self) -> Arc<SensorStats> {
        Arc::clone(&self.stats)
    }

    /// Runs until `ctrl-c` (live capture) or the end of the capture file (offline replay).
    ///
    /// Must be called from within a tokio runtime. Fails if the capture handle cannot be opened.
    pub async fn run(self) -> Result<()> {
        let Runtime {
            config,
            sink,
            decoder,
            stats,
        } = self;

        let capture = match &config.capture.pcap {
            Some(path) => {
                log::info!("Initializing offline replay...");
                CaptureSource::Offline(OfflineRuntime::new(path, &config.capture.filter)?)
            }
            None => {
                log::info!("Initializing live capture...");
                CaptureSource::Online(OnlineRuntime::new(config.capture.clone())?)
            }
        };

        let (services, refresh_task) = if config.services.enabled {
            let cache = Arc::new(ServiceIpCache::new());
            let provider = KubernetesProvider::new();
            match cache.refresh_from(&provider).await {
                Ok(n) => log::info!("Loaded {} service IPs", n),
                Err(err) => log::error!("Failed to get service IPs: {:#}", err),
            }
            let task = ServiceIpCache::spawn(
                Arc::clone(&cache),
                provider,
                config.services.refresh_interval(),
            );
            (Some(cache), Some(task))
        } else {
            log::info!("Service IP filtering disabled");
            (None, None)
        };

        let (queue, transactions) = mpsc::channel(config.session.queue_capacity);
        let ctx = SessionContext {
            max_body_size: config.session.max_body_size,
            join_timeout: config.session.join_timeout(),
            decoder,
            queue,
            stats: Arc::clone(&stats),
        };
        let table = Arc::new(FlowTable::new(ctx, Handle::current()));
        let assembler = Assembler::new(table, config.capture.max_out_of_order);
        let processor = PacketProcessor::new(
            assembler,
            services.clone(),
            Arc::clone(&stats),
            config.capture.max_age(),
        );

        let subscription = Subscription::new(
            sink,
            services,
            ContentFilter {
                json_only: config.content.json_only,
                max_content_length: config.content.max_content_length,
            },
            Arc::clone(&stats),
        );
        let consumer = tokio::spawn(subscription.run(transactions));

        let flush_interval = config.capture.flush_interval();
        let capture_result = tokio::task::spawn_blocking(move || match capture {
            CaptureSource::Online(online) => online.run(processor, flush_interval),
            CaptureSource::Offline(offline) => offline.run(processor, flush_interval),
        })
        .await
        .context("Capture thread panicked");

        log::info!("Waiting for open sessions...");
        let consumer_result = consumer.await.context("Transaction consumer panicked");
        if let Some(task) = refresh_task {
            task.abort();
        }
        stats.log_summary();

        capture_result??;
        consumer_result?;
        log::info!("Done.");
        Ok(())
    }
}

enum CaptureSource {
    Online(OnlineRuntime),
    Offline(OfflineRuntime),
}

/// Serial per-packet pipeline shared by live capture and offline replay.
pub(crate) struct PacketProcessor {
    assembler: Assembler,
    services: Option<Arc<ServiceIpCache>>,
    stats: Arc<SensorStats>,
    max_age: Duration,
}

impl PacketProcessor {
    pub(crate) fn new(
        assembler: Assembler,
        services: Option<Arc<ServiceIpCache>>,
        stats: Arc<SensorStats>,
        max_age: Duration,
    ) -> Self {
        PacketProcessor {
            assembler,
            services,
            stats,
            max_age,
        }
    }

    /// Parses one captured frame and feeds its TCP segment to reassembly.
    pub(crate) fn process(&mut self, link: LinkType, frame: &[u8], now: Instant) {
        SensorStats::inc(&self.stats.packets);
        let segment = match L4Pdu::parse(link, frame) {
            Ok(segment) => segment,
            Err(err) => {
                log::trace!("Skipping packet: {}", err);
                SensorStats::inc(&self.stats.packets_unparsed);
                return;
            }
        };
        if let Some(services) = &self.services {
            let endpoints = segment.endpoints();
            if !services.is_service_ip(&endpoints.src.ip())
                && !services.is_service_ip(&endpoints.dst.ip())
            {
                log::debug!("Ignoring packet between non-service IPs: {}", endpoints);
                SensorStats::inc(&self.stats.packets_filtered);
                return;
            }
        }
        SensorStats::inc(&self.stats.segments);
        self.assembler.process(segment, now);
    }

    /// Flushes stream directions idle for longer than the maximum age.
    pub(crate) fn maintain(&mut self, now: Instant) {
        if let Some(cutoff) = now.checked_sub(self.max_age) {
            let flushed = self.assembler.flush_older_than(cutoff);
            if flushed > 0 {
                log::debug!("Flushed {} idle stream directions", flushed);
            }
        }
    }

    /// Flushes all reassembly state and closes every pending session's second direction.
    ///
    /// Consumes the processor, releasing its handle on the flow table.
    pub(crate) fn finish(mut self) {
        let flushed = self.assembler.flush_all();
        let drained = self.assembler.table().drain();
        log::info!(
            "Flushed {} stream directions, closed {} half-open sessions",
            flushed,
            drained
        );
    }
}
