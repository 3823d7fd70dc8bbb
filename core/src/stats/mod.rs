//! Sensor statistics.
//!
//! Counters are shared between the capture thread, session tasks and the consumer loop, so every
//! counter is a relaxed atomic. A summary is logged when the runtime shuts down.

use std::sync::atomic::{AtomicU64, Ordering};

/// Thread-safe counters for each stage of the pipeline.
#[derive(Debug, Default)]
pub struct SensorStats {
    /// Packets read from the capture handle.
    pub packets: AtomicU64,
    /// Packets dropped by the packet-level service filter.
    pub packets_filtered: AtomicU64,
    /// Packets that could not be parsed as TCP over IP.
    pub packets_unparsed: AtomicU64,
    /// TCP segments handed to reassembly.
    pub segments: AtomicU64,

    /// Sessions started by the flow table.
    pub sessions_started: AtomicU64,
    /// Sessions that produced both messages.
    pub sessions_complete: AtomicU64,
    /// Sessions that produced only a request.
    pub sessions_request_only: AtomicU64,
    /// Sessions that produced only a response.
    pub sessions_response_only: AtomicU64,
    /// Sessions that produced nothing.
    pub sessions_empty: AtomicU64,

    /// Directions the decoder rejected.
    pub decode_failures: AtomicU64,
    /// Decode tasks that panicked.
    pub decode_panics: AtomicU64,
    /// Decode tasks aborted at the join deadline.
    pub join_timeouts: AtomicU64,

    /// Transactions placed on the queue.
    pub transactions_emitted: AtomicU64,
    /// Transactions delivered to the sink.
    pub transactions_forwarded: AtomicU64,
    /// Transactions dropped by the consumer's filters.
    pub transactions_filtered: AtomicU64,
    /// Failed sink writes.
    pub sink_errors: AtomicU64,
}

impl SensorStats {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub(crate) fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    /// Logs current statistics.
    pub fn log_summary(&self) {
        log::info!(
            "Packets: {} read, {} filtered, {} unparsed, {} TCP segments",
            Self::get(&self.packets),
            Self::get(&self.packets_filtered),
            Self::get(&self.packets_unparsed),
            Self::get(&self.segments),
        );
        log::info!(
            "Sessions: {} started, {} complete, {} request only, {} response only, {} empty",
            Self::get(&self.sessions_started),
            Self::get(&self.sessions_complete),
            Self::get(&self.sessions_request_only),
            Self::get(&self.sessions_response_only),
            Self::get(&self.sessions_empty),
        );
        log::info!(
            "Decoding: {} failures, {} panics, {} timeouts",
            Self::get(&self.decode_failures),
            Self::get(&self.decode_panics),
            Self::get(&self.join_timeouts),
        );
        log::info!(
            "Transactions: {} emitted, {} forwarded, {} filtered, {} sink errors",
            Self::get(&self.transactions_emitted),
            Self::get(&self.transactions_forwarded),
            Self::get(&self.transactions_filtered),
            Self::get(&self.sink_errors),
        );
    }
}
