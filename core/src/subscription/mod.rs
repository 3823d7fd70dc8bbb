//! Transaction consumer.
//!
//! A single [Subscription] drains the transaction queue that sessions emit on, applies the
//! service and content filters, and forwards the surviving transactions to a
//! [TransactionSink]. The queue is bounded: while the consumer is busy, sessions wait to emit.

pub mod sink;

pub use self::sink::{JsonlSink, TransactionSink};

use crate::protocols::stream::http::content::is_json;
use crate::protocols::stream::http::HttpTransaction;
use crate::services::ServiceIpCache;
use crate::stats::SensorStats;

use std::sync::Arc;

use tokio::sync::mpsc::Receiver;

/// Result of applying the consumer's filters to a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterResult {
    /// Forward the transaction.
    Forward,
    /// The destination is not a service address.
    NotService,
    /// The transaction does not carry JSON.
    NotJson,
}

/// Content filter settings.
#[derive(Debug, Clone, Copy)]
pub struct ContentFilter {
    pub json_only: bool,
    pub max_content_length: usize,
}

pub struct Subscription<S: TransactionSink> {
    sink: S,
    services: Option<Arc<ServiceIpCache>>,
    content: ContentFilter,
    stats: Arc<SensorStats>,
}

impl<S: TransactionSink> Subscription<S> {
    /// Creates a consumer forwarding to `sink`. Service filtering is disabled when `services` is
    /// `None`.
    pub fn new(
        sink: S,
        services: Option<Arc<ServiceIpCache>>,
        content: ContentFilter,
        stats: Arc<SensorStats>,
    ) -> Self {
        Subscription {
            sink,
            services,
            content,
            stats,
        }
    }

    /// Applies the service filter, then the content filter.
    pub fn filter(&self, transaction: &HttpTransaction) -> FilterResult {
        if let Some(services) = &self.services {
            if !services.is_service_ip(&transaction.endpoints.dst.ip()) {
                return FilterResult::NotService;
            }
        }
        if self.content.json_only && !is_json(transaction, self.content.max_content_length) {
            return FilterResult::NotJson;
        }
        FilterResult::Forward
    }

    /// Filters and forwards a single transaction.
    pub fn invoke(&mut self, transaction: HttpTransaction) {
        match self.filter(&transaction) {
            FilterResult::Forward => {
                log::debug!(
                    "Forwarding {} {} -> {} for {}",
                    transaction.method(),
                    transaction.uri(),
                    transaction.status_code(),
                    transaction.endpoints
                );
                match self.sink.forward(&transaction) {
                    Ok(()) => SensorStats::inc(&self.stats.transactions_forwarded),
                    Err(err) => {
                        log::error!("Failed to forward transaction: {:#}", err);
                        SensorStats::inc(&self.stats.sink_errors);
                    }
                }
            }
            FilterResult::NotService => {
                log::debug!(
                    "Ignoring request to non-service IP: {}",
                    transaction.endpoints
                );
                SensorStats::inc(&self.stats.transactions_filtered);
            }
            FilterResult::NotJson => {
                log::debug!("Ignoring non-JSON transaction: {}", transaction.endpoints);
                SensorStats::inc(&self.stats.transactions_filtered);
            }
        }
    }

    /// Consumes transactions until every sender of `queue` is gone, then returns the sink.
    pub async fn run(mut self, mut queue: Receiver<HttpTransaction>) -> S {
        while let Some(transaction) = queue.recv().await {
            self.invoke(transaction);
        }
        if let Err(err) = self.sink.flush() {
            log::error!("Failed to flush sink: {:#}", err);
            SensorStats::inc(&self.stats.sink_errors);
        }
        self.sink
    }
}
