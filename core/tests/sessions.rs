use reqtap_core::conntrack::stream::StreamWriter;
use reqtap_core::protocols::stream::http::{
    DecodeError, HttpDecoder, HttpRequest, HttpResponse, MessageDecoder,
};
use reqtap_core::stats::SensorStats;
use reqtap_core::subscription::{ContentFilter, Subscription, TransactionSink};
use reqtap_core::{FlowTable, FourTuple, HttpTransaction, SessionContext};

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::mpsc;

const REQUEST: &[u8] = b"POST /orders HTTP/1.1\r\nHost: orders.default.svc\r\nContent-Type: application/json\r\nContent-Length: 11\r\n\r\n{\"qty\": 2}\n";
const RESPONSE: &[u8] = b"HTTP/1.1 201 Created\r\nContent-Type: application/json\r\nContent-Length: 9\r\n\r\n{\"id\":7}\n";

fn endpoints(port: u16) -> FourTuple {
    FourTuple::new(
        format!("10.244.0.5:{}", port).parse().unwrap(),
        "10.96.0.10:80".parse().unwrap(),
    )
}

fn flow_table(
    decoder: Arc<dyn MessageDecoder>,
    max_body_size: usize,
    capacity: usize,
) -> (FlowTable, mpsc::Receiver<HttpTransaction>, Arc<SensorStats>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let stats = Arc::new(SensorStats::new());
    let (queue, rx) = mpsc::channel(capacity);
    let ctx = SessionContext {
        max_body_size,
        join_timeout: Duration::from_secs(120),
        decoder,
        queue,
        stats: Arc::clone(&stats),
    };
    (FlowTable::new(ctx, Handle::current()), rx, stats)
}

/// Writes one exchange on a fresh connection and closes both directions.
fn exchange(table: &FlowTable, tuple: FourTuple, request: &[u8], response: &[u8]) {
    let c2s = table.resolve(tuple);
    let s2c = table.resolve(tuple.reverse());
    c2s.write(request);
    s2c.write(response);
}

async fn wait_for(counter: &AtomicU64, value: u64) {
    while SensorStats::get(counter) < value {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

#[derive(Default)]
struct CollectingSink {
    transactions: Vec<HttpTransaction>,
}

impl TransactionSink for CollectingSink {
    fn forward(&mut self, transaction: &HttpTransaction) -> anyhow::Result<()> {
        self.transactions.push(transaction.clone());
        Ok(())
    }
}

/// Panics on every request.
struct PanickingDecoder;

impl MessageDecoder for PanickingDecoder {
    fn decode_request(&self, _data: &[u8]) -> Result<HttpRequest, DecodeError> {
        panic!("decoder bug");
    }

    fn decode_response(&self, data: &[u8]) -> Result<HttpResponse, DecodeError> {
        HttpDecoder.decode_response(data)
    }
}

/// Records the largest input it was handed.
#[derive(Default)]
struct RecordingDecoder {
    largest: Arc<AtomicUsize>,
}

impl MessageDecoder for RecordingDecoder {
    fn decode_request(&self, data: &[u8]) -> Result<HttpRequest, DecodeError> {
        self.largest.fetch_max(data.len(), Ordering::SeqCst);
        HttpDecoder.decode_request(data)
    }

    fn decode_response(&self, data: &[u8]) -> Result<HttpResponse, DecodeError> {
        self.largest.fetch_max(data.len(), Ordering::SeqCst);
        HttpDecoder.decode_response(data)
    }
}

#[tokio::test]
async fn end_to_end_transaction_reaches_sink() {
    let (table, rx, stats) = flow_table(Arc::new(HttpDecoder), 1 << 20, 16);
    let consumer = tokio::spawn(
        Subscription::new(
            CollectingSink::default(),
            None,
            ContentFilter {
                json_only: true,
                max_content_length: 1 << 20,
            },
            Arc::clone(&stats),
        )
        .run(rx),
    );

    let tuple = endpoints(40000);
    exchange(&table, tuple, REQUEST, RESPONSE);
    wait_for(&stats.sessions_complete, 1).await;
    drop(table);

    let sink = consumer.await.unwrap();
    assert_eq!(sink.transactions.len(), 1);
    let transaction = &sink.transactions[0];
    assert_eq!(transaction.method(), "POST");
    assert_eq!(transaction.uri(), "/orders");
    assert_eq!(transaction.status_code(), 201);
    assert_eq!(transaction.endpoints, tuple);
    assert_eq!(transaction.request.remote_addr, Some(tuple.src));
    assert_eq!(transaction.response.body, b"{\"id\":7}\n");
    assert_eq!(SensorStats::get(&stats.transactions_forwarded), 1);
}

#[tokio::test(start_paused = true)]
async fn request_without_response_times_out() {
    let (table, mut rx, stats) = flow_table(Arc::new(HttpDecoder), 1 << 20, 16);
    let tuple = endpoints(40001);

    // The server never answers and its direction is never closed.
    let c2s = table.resolve(tuple);
    c2s.write(REQUEST);
    drop(c2s);
    let _s2c: StreamWriter = table.resolve(tuple.reverse());

    tokio::time::sleep(Duration::from_secs(121)).await;
    assert_eq!(SensorStats::get(&stats.sessions_request_only), 1);
    assert_eq!(SensorStats::get(&stats.join_timeouts), 1);
    assert_eq!(SensorStats::get(&stats.transactions_emitted), 0);
    assert!(rx.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn finished_session_leaves_no_pending_entry() {
    let (table, _rx, stats) = flow_table(Arc::new(HttpDecoder), 1 << 20, 16);
    let c2s = table.resolve(endpoints(40002));
    c2s.write(REQUEST);
    drop(c2s);
    assert_eq!(table.len(), 1);

    tokio::time::sleep(Duration::from_secs(121)).await;
    assert_eq!(SensorStats::get(&stats.sessions_request_only), 1);
    assert!(table.is_empty());
}

#[tokio::test]
async fn finished_session_keeps_newer_entry() {
    let (table, _rx, stats) = flow_table(Arc::new(HttpDecoder), 1 << 20, 16);
    let tuple = endpoints(40010);

    let first_c2s = table.resolve(tuple);
    let first_s2c = table.resolve(tuple.reverse());
    assert!(table.is_empty());

    // The connection is reused before the first session finishes.
    let second_c2s = table.resolve(tuple);
    assert_eq!(table.len(), 1);

    first_c2s.write(REQUEST);
    first_s2c.write(RESPONSE);
    drop(first_c2s);
    drop(first_s2c);
    wait_for(&stats.sessions_complete, 1).await;

    assert_eq!(table.len(), 1);
    assert_eq!(SensorStats::get(&stats.sessions_started), 2);

    // The second session still receives its server to client stream.
    let second_s2c = table.resolve(tuple.reverse());
    assert!(table.is_empty());
    assert_eq!(SensorStats::get(&stats.sessions_started), 2);
    second_c2s.write(REQUEST);
    second_s2c.write(RESPONSE);
    drop(second_c2s);
    drop(second_s2c);
    wait_for(&stats.sessions_complete, 2).await;
}

#[tokio::test]
async fn panicking_decoder_is_isolated() {
    let (table, mut rx, stats) = flow_table(Arc::new(PanickingDecoder), 1 << 20, 16);
    exchange(&table, endpoints(40003), REQUEST, RESPONSE);
    wait_for(&stats.sessions_response_only, 1).await;

    assert_eq!(SensorStats::get(&stats.decode_panics), 1);
    assert!(rx.try_recv().is_err());

    // Later sessions are unaffected.
    exchange(&table, endpoints(40004), REQUEST, RESPONSE);
    wait_for(&stats.sessions_response_only, 2).await;
    assert_eq!(SensorStats::get(&stats.decode_panics), 2);
}

#[tokio::test]
async fn undecodable_sides_are_empty() {
    let (table, mut rx, stats) = flow_table(Arc::new(HttpDecoder), 1 << 20, 16);
    exchange(
        &table,
        endpoints(40005),
        b"\x16\x03\x01\x02\x00\x01\x00\x01\xfc\x03\x03",
        b"\x16\x03\x03\x00\x7a\x02\x00\x00\x76\x03\x03",
    );
    wait_for(&stats.sessions_empty, 1).await;

    assert_eq!(SensorStats::get(&stats.sessions_request_only), 0);
    assert_eq!(SensorStats::get(&stats.sessions_response_only), 0);
    assert_eq!(SensorStats::get(&stats.decode_failures), 2);
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn full_queue_blocks_emit_not_resolution() {
    let (table, mut rx, stats) = flow_table(Arc::new(HttpDecoder), 1 << 20, 1);
    exchange(&table, endpoints(40006), REQUEST, RESPONSE);
    exchange(&table, endpoints(40007), REQUEST, RESPONSE);
    wait_for(&stats.transactions_emitted, 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    // One transaction fills the queue, the other session waits to emit.
    assert_eq!(SensorStats::get(&stats.transactions_emitted), 1);
    assert_eq!(SensorStats::get(&stats.sessions_complete), 1);

    // New connections still resolve.
    let _c2s = table.resolve(endpoints(40008));
    assert_eq!(table.len(), 1);
    assert_eq!(SensorStats::get(&stats.sessions_started), 3);

    assert!(rx.recv().await.is_some());
    assert!(rx.recv().await.is_some());
    wait_for(&stats.sessions_complete, 2).await;
    assert_eq!(SensorStats::get(&stats.transactions_emitted), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_resolution_starts_one_session() {
    let (table, _rx, stats) = flow_table(Arc::new(HttpDecoder), 1 << 20, 256);
    let table = Arc::new(table);
    let connections = 100u16;

    for i in 0..connections {
        let tuple = endpoints(41000 + i);
        let barrier = Arc::new(Barrier::new(2));
        let threads: Vec<_> = [tuple, tuple.reverse()]
            .into_iter()
            .map(|direction| {
                let table = Arc::clone(&table);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    table.resolve(direction)
                })
            })
            .collect();
        for thread in threads {
            drop(thread.join().unwrap());
        }
    }

    assert_eq!(
        SensorStats::get(&stats.sessions_started),
        connections as u64
    );
    assert!(table.is_empty());
}

#[tokio::test]
async fn decoder_input_is_bounded() {
    let decoder = RecordingDecoder::default();
    let largest = Arc::clone(&decoder.largest);
    let (table, _rx, stats) = flow_table(Arc::new(decoder), 1024, 16);

    let mut request = b"POST /upload HTTP/1.1\r\nContent-Length: 10000\r\n\r\n".to_vec();
    request.resize(request.len() + 10_000, b'x');
    let c2s = table.resolve(endpoints(40009));
    let s2c = table.resolve(endpoints(40009).reverse());
    // The writers stay open: the bound alone ends the read.
    c2s.write(&request);
    s2c.write(&request);
    wait_for(&stats.sessions_started, 1).await;
    while largest.load(Ordering::SeqCst) == 0 {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(largest.load(Ordering::SeqCst), 1024);
    drop(c2s);
    drop(s2c);
}
