//! Directional byte streams.
//!
//! A stream carries the reassembled payload of one direction of a TCP connection. The reassembler
//! owns the write half and the session's decode task owns the read half. Dropping either half
//! closes the stream: the reader observes end-of-stream once the writer is gone, and the writer
//! observes a closed stream once the reader is gone, after which it discards further bytes.

use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

/// Creates a new, empty directional stream.
pub fn stream() -> (StreamWriter, StreamReader) {
    let (tx, rx) = unbounded_channel();
    (StreamWriter { tx }, StreamReader { rx })
}

/// Write half of a directional stream.
#[derive(Debug)]
pub struct StreamWriter {
    tx: UnboundedSender<Vec<u8>>,
}

impl StreamWriter {
    /// Appends `data` to the stream.
    ///
    /// Returns `false` if the read half has been closed, in which case the data is discarded.
    pub fn write(&self, data: &[u8]) -> bool {
        if data.is_empty() {
            return !self.tx.is_closed();
        }
        self.tx.send(data.to_vec()).is_ok()
    }

    /// Returns `true` if the read half has been closed.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Read half of a directional stream.
#[derive(Debug)]
pub struct StreamReader {
    rx: UnboundedReceiver<Vec<u8>>,
}

impl StreamReader {
    /// Reads from the stream until `limit` bytes are buffered or the write half is closed.
    ///
    /// Never returns more than `limit` bytes. A short read is returned as-is; an empty buffer
    /// means the stream ended before any byte arrived.
    pub async fn read_up_to(&mut self, limit: usize) -> Vec<u8> {
        let mut buf = Vec::new();
        while buf.len() < limit {
            match self.rx.recv().await {
                Some(chunk) => {
                    let take = std::cmp::min(chunk.len(), limit - buf.len());
                    buf.extend_from_slice(&chunk[..take]);
                }
                None => break,
            }
        }
        buf
    }

    /// Closes the stream. Buffered bytes are released and the writer starts discarding.
    pub fn close(&mut self) {
        self.rx.close();
        while self.rx.try_recv().is_ok() {}
    }
}
