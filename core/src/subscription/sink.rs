//! Transaction sinks.

use crate::protocols::stream::http::HttpTransaction;

use std::fs::OpenOptions;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};

/// Destination of forwarded transactions.
///
/// Invoked synchronously from the single consumer loop, so implementations need not be `Sync`.
pub trait TransactionSink: Send {
    /// Forwards one transaction.
    fn forward(&mut self, transaction: &HttpTransaction) -> Result<()>;

    /// Flushes buffered output. Called once when the consumer loop ends.
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Writes each transaction as one JSON object per line.
pub struct JsonlSink<W: Write + Send> {
    writer: W,
}

impl JsonlSink<Box<dyn Write + Send>> {
    /// Writes to standard output.
    pub fn stdout() -> Self {
        JsonlSink::new(Box::new(io::stdout()))
    }

    /// Appends to the file at `path`, creating it if needed.
    pub fn file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open output file {}", path.display()))?;
        Ok(JsonlSink::new(Box::new(BufWriter::new(file))))
    }

    /// Writes to `path` if set, standard output otherwise.
    pub fn from_output<P: AsRef<Path>>(path: Option<P>) -> Result<Self> {
        match path {
            Some(path) => Self::file(path),
            None => Ok(Self::stdout()),
        }
    }
}

impl<W: Write + Send> JsonlSink<W> {
    pub fn new(writer: W) -> Self {
        JsonlSink { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write + Send> TransactionSink for JsonlSink<W> {
    fn forward(&mut self, transaction: &HttpTransaction) -> Result<()> {
        serde_json::to_writer(&mut self.writer, transaction)?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}
