//! Connection correlation.
//!
//! Segments of a TCP connection arrive as two independent directional streams. The
//! [FlowTable] decides which stream newly-observed bytes belong to: the first direction seen for
//! a connection starts a new [session](self::session) and is treated as client to server, and the
//! second direction seen is handed the session's server to client stream.
//!
//! Most of this module's functionality is driven by the runtime and is not meant to be managed
//! directly by users. It publicly exposes connection identifiers and the flow table for
//! embedding the engine behind a different packet source.

pub mod conn_id;
pub mod pdu;
pub mod reassembly;
pub mod session;
pub mod stream;

use self::conn_id::{ConnId, FourTuple};
use self::session::Session;
use self::stream::{stream, StreamWriter};
use crate::protocols::stream::http::{HttpTransaction, MessageDecoder};
use crate::stats::SensorStats;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::runtime::Handle;
use tokio::sync::mpsc::Sender;

/// Sessions waiting for their second direction.
pub(crate) type PendingTable = Arc<DashMap<ConnId, PendingEntry>>;

/// Flow table entry of a session whose server to client direction has not been observed yet.
#[derive(Debug)]
pub(crate) struct PendingEntry {
    session_id: u64,
    server_to_client: StreamWriter,
}

/// Shared state for every session started by a [FlowTable].
pub struct SessionContext {
    /// Maximum number of bytes decoded from each direction.
    pub max_body_size: usize,
    /// Time budget for both decode tasks, measured from session start.
    pub join_timeout: Duration,
    /// Decoder applied to both directions.
    pub decoder: Arc<dyn MessageDecoder>,
    /// Bounded queue that completed transactions are emitted on.
    pub queue: Sender<HttpTransaction>,
    pub stats: Arc<SensorStats>,
}

/// Maps connections to the session that owns them.
///
/// At most one session is registered per [ConnId] at any instant. Registration and
/// load-and-remove are atomic per key, so exactly one caller observes a connection's second
/// direction even when `resolve` is called concurrently.
pub struct FlowTable {
    pending: PendingTable,
    ctx: Arc<SessionContext>,
    runtime: Handle,
    next_id: AtomicU64,
}

impl FlowTable {
    /// Creates a flow table whose sessions run on `runtime`.
    pub fn new(ctx: SessionContext, runtime: Handle) -> Self {
        FlowTable {
            pending: Arc::new(DashMap::new()),
            ctx: Arc::new(ctx),
            runtime,
            next_id: AtomicU64::new(0),
        }
    }

    /// Returns the stream that bytes sent from `endpoints.src` to `endpoints.dst` are written to.
    ///
    /// The first call for a connection starts a new session and returns its client to server
    /// stream. The second call removes the session from the table and returns its server to
    /// client stream. A third call starts a brand-new session.
    pub fn resolve(&self, endpoints: FourTuple) -> StreamWriter {
        let conn_id = endpoints.conn_id();
        let (session, c2s_writer) = match self.pending.entry(conn_id) {
            Entry::Occupied(occupied) => {
                let (_, entry) = occupied.remove_entry();
                log::debug!(
                    "Session {} observed second direction {}",
                    entry.session_id,
                    endpoints
                );
                return entry.server_to_client;
            }
            Entry::Vacant(vacant) => {
                let session_id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let (c2s_writer, c2s_reader) = stream();
                let (s2c_writer, s2c_reader) = stream();
                vacant.insert(PendingEntry {
                    session_id,
                    server_to_client: s2c_writer,
                });
                let session = Session::new(
                    session_id,
                    endpoints,
                    c2s_reader,
                    s2c_reader,
                    Arc::clone(&self.ctx),
                    Arc::clone(&self.pending),
                );
                (session, c2s_writer)
            }
        };
        // Spawned once the shard lock is released.
        SensorStats::inc(&self.ctx.stats.sessions_started);
        self.runtime.spawn(session.run());
        c2s_writer
    }

    /// Removes every session still waiting for its second direction and closes their server to
    /// client streams. Returns the number of entries removed.
    pub fn drain(&self) -> usize {
        let keys: Vec<ConnId> = self.pending.iter().map(|entry| *entry.key()).collect();
        keys.iter()
            .filter(|key| self.pending.remove(key).is_some())
            .count()
    }

    /// Returns the number of sessions waiting for their second direction.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn stats(&self) -> &Arc<SensorStats> {
        &self.ctx.stats
    }
}
