//! Bidirectional sessions.
//!
//! A session owns the read halves of both directions of one TCP connection. It decodes the first
//! request sent by the client and the first response sent by the server in two independent
//! tasks, waits for both under a deadline measured from session start, and emits at most one
//! [HttpTransaction](crate::protocols::stream::http::HttpTransaction).

use super::conn_id::FourTuple;
use super::stream::StreamReader;
use super::{PendingTable, SessionContext};
use crate::protocols::stream::http::{DecodeError, HttpRequest, HttpResponse, HttpTransaction};
use crate::stats::SensorStats;

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};

/// Terminal state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Both messages were decoded and a transaction was emitted.
    Complete,
    /// Only the request was decoded.
    RequestOnly,
    /// Only the response was decoded.
    ResponseOnly,
    /// Neither message was decoded.
    Empty,
}

/// Result of one direction's decode task, as observed by the session.
#[derive(Debug)]
pub(crate) enum SideResult<T> {
    Decoded(T),
    /// The stream was empty or the decoder rejected it.
    Absent,
    /// The decode task panicked.
    Panicked,
    /// The decode task was still running at the deadline and was aborted.
    TimedOut,
}

impl<T> SideResult<T> {
    fn into_message(self) -> Option<T> {
        match self {
            SideResult::Decoded(msg) => Some(msg),
            _ => None,
        }
    }
}

pub(crate) struct Session {
    id: u64,
    endpoints: FourTuple,
    client_to_server: StreamReader,
    server_to_client: StreamReader,
    ctx: Arc<SessionContext>,
    pending: PendingTable,
}

impl Session {
    pub(crate) fn new(
        id: u64,
        endpoints: FourTuple,
        client_to_server: StreamReader,
        server_to_client: StreamReader,
        ctx: Arc<SessionContext>,
        pending: PendingTable,
    ) -> Self {
        Session {
            id,
            endpoints,
            client_to_server,
            server_to_client,
            ctx,
            pending,
        }
    }

    /// Drives the session to a terminal outcome.
    pub(crate) async fn run(self) -> SessionOutcome {
        let deadline = Instant::now() + self.ctx.join_timeout;
        let Session {
            id,
            endpoints,
            client_to_server,
            server_to_client,
            ctx,
            pending,
        } = self;
        log::debug!("Session {} started for {}", id, endpoints);

        let request_task = tokio::spawn(read_request(
            client_to_server,
            Arc::clone(&ctx),
            endpoints,
        ));
        let response_task = tokio::spawn(read_response(
            server_to_client,
            Arc::clone(&ctx),
            endpoints,
        ));

        let request = join_side("request", request_task, deadline, &ctx.stats, &endpoints)
            .await
            .into_message();
        let response = join_side("response", response_task, deadline, &ctx.stats, &endpoints)
            .await
            .into_message();

        let outcome = match (request, response) {
            (Some(request), Some(response)) => {
                log::debug!(
                    "Captured {} {} -> {} for {}",
                    request.method,
                    request.uri,
                    response.status_code,
                    endpoints
                );
                let transaction = HttpTransaction::new(request, response, endpoints);
                // Blocks while the queue is full.
                match ctx.queue.send(transaction).await {
                    Ok(()) => SensorStats::inc(&ctx.stats.transactions_emitted),
                    Err(_) => log::warn!("Transaction queue closed, dropping {}", endpoints),
                }
                SessionOutcome::Complete
            }
            (Some(_), None) => {
                log::warn!("Captured request without response: {}", endpoints);
                SessionOutcome::RequestOnly
            }
            (None, Some(_)) => {
                log::warn!("Captured response without request: {}", endpoints);
                SessionOutcome::ResponseOnly
            }
            (None, None) => {
                log::debug!("No request or response captured: {}", endpoints);
                SessionOutcome::Empty
            }
        };

        let counter = match outcome {
            SessionOutcome::Complete => &ctx.stats.sessions_complete,
            SessionOutcome::RequestOnly => &ctx.stats.sessions_request_only,
            SessionOutcome::ResponseOnly => &ctx.stats.sessions_response_only,
            SessionOutcome::Empty => &ctx.stats.sessions_empty,
        };
        SensorStats::inc(counter);

        // Both readers were dropped with their tasks. Only the entry registered by this session
        // may be removed: the key may already belong to a newer connection.
        pending.remove_if(&endpoints.conn_id(), |_, entry| entry.session_id == id);
        outcome
    }
}

async fn read_request(
    mut reader: StreamReader,
    ctx: Arc<SessionContext>,
    endpoints: FourTuple,
) -> Option<HttpRequest> {
    let data = reader.read_up_to(ctx.max_body_size).await;
    reader.close();
    match ctx.decoder.decode_request(&data) {
        Ok(mut request) => {
            request.remote_addr = Some(endpoints.src);
            Some(request)
        }
        Err(err) => {
            decode_failed("request", err, data.len(), &ctx, &endpoints);
            None
        }
    }
}

async fn read_response(
    mut reader: StreamReader,
    ctx: Arc<SessionContext>,
    endpoints: FourTuple,
) -> Option<HttpResponse> {
    let data = reader.read_up_to(ctx.max_body_size).await;
    reader.close();
    match ctx.decoder.decode_response(&data) {
        Ok(response) => Some(response),
        Err(err) => {
            decode_failed("response", err, data.len(), &ctx, &endpoints);
            None
        }
    }
}

fn decode_failed(
    side: &str,
    err: DecodeError,
    len: usize,
    ctx: &SessionContext,
    endpoints: &FourTuple,
) {
    log::debug!(
        "Failed to decode {} ({} bytes) for {}: {}",
        side,
        len,
        endpoints,
        err
    );
    if !matches!(err, DecodeError::Empty) {
        SensorStats::inc(&ctx.stats.decode_failures);
    }
}

/// Waits for a decode task until `deadline`, aborting it if it is still running.
async fn join_side<T>(
    side: &str,
    mut handle: JoinHandle<Option<T>>,
    deadline: Instant,
    stats: &SensorStats,
    endpoints: &FourTuple,
) -> SideResult<T> {
    match timeout_at(deadline, &mut handle).await {
        Ok(Ok(Some(msg))) => SideResult::Decoded(msg),
        Ok(Ok(None)) => SideResult::Absent,
        Ok(Err(err)) if err.is_panic() => {
            log::error!("Recovered from panic while decoding {} for {}", side, endpoints);
            SensorStats::inc(&stats.decode_panics);
            SideResult::Panicked
        }
        Ok(Err(_)) => SideResult::Absent,
        Err(_) => {
            handle.abort();
            log::debug!("Timed out decoding {} for {}", side, endpoints);
            SensorStats::inc(&stats.join_timeouts);
            SideResult::TimedOut
        }
    }
}
