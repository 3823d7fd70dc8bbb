//! HTTP transaction reconstruction.
//!
//! ## Remarks
//! Each direction of a connection is decoded independently into at most one HTTP/1.x message: the
//! first request sent by the client and the first response sent by the server. Pipelined
//! requests after the first are not decoded. Bodies are kept, including bodies that were cut
//! short by the per-direction read limit.
//!
//! HTTP/2 and TLS-encrypted traffic are not decoded.

pub mod content;
pub mod parser;
mod transaction;

pub use self::parser::{DecodeError, HttpDecoder, MessageDecoder};
pub use self::transaction::{Header, Headers, HttpRequest, HttpResponse};

use crate::conntrack::conn_id::FourTuple;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// A reconstructed HTTP request/response pair.
#[derive(Debug, Clone, Serialize)]
pub struct HttpTransaction {
    /// HTTP Request.
    pub request: HttpRequest,
    /// HTTP Response.
    pub response: HttpResponse,
    /// Client (`src`) and server (`dst`) endpoints of the connection.
    pub endpoints: FourTuple,
    /// Time at which the transaction was assembled.
    pub captured_at: DateTime<Utc>,
}

impl HttpTransaction {
    pub fn new(request: HttpRequest, response: HttpResponse, endpoints: FourTuple) -> Self {
        HttpTransaction {
            request,
            response,
            endpoints,
            captured_at: Utc::now(),
        }
    }

    /// Returns the request URI.
    pub fn uri(&self) -> &str {
        &self.request.uri
    }

    /// Returns the HTTP method.
    pub fn method(&self) -> &str {
        &self.request.method
    }

    /// Returns the HTTP status code.
    pub fn status_code(&self) -> u16 {
        self.response.status_code
    }
}
