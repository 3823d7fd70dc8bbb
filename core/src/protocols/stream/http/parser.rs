//! HTTP message decoder.
//!
//! The decoder uses the [httparse](https://docs.rs/httparse/latest/httparse/) crate to parse the
//! start line and headers of a single HTTP/1.x message, then frames the body from the bytes that
//! follow according to `Transfer-Encoding` / `Content-Length`. It works on whatever prefix of the
//! stream was captured: headers must be complete, but a truncated body is returned truncated.

use super::transaction::{Headers, HttpRequest, HttpResponse};

use httparse::{Request, Response, Status, EMPTY_HEADER};
use thiserror::Error;

/// Maximum number of header fields accepted in a single message.
const MAX_HEADERS: usize = 64;

/// Decodes one direction of a connection into an HTTP message.
pub trait MessageDecoder: Send + Sync {
    /// Decodes the first request in `data`.
    fn decode_request(&self, data: &[u8]) -> Result<HttpRequest, DecodeError>;

    /// Decodes the first response in `data`.
    fn decode_response(&self, data: &[u8]) -> Result<HttpResponse, DecodeError>;
}

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("no data")]
    Empty,

    #[error("incomplete message head")]
    Incomplete,

    #[error("malformed message head: {0}")]
    Malformed(#[from] httparse::Error),

    #[error("invalid Content-Length: {0:?}")]
    InvalidContentLength(String),

    #[error("unsupported Transfer-Encoding: {0:?}")]
    UnsupportedTransferEncoding(String),
}

/// HTTP/1.x decoder backed by `httparse`.
#[derive(Debug, Default, Clone, Copy)]
pub struct HttpDecoder;

impl MessageDecoder for HttpDecoder {
    fn decode_request(&self, data: &[u8]) -> Result<HttpRequest, DecodeError> {
        if data.is_empty() {
            return Err(DecodeError::Empty);
        }
        let mut raw_headers = [EMPTY_HEADER; MAX_HEADERS];
        let mut req = Request::new(&mut raw_headers[..]);
        let head_len = match req.parse(data)? {
            Status::Complete(len) => len,
            Status::Partial => return Err(DecodeError::Incomplete),
        };
        let headers = Headers::from_httparse(req.headers);
        let rest = &data[head_len..];

        let body = match framing(&headers)? {
            Framing::Chunked => dechunk(rest),
            Framing::Length(len) => truncate(rest, len),
            Framing::Other(encoding) => {
                return Err(DecodeError::UnsupportedTransferEncoding(encoding))
            }
            // A request without framing headers has no body.
            Framing::Unframed => Vec::new(),
        };

        Ok(HttpRequest {
            method: req.method.unwrap_or_default().to_owned(),
            uri: req.path.unwrap_or_default().to_owned(),
            version: format!("HTTP/1.{}", req.version.unwrap_or(1)),
            headers,
            body,
            remote_addr: None,
        })
    }

    fn decode_response(&self, data: &[u8]) -> Result<HttpResponse, DecodeError> {
        if data.is_empty() {
            return Err(DecodeError::Empty);
        }
        let mut raw_headers = [EMPTY_HEADER; MAX_HEADERS];
        let mut resp = Response::new(&mut raw_headers[..]);
        let head_len = match resp.parse(data)? {
            Status::Complete(len) => len,
            Status::Partial => return Err(DecodeError::Incomplete),
        };
        let headers = Headers::from_httparse(resp.headers);
        let status_code = resp.code.unwrap_or_default();
        let rest = &data[head_len..];

        let body = if !status_allows_body(status_code) {
            Vec::new()
        } else {
            match framing(&headers)? {
                Framing::Chunked => dechunk(rest),
                Framing::Length(len) => truncate(rest, len),
                // Delimited by connection close.
                Framing::Other(_) | Framing::Unframed => rest.to_vec(),
            }
        };

        Ok(HttpResponse {
            version: format!("HTTP/1.{}", resp.version.unwrap_or(1)),
            status_code,
            reason: resp.reason.unwrap_or_default().to_owned(),
            headers,
            body,
        })
    }
}

/// How the body of a message is delimited.
#[derive(Debug, PartialEq, Eq)]
enum Framing {
    Chunked,
    Length(usize),
    Other(String),
    Unframed,
}

fn framing(headers: &Headers) -> Result<Framing, DecodeError> {
    if let Some(encoding) = headers.get("transfer-encoding") {
        let last = encoding.rsplit(',').next().unwrap_or_default().trim();
        if last.eq_ignore_ascii_case("chunked") {
            return Ok(Framing::Chunked);
        }
        return Ok(Framing::Other(encoding.to_owned()));
    }

    let mut length = None;
    for value in headers.get_all("content-length") {
        let parsed = value
            .trim()
            .parse::<usize>()
            .map_err(|_| DecodeError::InvalidContentLength(value.to_owned()))?;
        match length {
            Some(prev) if prev != parsed => {
                return Err(DecodeError::InvalidContentLength(value.to_owned()))
            }
            _ => length = Some(parsed),
        }
    }
    Ok(length.map_or(Framing::Unframed, Framing::Length))
}

fn status_allows_body(status_code: u16) -> bool {
    !((100..200).contains(&status_code) || status_code == 204 || status_code == 304)
}

fn truncate(data: &[u8], len: usize) -> Vec<u8> {
    data[..std::cmp::min(len, data.len())].to_vec()
}

/// Decodes chunked transfer coding, stopping at the last-chunk, at the first malformed chunk
/// size, or where the captured data ends.
fn dechunk(mut data: &[u8]) -> Vec<u8> {
    let mut body = Vec::new();
    loop {
        let (consumed, size) = match httparse::parse_chunk_size(data) {
            Ok(Status::Complete((consumed, size))) => (consumed, size as usize),
            Ok(Status::Partial) => break,
            Err(_) => {
                log::debug!("Invalid chunk size, keeping {} body bytes", body.len());
                break;
            }
        };
        if size == 0 {
            break;
        }
        data = &data[consumed..];
        if size > data.len() {
            body.extend_from_slice(data);
            break;
        }
        body.extend_from_slice(&data[..size]);
        data = &data[size..];
        // Trailing CRLF of the chunk.
        data = data.strip_prefix(b"\r\n").unwrap_or(data);
    }
    body
}
