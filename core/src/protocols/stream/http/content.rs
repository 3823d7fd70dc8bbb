//! Heuristic detection of JSON payloads.
//!
//! A transaction is considered JSON if either message declares a JSON media type, or, failing
//! that, if either body is small enough to sniff and parses as a JSON value. Bodies are only
//! borrowed; classification never consumes them.

use super::HttpTransaction;

/// Media-type patterns that identify JSON content, checked in order.
#[derive(Debug, Clone, Copy)]
pub enum MediaTypeRule {
    /// Matches the full `type/subtype` exactly.
    Exact(&'static str),
    /// Matches any media type whose subtype ends with the given suffix (RFC 6839).
    SubtypeSuffix(&'static str),
}

impl MediaTypeRule {
    fn matches(&self, media_type: &str) -> bool {
        match self {
            MediaTypeRule::Exact(expected) => media_type == *expected,
            MediaTypeRule::SubtypeSuffix(suffix) => media_type
                .split_once('/')
                .map_or(false, |(_, subtype)| subtype.ends_with(suffix)),
        }
    }
}

pub const JSON_MEDIA_TYPES: &[MediaTypeRule] = &[
    MediaTypeRule::Exact("application/json"),
    MediaTypeRule::SubtypeSuffix("+json"),
];

/// Returns `true` if `transaction` carries JSON in either direction.
///
/// Bodies longer than `max_content_length` bytes are never sniffed.
pub fn is_json(transaction: &HttpTransaction, max_content_length: usize) -> bool {
    let declared = [
        transaction.request.content_type(),
        transaction.response.content_type(),
    ];
    if declared
        .iter()
        .flatten()
        .filter_map(|value| media_type(value))
        .any(|mt| JSON_MEDIA_TYPES.iter().any(|rule| rule.matches(&mt)))
    {
        return true;
    }

    sniff(&transaction.request.body, max_content_length)
        || sniff(&transaction.response.body, max_content_length)
}

/// Extracts the lowercased `type/subtype` from a `Content-Type` value, dropping parameters.
fn media_type(content_type: &str) -> Option<String> {
    let essence = content_type.split(';').next()?.trim().to_ascii_lowercase();
    let (ty, subtype) = essence.split_once('/')?;
    if ty.is_empty() || subtype.is_empty() || subtype.contains('/') {
        return None;
    }
    Some(essence)
}

fn sniff(body: &[u8], max_content_length: usize) -> bool {
    body.len() <= max_content_length && serde_json::from_slice::<serde_json::Value>(body).is_ok()
}
