//! HTTP message components.
//!
//! ## Remarks
//! Message bodies are held in memory exactly as captured, bounded by the session's maximum body
//! size. A body cut short by that bound or by the end of the capture is kept, not discarded.

use std::net::SocketAddr;

use serde::{Serialize, Serializer};

/// A single header field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Header {
    pub name: String,
    pub value: String,
}

/// Ordered header fields of an HTTP message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Headers(Vec<Header>);

impl Headers {
    pub(crate) fn from_httparse(raw: &[httparse::Header<'_>]) -> Self {
        Headers(
            raw.iter()
                .map(|hdr| Header {
                    name: hdr.name.to_owned(),
                    value: String::from_utf8_lossy(hdr.value).into_owned(),
                })
                .collect(),
        )
    }

    /// Returns the first value of header `name`, compared case-insensitively.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|hdr| hdr.name.eq_ignore_ascii_case(name))
            .map(|hdr| hdr.value.as_str())
    }

    /// Returns every value of header `name`, in order of appearance.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.0
            .iter()
            .filter(move |hdr| hdr.name.eq_ignore_ascii_case(name))
            .map(|hdr| hdr.value.as_str())
    }

    /// Appends a header field.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push(Header {
            name: name.into(),
            value: value.into(),
        });
    }
}

/// An HTTP Request
#[derive(Debug, Clone, Default, Serialize)]
pub struct HttpRequest {
    pub method: String,
    pub uri: String,
    pub version: String,
    pub headers: Headers,
    #[serde(serialize_with = "serialize_body")]
    pub body: Vec<u8>,
    /// Socket address of the client that sent the request. The decoder cannot infer it from the
    /// bytes alone, so it is filled in by the session.
    pub remote_addr: Option<SocketAddr>,
}

impl HttpRequest {
    pub fn content_type(&self) -> Option<&str> {
        self.headers.get("content-type")
    }

    pub fn host(&self) -> Option<&str> {
        self.headers.get("host")
    }
}

/// An HTTP Response
#[derive(Debug, Clone, Default, Serialize)]
pub struct HttpResponse {
    pub version: String,
    pub status_code: u16,
    pub reason: String,
    pub headers: Headers,
    #[serde(serialize_with = "serialize_body")]
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn content_type(&self) -> Option<&str> {
        self.headers.get("content-type")
    }
}

/// Encodes a message body as a Base64 string.
fn serialize_body<S: Serializer>(body: &[u8], s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&base64::encode(body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_lookup_ignores_case() {
        let mut headers = Headers::default();
        headers.insert("Content-Type", "application/json");
        headers.insert("Set-Cookie", "a=1");
        headers.insert("set-cookie", "b=2");
        assert_eq!(headers.get("content-type"), Some("application/json"));
        assert_eq!(
            headers.get_all("SET-COOKIE").collect::<Vec<_>>(),
            vec!["a=1", "b=2"]
        );
        assert_eq!(headers.get("accept"), None);
    }

    #[test]
    fn body_serializes_as_base64() {
        let response = HttpResponse {
            version: "HTTP/1.1".to_owned(),
            status_code: 200,
            reason: "OK".to_owned(),
            headers: Headers::default(),
            body: b"hello".to_vec(),
        };
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["body"], "aGVsbG8=");
        assert_eq!(json["status_code"], 200);
    }
}
