//! Bidirectional connection identifiers.
//!
//! Provides an endpoint-specific identifier (distinguishes client and server) and a generic key for
//! correlating the two directions of a TCP connection.

use std::cmp;
use std::fmt;
use std::net::SocketAddr;

use serde::Serialize;

/// Connection 4-tuple.
///
/// The sender of the first observed segment in the connection becomes the client `src`, and the
/// recipient becomes the server `dst`.
#[derive(Debug, Copy, Clone, Hash, Eq, PartialEq, Serialize)]
pub struct FourTuple {
    /// The client endpoint.
    pub src: SocketAddr,
    /// The server endpoint.
    pub dst: SocketAddr,
}

impl FourTuple {
    pub fn new(src: SocketAddr, dst: SocketAddr) -> Self {
        FourTuple { src, dst }
    }

    /// Returns the same connection seen from the opposite direction.
    pub fn reverse(&self) -> Self {
        FourTuple {
            src: self.dst,
            dst: self.src,
        }
    }

    /// Converts a 4-tuple to a non-directional connection identifier.
    pub fn conn_id(&self) -> ConnId {
        ConnId::new(self.src, self.dst)
    }
}

impl fmt::Display for FourTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.src, self.dst)
    }
}

/// A generic connection identifier.
///
/// Identifies a connection independent of the source and destination socket address order, so
/// both directions of a connection map to the same key. Does not distinguish between the client
/// and server of the connection.
#[derive(Debug, Copy, Clone, Hash, Eq, PartialEq)]
pub struct ConnId(SocketAddr, SocketAddr);

impl ConnId {
    /// Returns the connection ID of a segment with `src` and `dst` IP/port pairs.
    pub fn new(src: SocketAddr, dst: SocketAddr) -> Self {
        ConnId(cmp::max(src, dst), cmp::min(src, dst))
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <> {}", self.0, self.1)
    }
}
