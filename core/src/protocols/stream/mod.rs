//! Types for parsing stream-level network protocols.
//!
//! A stream-level protocol is decoded from the reassembled, in-order bytes of one direction of a
//! TCP connection rather than from individual packets.

pub mod http;
