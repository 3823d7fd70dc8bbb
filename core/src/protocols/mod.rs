//! Protocol parsing.
//!
//! [packet] demultiplexes captured frames down to TCP; [stream] decodes the reassembled byte
//! streams of a connection.

pub mod packet;
pub mod stream;
