// #![warn(missing_docs)]

//! Passive HTTP/1.x transaction capture.
//!
//! reqtap observes TCP traffic on a network interface (or in a capture file), reassembles each
//! connection's two directions, pairs the first request of a connection with the first response
//! to it, and forwards the resulting [HttpTransaction] to a sink. It never participates in the
//! traffic it observes.
//!
//! The pipeline has four stages:
//!
//! - A serial capture loop parses frames down to TCP segments and reassembles them into ordered
//!   byte streams, one per connection direction.
//! - The [FlowTable] correlates the two directions of a connection. The first direction observed
//!   starts a session; the second is handed to that session.
//! - Each [session](conntrack::session) decodes one request and one response in independent
//!   tasks under a join deadline, and emits a transaction only when both are decoded.
//! - A single consumer drains the bounded transaction queue, drops transactions that do not
//!   involve a cluster service (or do not carry JSON, if requested), and forwards the rest.
//!
//! The following example captures on the default device and prints transactions to stdout as
//! JSON lines:
//!
//! ```no_run
//! use reqtap_core::config::default_config;
//! use reqtap_core::subscription::JsonlSink;
//! use reqtap_core::Runtime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runtime = Runtime::new(default_config(), JsonlSink::stdout())?;
//!     runtime.run().await
//! }
//! ```

pub mod config;
pub mod conntrack;
pub mod protocols;
mod runtime;
pub mod services;
pub mod stats;
pub mod subscription;

pub use self::conntrack::conn_id::{ConnId, FourTuple};
pub use self::conntrack::pdu::L4Pdu;
pub use self::conntrack::session::SessionOutcome;
pub use self::conntrack::{FlowTable, SessionContext};
pub use self::protocols::stream::http::HttpTransaction;
pub use self::runtime::Runtime;
