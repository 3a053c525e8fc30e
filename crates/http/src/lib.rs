//! The per-connection core of an HTTP/1.1 server.
//!
//! Bytes come in through [`codec`], and [`connection::HttpConnection`] turns them into request
//! cycles. Each cycle is handed to a priority-ordered [`dispatch::DispatcherPipeline`], which
//! answers through the cycle's [`exchange::Exchange`]. The connection takes care of the protocol
//! rules around that:
//!
//! - pipelined requests are answered strictly in arrival order
//! - POST/PUT bodies are buffered in memory, spilled to disk past a threshold, and capped by
//!   size and free-space ceilings (`507 Insufficient Storage`)
//! - `Expect: 100-continue` and CORS preflight requests are answered without a dispatcher
//! - connections close after a keep-alive budget, on idle timeout, or when the IP gate blocks
//!   the client
//!
//! Accepting sockets, TLS and routing live outside this crate.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use conduit_http::config::HttpConfig;
//! use conduit_http::connection::{ConnectionStats, HttpConnection, HttpService};
//! use conduit_http::dispatch::DispatcherPipeline;
//! use tokio::net::TcpListener;
//!
//! #[tokio::main]
//! async fn main() -> std::io::Result<()> {
//!     let service = Arc::new(HttpService::new(HttpConfig::default(), DispatcherPipeline::default()));
//!     let listener = TcpListener::bind("127.0.0.1:8080").await?;
//!
//!     loop {
//!         let (stream, remote) = listener.accept().await?;
//!         let service = Arc::clone(&service);
//!         tokio::spawn(async move {
//!             let (reader, writer) = stream.into_split();
//!             let stats = Arc::new(ConnectionStats::new(remote));
//!             let _ = HttpConnection::new(reader, writer, service, stats, false).process().await;
//!         });
//!     }
//! }
//! ```

pub mod codec;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod exchange;
pub mod firewall;
pub mod protocol;

mod utils;
pub(crate) use utils::ensure;
