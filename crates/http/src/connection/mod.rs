//! Per-connection protocol handling.
//!
//! [`HttpConnection`] owns one client connection from the first byte to the close. It is built
//! from small parts that are usable on their own:
//!
//! - [`PipeliningBuffer`]: one request in flight, later heads parked in arrival order
//! - [`ConnectionStats`] and [`ServerStats`]: lock-free counters read by diagnostics
//! - [`CountingIo`]: byte accounting around the raw stream
//! - [`HttpService`]: the configuration and collaborators shared by all connections

mod http_connection;
mod io;
mod pipelining;
mod service;
mod telemetry;

pub use http_connection::HttpConnection;
pub use io::CountingIo;
pub use pipelining::Admission;
pub use pipelining::PipeliningBuffer;
pub use pipelining::RequestHead;
pub use service::HttpService;
pub use telemetry::Average;
pub use telemetry::ConnectionStats;
pub use telemetry::ServerStats;
pub use telemetry::format_size;
pub use telemetry::format_size_or_dash;
