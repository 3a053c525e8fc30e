//! TCP server shell around [`conduit_http`].
//!
//! Accepts connections, keeps a registry of the open ones, samples their bandwidth, and serves
//! a small diagnostics listing at `GET /system/connections`. Everything protocol related
//! happens in [`conduit_http::connection::HttpConnection`].

pub mod bandwidth;
pub mod config;
pub mod dispatchers;
pub mod logging;
pub mod registry;
mod server;

pub use server::Server;
pub use server::ServerBuilder;
pub use server::ServerError;
