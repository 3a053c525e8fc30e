//! Dispatchers that ship with the server.

use std::time::UNIX_EPOCH;

use conduit_http::connection::format_size_or_dash;
use conduit_http::dispatch::{DispatchDecision, DispatchError, Dispatcher};
use conduit_http::exchange::Exchange;
use conduit_http::protocol::{ResponseBody, status_response};
use http::header::CONTENT_TYPE;
use http::{HeaderValue, Method, Response, StatusCode};
use serde::Serialize;

use crate::registry::ConnectionRegistry;

pub const CONNECTIONS_PATH: &str = "/system/connections";

/// One open connection as listed by [`ConnectionsDispatcher`].
#[derive(Debug, Serialize)]
pub struct ConnectionInfo {
    pub remote: String,
    /// Seconds since the unix epoch.
    pub connected_since: u64,
    pub url: String,
    pub bytes_in: String,
    pub bytes_out: String,
    pub uplink: String,
    pub downlink: String,
    pub latency: String,
    pub keep_alives_left: u32,
}

/// Answers `GET /system/connections` with a JSON listing of open connections.
#[derive(Debug, Clone)]
pub struct ConnectionsDispatcher {
    registry: ConnectionRegistry,
}

impl ConnectionsDispatcher {
    pub fn new(registry: ConnectionRegistry) -> Self {
        Self { registry }
    }

    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.registry
            .snapshot()
            .iter()
            .map(|stats| ConnectionInfo {
                remote: stats.remote().to_string(),
                connected_since: stats.connected_at().duration_since(UNIX_EPOCH).map_or(0, |since| since.as_secs()),
                url: stats.url().to_string(),
                bytes_in: format_size_or_dash(stats.bytes_in()),
                bytes_out: format_size_or_dash(stats.bytes_out()),
                uplink: format!("{}/s", format_size_or_dash(stats.uplink())),
                downlink: format!("{}/s", format_size_or_dash(stats.downlink())),
                latency: stats.latency(),
                keep_alives_left: stats.num_keep_alive(),
            })
            .collect()
    }
}

impl Dispatcher for ConnectionsDispatcher {
    fn priority(&self) -> u32 {
        900
    }

    fn dispatch(&self, exchange: &mut Exchange) -> Result<DispatchDecision, DispatchError> {
        if exchange.path() != CONNECTIONS_PATH {
            return Ok(DispatchDecision::Continue);
        }
        if exchange.method() != Method::GET {
            exchange.respond(status_response(StatusCode::METHOD_NOT_ALLOWED, "Use GET to list connections"));
            return Ok(DispatchDecision::Done);
        }

        let body = serde_json::to_string(&self.connections())?;
        let mut response = Response::new(ResponseBody::from(body));
        response.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        exchange.respond(response);
        Ok(DispatchDecision::Done)
    }
}
