//! Settings of the protocol core.
//!
//! Every field has a default, so an empty `[http]` table (or none at all) yields a working
//! configuration.

use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Knobs consulted by every [`HttpConnection`](crate::connection::HttpConnection).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Seconds without inbound or outbound activity before a connection is closed. 0 disables eviction.
    pub idle_timeout_secs: u64,

    /// Responses a connection may carry before it is closed.
    pub max_keep_alive: u32,

    /// Upstream proxies: unlimited keep-alive, and `X-Forwarded-For` is honored.
    pub proxy_ips: Vec<AddressRange>,

    /// Static blocklist checked before anything else happens with a request.
    pub ip_filter: Vec<AddressRange>,

    /// Largest accepted request body in bytes. 0 means unlimited.
    pub max_upload_size: u64,

    /// Free bytes that must remain where upload spill files live. 0 disables the check.
    pub min_upload_free_space: u64,

    /// Bytes a request body may occupy in memory before it spills to a temporary file.
    pub upload_memory_threshold: usize,

    /// Directory for spill files; the system temp dir when unset.
    pub upload_dir: Option<PathBuf>,

    /// Answer CORS preflight requests for every origin and path.
    pub cors_allow_all: bool,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 60,
            max_keep_alive: 100,
            proxy_ips: vec![],
            ip_filter: vec![],
            max_upload_size: 0,
            min_upload_free_space: 0,
            upload_memory_threshold: 16 * 1024,
            upload_dir: None,
            cors_allow_all: false,
        }
    }
}

impl HttpConfig {
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }

    pub fn is_trusted_proxy(&self, ip: IpAddr) -> bool {
        self.proxy_ips.iter().any(|range| range.contains(ip))
    }

    pub fn upload_dir(&self) -> PathBuf {
        self.upload_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid address range `{input}`: {reason}")]
pub struct AddressRangeError {
    input: String,
    reason: &'static str,
}

/// A single address or a CIDR block, written as `"192.168.1.7"`, `"10.0.0.0/8"` or `"fe80::/10"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(try_from = "String", into = "String")]
pub struct AddressRange {
    network: IpAddr,
    prefix: u8,
}

impl AddressRange {
    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.network, ip.to_canonical()) {
            (IpAddr::V4(network), IpAddr::V4(ip)) => {
                prefix_matches(u32::from(network).into(), u32::from(ip).into(), self.prefix, 32)
            }
            (IpAddr::V6(network), IpAddr::V6(ip)) => {
                prefix_matches(u128::from(network), u128::from(ip), self.prefix, 128)
            }
            _ => false,
        }
    }
}

fn prefix_matches(network: u128, ip: u128, prefix: u8, width: u8) -> bool {
    if prefix == 0 {
        return true;
    }
    let shift = u32::from(width - prefix);
    (network >> shift) == (ip >> shift)
}

impl FromStr for AddressRange {
    type Err = AddressRangeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let error = |reason| AddressRangeError { input: s.to_string(), reason };

        let (address, prefix) = match s.trim().split_once('/') {
            Some((address, prefix)) => (address, Some(prefix)),
            None => (s.trim(), None),
        };

        let network = IpAddr::from_str(address).map_err(|_e| error("not an ip address"))?.to_canonical();
        let width = if network.is_ipv4() { 32 } else { 128 };

        let prefix = match prefix {
            Some(prefix) => prefix.parse::<u8>().map_err(|_e| error("prefix is not a number"))?,
            None => width,
        };
        if prefix > width {
            return Err(error("prefix longer than the address"));
        }

        Ok(Self { network, prefix })
    }
}

impl TryFrom<String> for AddressRange {
    type Error = AddressRangeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<AddressRange> for String {
    fn from(range: AddressRange) -> Self {
        range.to_string()
    }
}

impl fmt::Display for AddressRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}
