//! The IP gate consulted before any request is processed.

use std::net::IpAddr;
use std::sync::Arc;

use crate::config::AddressRange;

/// A pluggable blocklist, e.g. one backed by a shared store of banned addresses.
#[cfg_attr(test, mockall::automock)]
pub trait Firewall: Send + Sync {
    fn is_blacklisted(&self, remote: IpAddr) -> bool;
}

/// The static filter from configuration plus an optional [`Firewall`].
#[derive(Clone, Default)]
pub struct IpGate {
    filter: Vec<AddressRange>,
    firewall: Option<Arc<dyn Firewall>>,
}

impl IpGate {
    pub fn new(filter: Vec<AddressRange>, firewall: Option<Arc<dyn Firewall>>) -> Self {
        Self { filter, firewall }
    }

    pub fn is_blocked(&self, remote: IpAddr) -> bool {
        self.filter.iter().any(|range| range.contains(remote))
            || self.firewall.as_ref().is_some_and(|firewall| firewall.is_blacklisted(remote))
    }
}

impl std::fmt::Debug for IpGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpGate").field("filter", &self.filter).field("firewall", &self.firewall.is_some()).finish()
    }
}
