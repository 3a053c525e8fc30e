use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::config::HttpConfig;
use crate::connection::ServerStats;
use crate::dispatch::DispatcherPipeline;
use crate::exchange::{BufferSettings, SpaceProbe, UploadLimits};
use crate::firewall::{Firewall, IpGate};

/// Everything connections share: configuration, dispatchers, the IP gate and server counters.
#[derive(Clone)]
pub struct HttpService {
    config: Arc<HttpConfig>,
    pipeline: Arc<DispatcherPipeline>,
    gate: IpGate,
    limits: UploadLimits,
    buffer_settings: BufferSettings,
    server_stats: Arc<ServerStats>,
}

impl HttpService {
    pub fn new(config: HttpConfig, pipeline: DispatcherPipeline) -> Self {
        Self {
            gate: IpGate::new(config.ip_filter.clone(), None),
            limits: UploadLimits::from_config(&config),
            buffer_settings: BufferSettings::from(&config),
            config: Arc::new(config),
            pipeline: Arc::new(pipeline),
            server_stats: Arc::new(ServerStats::default()),
        }
    }

    pub fn with_firewall(mut self, firewall: Arc<dyn Firewall>) -> Self {
        self.gate = IpGate::new(self.config.ip_filter.clone(), Some(firewall));
        self
    }

    pub fn with_space_probe(mut self, probe: Arc<dyn SpaceProbe>) -> Self {
        self.limits = UploadLimits::new(self.config.max_upload_size, self.config.min_upload_free_space, probe);
        self
    }

    pub fn with_server_stats(mut self, server_stats: Arc<ServerStats>) -> Self {
        self.server_stats = server_stats;
        self
    }

    pub fn config(&self) -> &HttpConfig {
        &self.config
    }

    pub fn pipeline(&self) -> &DispatcherPipeline {
        &self.pipeline
    }

    pub fn gate(&self) -> &IpGate {
        &self.gate
    }

    pub fn limits(&self) -> &UploadLimits {
        &self.limits
    }

    pub fn buffer_settings(&self) -> &BufferSettings {
        &self.buffer_settings
    }

    pub fn server_stats(&self) -> &Arc<ServerStats> {
        &self.server_stats
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.config.idle_timeout()
    }
}

impl fmt::Debug for HttpService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpService")
            .field("config", &self.config)
            .field("pipeline", &self.pipeline)
            .field("gate", &self.gate)
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}
