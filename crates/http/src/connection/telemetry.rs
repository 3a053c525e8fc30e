//! Lock-free connection and server counters.
//!
//! The connection task updates its [`ConnectionStats`] on every event while a periodic sampler
//! and diagnostics readers look at it from other tasks, so every field is an atomic or an
//! `ArcSwap` snapshot.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime};

use arc_swap::ArcSwap;

const NO_SAMPLE: u64 = u64::MAX;

/// A running mean of durations, safe to feed from one task and read from others.
#[derive(Debug, Default)]
pub struct Average {
    sum_micros: AtomicU64,
    count: AtomicU64,
}

impl Average {
    pub fn add(&self, value: Duration) {
        let micros = u64::try_from(value.as_micros()).unwrap_or(u64::MAX);
        self.sum_micros.fetch_add(micros, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Mean in milliseconds, 0 without samples.
    pub fn avg_millis(&self) -> f64 {
        let count = self.count();
        if count == 0 {
            return 0.0;
        }
        self.sum_micros.load(Ordering::Relaxed) as f64 / count as f64 / 1000.0
    }

    pub fn reset(&self) {
        self.sum_micros.store(0, Ordering::Relaxed);
        self.count.store(0, Ordering::Relaxed);
    }
}

/// Telemetry of one open connection.
#[derive(Debug)]
pub struct ConnectionStats {
    remote: SocketAddr,
    connected_at: SystemTime,
    started: Instant,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    current_bytes_in: AtomicU64,
    current_bytes_out: AtomicU64,
    uplink: AtomicU64,
    downlink: AtomicU64,
    /// Milliseconds after `started` of the last bandwidth sample
    last_sample: AtomicU64,
    num_keep_alive: AtomicU32,
    url: ArcSwap<String>,
    inbound_latency: Average,
    process_latency: Average,
}

impl ConnectionStats {
    pub fn new(remote: SocketAddr) -> Self {
        Self {
            remote,
            connected_at: SystemTime::now(),
            started: Instant::now(),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            current_bytes_in: AtomicU64::new(0),
            current_bytes_out: AtomicU64::new(0),
            uplink: AtomicU64::new(0),
            downlink: AtomicU64::new(0),
            last_sample: AtomicU64::new(NO_SAMPLE),
            num_keep_alive: AtomicU32::new(0),
            url: ArcSwap::from_pointee(String::new()),
            inbound_latency: Average::default(),
            process_latency: Average::default(),
        }
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn connected_at(&self) -> SystemTime {
        self.connected_at
    }

    pub fn record_in(&self, bytes: usize) {
        self.bytes_in.fetch_add(bytes as u64, Ordering::Relaxed);
        self.current_bytes_in.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_out(&self, bytes: usize) {
        self.bytes_out.fetch_add(bytes as u64, Ordering::Relaxed);
        self.current_bytes_out.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Bytes received during the current request cycle.
    pub fn bytes_in(&self) -> u64 {
        self.bytes_in.load(Ordering::Relaxed)
    }

    /// Bytes sent during the current request cycle.
    pub fn bytes_out(&self) -> u64 {
        self.bytes_out.load(Ordering::Relaxed)
    }

    /// Inbound bytes per second over the last sampling interval.
    pub fn uplink(&self) -> u64 {
        self.uplink.load(Ordering::Relaxed)
    }

    /// Outbound bytes per second over the last sampling interval.
    pub fn downlink(&self) -> u64 {
        self.downlink.load(Ordering::Relaxed)
    }

    pub fn num_keep_alive(&self) -> u32 {
        self.num_keep_alive.load(Ordering::Relaxed)
    }

    pub(crate) fn set_num_keep_alive(&self, remaining: u32) {
        self.num_keep_alive.store(remaining, Ordering::Relaxed);
    }

    pub fn url(&self) -> Arc<String> {
        self.url.load_full()
    }

    pub(crate) fn set_url(&self, url: String) {
        self.url.store(Arc::new(url));
    }

    pub fn inbound_latency(&self) -> &Average {
        &self.inbound_latency
    }

    pub fn process_latency(&self) -> &Average {
        &self.process_latency
    }

    /// `"<inbound> ms / <process> ms"`
    pub fn latency(&self) -> String {
        format!("{:.2} ms / {:.2} ms", self.inbound_latency.avg_millis(), self.process_latency.avg_millis())
    }

    /// Starts the counters of a new request cycle.
    pub(crate) fn reset_cycle(&self) {
        self.bytes_in.store(0, Ordering::Relaxed);
        self.bytes_out.store(0, Ordering::Relaxed);
        self.inbound_latency.reset();
        self.process_latency.reset();
    }

    /// Derives up/downlink from the bytes moved since the previous sample.
    ///
    /// Rates are only updated when a previous sample exists and at least a whole second passed;
    /// the per-interval counters restart either way.
    pub fn update_bandwidth(&self, now: Instant) {
        let now_millis = u64::try_from(now.saturating_duration_since(self.started).as_millis()).unwrap_or(u64::MAX - 1);
        let last = self.last_sample.load(Ordering::Relaxed);
        if last != NO_SAMPLE {
            let secs = now_millis.saturating_sub(last) / 1000;
            if secs > 0 {
                self.uplink.store(self.current_bytes_in.load(Ordering::Relaxed) / secs, Ordering::Relaxed);
                self.downlink.store(self.current_bytes_out.load(Ordering::Relaxed) / secs, Ordering::Relaxed);
            }
        }
        self.current_bytes_in.store(0, Ordering::Relaxed);
        self.current_bytes_out.store(0, Ordering::Relaxed);
        self.last_sample.store(now_millis, Ordering::Relaxed);
    }
}

/// Server-wide counters shared by all connections.
#[derive(Debug, Default)]
pub struct ServerStats {
    requests: AtomicU64,
    blocks: AtomicU64,
    client_errors: AtomicU64,
    idle_timeouts: AtomicU64,
    chunks: AtomicU64,
    open_connections: AtomicU64,
}

macro_rules! counters {
    ($($field:ident => $inc:ident),* $(,)?) => {
        impl ServerStats {
            $(
                pub fn $field(&self) -> u64 {
                    self.$field.load(Ordering::Relaxed)
                }

                pub(crate) fn $inc(&self) {
                    self.$field.fetch_add(1, Ordering::Relaxed);
                }
            )*
        }
    };
}

counters! {
    requests => count_request,
    blocks => count_block,
    client_errors => count_client_error,
    idle_timeouts => count_idle_timeout,
    chunks => count_chunk,
}

impl ServerStats {
    pub fn open_connections(&self) -> u64 {
        self.open_connections.load(Ordering::Relaxed)
    }

    pub fn connection_opened(&self) {
        self.open_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        // saturating: never wraps below zero
        let _ = self.open_connections.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |open| open.checked_sub(1));
    }
}

/// Human readable byte count with one decimal place: `B`, `KB`, `MB` or `GB`.
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.1} {}", UNITS[unit])
}

/// Like [`format_size`], but `-` for zero, as used in connection listings.
pub fn format_size_or_dash(bytes: u64) -> String {
    if bytes == 0 { "-".to_string() } else { format_size(bytes) }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats() -> ConnectionStats {
        ConnectionStats::new("127.0.0.1:4000".parse().unwrap())
    }

    #[test]
    fn bandwidth_needs_previous_sample() {
        let stats = stats();
        let start = Instant::now();

        stats.record_in(4000);
        stats.record_out(8000);
        stats.update_bandwidth(start);
        assert_eq!(stats.uplink(), 0);

        stats.record_in(4000);
        stats.record_out(8000);
        stats.update_bandwidth(start + Duration::from_secs(2));
        assert_eq!(stats.uplink(), 2000);
        assert_eq!(stats.downlink(), 4000);
    }

    #[test]
    fn bandwidth_ignores_sub_second_intervals() {
        let stats = stats();
        let start = Instant::now();
        stats.update_bandwidth(start);

        stats.record_in(500);
        stats.update_bandwidth(start + Duration::from_millis(400));
        assert_eq!(stats.uplink(), 0);

        // the counter restarted, so only these bytes count
        stats.record_in(3000);
        stats.update_bandwidth(start + Duration::from_millis(1400));
        assert_eq!(stats.uplink(), 3000);
    }

    #[test]
    fn cycle_reset_keeps_interval_counters() {
        let stats = stats();
        stats.record_in(10);
        stats.inbound_latency().add(Duration::from_millis(3));
        stats.reset_cycle();

        assert_eq!(stats.bytes_in(), 0);
        assert_eq!(stats.inbound_latency().count(), 0);

        let start = Instant::now();
        stats.update_bandwidth(start);
        stats.record_in(10);
        stats.update_bandwidth(start + Duration::from_secs(1));
        assert_eq!(stats.uplink(), 10);
    }

    #[test]
    fn averages() {
        let average = Average::default();
        assert!(average.avg_millis().abs() < f64::EPSILON);
        average.add(Duration::from_millis(2));
        average.add(Duration::from_millis(4));
        assert!((average.avg_millis() - 3.0).abs() < 1e-9);

        let stats = stats();
        stats.process_latency().add(Duration::from_micros(1500));
        assert_eq!(stats.latency(), "0.00 ms / 1.50 ms");
    }

    #[test]
    fn server_counters() {
        let stats = ServerStats::default();
        stats.count_request();
        stats.count_request();
        stats.count_block();
        stats.connection_closed();
        stats.connection_opened();
        assert_eq!(stats.requests(), 2);
        assert_eq!(stats.blocks(), 1);
        assert_eq!(stats.open_connections(), 1);
    }

    #[test]
    fn sizes() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(1536), "1.5 KB");
        assert_eq!(format_size(5 * 1024 * 1024), "5.0 MB");
        assert_eq!(format_size_or_dash(0), "-");
    }
}
