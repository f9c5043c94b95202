//! In-memory traffic accounting per tunnel.
//!
//! Counters live behind a process-wide lock with short critical sections;
//! nothing is persisted. Instantaneous rates are derived from the delta
//! since the previous update, which is good enough for a dashboard.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::models::{RealtimeTrafficStats, TrafficSample};
use crate::socks::TrafficLogger;

/// Process-wide traffic counters keyed by tunnel id.
#[derive(Default)]
pub struct TrafficMeter {
    stats: RwLock<HashMap<i64, RealtimeTrafficStats>>,
}

impl TrafficMeter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one finished connection's byte counts to a tunnel's totals and
    /// refresh its instantaneous rates.
    pub fn log_traffic(&self, tunnel_id: i64, bytes_in: u64, bytes_out: u64) {
        let mut stats = self.stats.write().expect("traffic meter lock poisoned");
        let entry = stats
            .entry(tunnel_id)
            .or_insert_with(|| RealtimeTrafficStats::empty(tunnel_id));

        entry.bytes_in += bytes_in;
        entry.bytes_out += bytes_out;

        let now = Utc::now();
        let elapsed = (now - entry.last_update).num_milliseconds() as f64 / 1000.0;
        if elapsed > 0.0 {
            entry.speed_in = bytes_in as f64 / elapsed;
            entry.speed_out = bytes_out as f64 / elapsed;
        }
        entry.last_update = now;
    }

    pub fn increment_connections(&self, tunnel_id: i64) {
        let mut stats = self.stats.write().expect("traffic meter lock poisoned");
        let entry = stats
            .entry(tunnel_id)
            .or_insert_with(|| RealtimeTrafficStats::empty(tunnel_id));
        entry.active_connections += 1;
        entry.last_update = Utc::now();
    }

    pub fn decrement_connections(&self, tunnel_id: i64) {
        let mut stats = self.stats.write().expect("traffic meter lock poisoned");
        if let Some(entry) = stats.get_mut(&tunnel_id) {
            entry.active_connections = entry.active_connections.saturating_sub(1);
            entry.last_update = Utc::now();
        }
    }

    /// Current counters for one tunnel; zeroed stats when it never saw
    /// traffic.
    pub fn realtime(&self, tunnel_id: i64) -> RealtimeTrafficStats {
        let stats = self.stats.read().expect("traffic meter lock poisoned");
        stats
            .get(&tunnel_id)
            .cloned()
            .unwrap_or_else(|| RealtimeTrafficStats::empty(tunnel_id))
    }

    /// Snapshot of every tunnel's counters.
    pub fn all_realtime(&self) -> HashMap<i64, RealtimeTrafficStats> {
        let stats = self.stats.read().expect("traffic meter lock poisoned");
        stats.clone()
    }

    /// Historical samples over a time window. Counter history is not
    /// persisted, so this is always empty.
    pub fn history(
        &self,
        _tunnel_id: i64,
        _start: DateTime<Utc>,
        _end: DateTime<Utc>,
    ) -> Vec<TrafficSample> {
        Vec::new()
    }

    /// Drop a tunnel's counters, e.g. after the tunnel is deleted.
    pub fn forget(&self, tunnel_id: i64) {
        let mut stats = self.stats.write().expect("traffic meter lock poisoned");
        stats.remove(&tunnel_id);
    }
}

/// [`TrafficLogger`] scoped to a single tunnel, handed to the SOCKS
/// server of that tunnel's accept loop.
pub struct TunnelTrafficLogger {
    tunnel_id: i64,
    meter: Arc<TrafficMeter>,
}

impl TunnelTrafficLogger {
    pub fn new(tunnel_id: i64, meter: Arc<TrafficMeter>) -> Self {
        Self { tunnel_id, meter }
    }
}

impl TrafficLogger for TunnelTrafficLogger {
    fn log_traffic(&self, bytes_in: u64, bytes_out: u64) {
        self.meter.log_traffic(self.tunnel_id, bytes_in, bytes_out);
    }
}
