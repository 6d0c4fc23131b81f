//! Per-connection and aggregate traffic statistics.

use std::time::Duration;

use nebula_net::LatencyWindow;
use serde::{Deserialize, Serialize};

/// Running statistics for one connection.
///
/// Counters only ever grow. Latency slides with the window and `last_error`
/// is replaced by each new failure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionStatistics {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
    /// RTT samples from latency probes.
    pub latency: LatencyWindow,
    /// Successful re-handshakes.
    pub reconnect_count: u32,
    /// Most recent failure, rendered for display.
    pub last_error: Option<String>,
    /// Latency probes issued.
    pub probes_sent: u64,
    /// Latency probes that returned no answer.
    pub probes_failed: u64,
}

impl ConnectionStatistics {
    /// Fold a traffic delta into the counters.
    pub fn apply(&mut self, delta: &StatisticsDelta) {
        self.bytes_sent = self.bytes_sent.saturating_add(delta.bytes_sent);
        self.bytes_received = self.bytes_received.saturating_add(delta.bytes_received);
        self.packets_sent = self.packets_sent.saturating_add(delta.packets_sent);
        self.packets_received = self.packets_received.saturating_add(delta.packets_received);
        if let Some(rtt) = delta.latency {
            self.latency.record(rtt);
        }
    }

    /// Record the outcome of one latency probe.
    pub fn record_probe(&mut self, rtt: Option<Duration>) {
        self.probes_sent += 1;
        match rtt {
            Some(rtt) => self.latency.record(rtt),
            None => self.probes_failed += 1,
        }
    }

    /// Fraction of latency probes that went unanswered, in `[0, 1]`.
    pub fn packet_loss_rate(&self) -> f64 {
        if self.probes_sent == 0 {
            return 0.0;
        }
        self.probes_failed as f64 / self.probes_sent as f64
    }

    /// Average RTT over the recent window.
    pub fn average_latency(&self) -> Option<Duration> {
        self.latency.average()
    }

    /// Highest RTT seen.
    pub fn peak_latency(&self) -> Option<Duration> {
        self.latency.peak()
    }

    /// Lowest RTT seen.
    pub fn min_latency(&self) -> Option<Duration> {
        self.latency.min()
    }

    /// Spread of RTTs across the recent window.
    pub fn latency_jitter(&self) -> Option<Duration> {
        self.latency.jitter()
    }
}

/// Traffic observed since the last update.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatisticsDelta {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
    /// An RTT measured by the caller, if any.
    pub latency: Option<Duration>,
}

impl StatisticsDelta {
    /// One inbound frame of `bytes` bytes.
    pub fn received(bytes: u64) -> Self {
        Self {
            bytes_received: bytes,
            packets_received: 1,
            ..Self::default()
        }
    }

    /// One outbound frame of `bytes` bytes.
    pub fn sent(bytes: u64) -> Self {
        Self {
            bytes_sent: bytes,
            packets_sent: 1,
            ..Self::default()
        }
    }
}

/// Totals across every active connection.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OverallStatistics {
    /// Records currently in the `connected` state.
    pub active_connections: usize,
    /// All records in the registry, whatever their state.
    pub total_connections: usize,
    pub total_bytes_sent: u64,
    pub total_bytes_received: u64,
    pub total_packets_sent: u64,
    pub total_packets_received: u64,
    /// Mean of the per-connection averages that have samples.
    pub average_latency: Option<Duration>,
    pub total_reconnects: u64,
}

impl OverallStatistics {
    /// Sum up `stats`, counting `connected` ones as active.
    pub fn aggregate<'a>(entries: impl IntoIterator<Item = (&'a ConnectionStatistics, bool)>) -> Self {
        let mut overall = Self::default();
        let mut latency_sum = Duration::ZERO;
        let mut latency_count = 0u32;

        for (stats, connected) in entries {
            overall.total_connections += 1;
            if connected {
                overall.active_connections += 1;
            }
            overall.total_bytes_sent = overall.total_bytes_sent.saturating_add(stats.bytes_sent);
            overall.total_bytes_received = overall
                .total_bytes_received
                .saturating_add(stats.bytes_received);
            overall.total_packets_sent = overall.total_packets_sent.saturating_add(stats.packets_sent);
            overall.total_packets_received = overall
                .total_packets_received
                .saturating_add(stats.packets_received);
            overall.total_reconnects = overall
                .total_reconnects
                .saturating_add(u64::from(stats.reconnect_count));
            if let Some(avg) = stats.average_latency() {
                latency_sum = latency_sum.saturating_add(avg);
                latency_count += 1;
            }
        }

        if latency_count > 0 {
            overall.average_latency = Some(latency_sum / latency_count);
        }
        overall
    }
}
