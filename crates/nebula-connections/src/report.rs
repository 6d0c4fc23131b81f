//! Human-readable summaries of recent connection activity.

use std::fmt;
use std::time::Duration;

use serde::Serialize;

use crate::health::ConnectionHealth;
use crate::history::ConnectionHistoryEntry;
use crate::statistics::OverallStatistics;
use crate::status::ConnectionStatus;
use crate::world::{ProtocolKind, WorldId};

/// One live world in a report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorldLine {
    pub world_id: WorldId,
    pub name: String,
    pub protocol: ProtocolKind,
    pub status: ConnectionStatus,
    pub health: ConnectionHealth,
    pub average_latency: Option<Duration>,
    pub jitter: Option<Duration>,
    pub packet_loss_rate: f64,
    pub reconnect_count: u32,
    pub last_error: Option<String>,
}

/// Summary of the registry plus the sessions that ended inside a window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionReport {
    /// How far back the session summary looks.
    pub window: Duration,
    pub generated_at_ms: u64,
    pub overall: OverallStatistics,
    pub worlds: Vec<WorldLine>,
    /// Sessions that ended inside the window.
    pub sessions_ended: usize,
    /// Of those, how many had reached `connected`.
    pub sessions_succeeded: usize,
    /// Mean duration of the successful sessions.
    pub average_session: Option<Duration>,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

impl ConnectionReport {
    /// Assemble a report from live rows and the history entries in the window.
    pub(crate) fn build<'a>(
        window: Duration,
        generated_at_ms: u64,
        overall: OverallStatistics,
        worlds: Vec<WorldLine>,
        ended: impl IntoIterator<Item = &'a ConnectionHistoryEntry>,
    ) -> Self {
        let mut report = Self {
            window,
            generated_at_ms,
            overall,
            worlds,
            sessions_ended: 0,
            sessions_succeeded: 0,
            average_session: None,
            bytes_sent: 0,
            bytes_received: 0,
        };

        let mut session_total = Duration::ZERO;
        for entry in ended {
            report.sessions_ended += 1;
            report.bytes_sent = report.bytes_sent.saturating_add(entry.statistics.bytes_sent);
            report.bytes_received = report
                .bytes_received
                .saturating_add(entry.statistics.bytes_received);
            if entry.success {
                report.sessions_succeeded += 1;
                session_total = session_total.saturating_add(entry.duration);
            }
        }
        if report.sessions_succeeded > 0 {
            report.average_session = Some(session_total / report.sessions_succeeded as u32);
        }
        report
    }

    /// Share of ended sessions that had connected, in `[0, 1]`.
    pub fn success_rate(&self) -> Option<f64> {
        (self.sessions_ended > 0).then(|| self.sessions_succeeded as f64 / self.sessions_ended as f64)
    }
}

fn millis(d: Option<Duration>) -> String {
    d.map_or_else(|| "-".to_string(), |d| format!("{:.1}ms", d.as_secs_f64() * 1000.0))
}

impl fmt::Display for ConnectionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Connection report (last {}s)", self.window.as_secs())?;
        writeln!(
            f,
            "  active {}/{}  sent {}B  received {}B  reconnects {}  avg latency {}",
            self.overall.active_connections,
            self.overall.total_connections,
            self.overall.total_bytes_sent,
            self.overall.total_bytes_received,
            self.overall.total_reconnects,
            millis(self.overall.average_latency),
        )?;

        for line in &self.worlds {
            write!(
                f,
                "  {:<16} {:<16} {:<12} {:<12} {:>9}  jitter {:>9}  loss {:>5.1}%",
                line.name,
                line.protocol.to_string(),
                line.status.to_string(),
                line.health.to_string(),
                millis(line.average_latency),
                millis(line.jitter),
                line.packet_loss_rate * 100.0,
            )?;
            if let Some(err) = &line.last_error {
                write!(f, "  last error: {err}")?;
            }
            writeln!(f)?;
        }

        match self.success_rate() {
            Some(rate) => writeln!(
                f,
                "  sessions ended: {} ({:.0}% connected, avg {})",
                self.sessions_ended,
                rate * 100.0,
                self.average_session
                    .map_or_else(|| "-".to_string(), |d| format!("{}s", d.as_secs())),
            ),
            None => writeln!(f, "  sessions ended: 0"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::WorldDescriptor;
    use nebula_net::ConnectionId;

    fn ended(success: bool, secs: u64, bytes: u64) -> ConnectionHistoryEntry {
        let mut entry = ConnectionHistoryEntry {
            world: WorldDescriptor::new("Alpha", "ws://a", ProtocolKind::DuplexStream),
            connection_id: ConnectionId(1),
            success,
            duration: Duration::from_secs(secs),
            ..Default::default()
        };
        entry.statistics.bytes_received = bytes;
        entry
    }

    #[test]
    fn test_session_summary() {
        let entries = [ended(true, 10, 100), ended(true, 30, 50), ended(false, 0, 0)];
        let report = ConnectionReport::build(
            Duration::from_secs(3600),
            0,
            OverallStatistics::default(),
            Vec::new(),
            entries.iter(),
        );
        assert_eq!(report.sessions_ended, 3);
        assert_eq!(report.sessions_succeeded, 2);
        assert_eq!(report.average_session, Some(Duration::from_secs(20)));
        assert_eq!(report.bytes_received, 150);
        assert!((report.success_rate().unwrap() - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_oversized_entries_saturate() {
        let entries = [ended(true, u64::MAX, u64::MAX), ended(true, u64::MAX, 1)];
        let report = ConnectionReport::build(
            Duration::from_secs(60),
            0,
            OverallStatistics::default(),
            Vec::new(),
            entries.iter(),
        );
        assert_eq!(report.bytes_received, u64::MAX);
        assert_eq!(report.sessions_succeeded, 2);
        assert!(report.average_session.is_some());
        assert!(report.to_string().contains("sessions ended: 2"));
    }

    #[test]
    fn test_render_lists_worlds_and_errors() {
        let line = WorldLine {
            world_id: WorldId::new("Beta"),
            name: "Beta".into(),
            protocol: ProtocolKind::RequestResponse,
            status: ConnectionStatus::Error,
            health: ConnectionHealth::Disconnected,
            average_latency: None,
            jitter: None,
            packet_loss_rate: 0.0,
            reconnect_count: 0,
            last_error: Some("operation timed out".into()),
        };
        let report = ConnectionReport::build(
            Duration::from_secs(60),
            0,
            OverallStatistics::default(),
            vec![line],
            std::iter::empty(),
        );
        let text = report.to_string();
        assert!(text.contains("last 60s"));
        assert!(text.contains("Beta"));
        assert!(text.contains("request-response"));
        assert!(text.contains("last error: operation timed out"));
        assert!(text.contains("sessions ended: 0"));
    }

    #[test]
    fn test_render_shows_latency_spread() {
        let line = WorldLine {
            world_id: WorldId::new("Gamma"),
            name: "Gamma".into(),
            protocol: ProtocolKind::DuplexStream,
            status: ConnectionStatus::Connected,
            health: ConnectionHealth::Good,
            average_latency: Some(Duration::from_millis(120)),
            jitter: Some(Duration::from_millis(15)),
            packet_loss_rate: 0.25,
            reconnect_count: 1,
            last_error: None,
        };
        let report = ConnectionReport::build(
            Duration::from_secs(60),
            0,
            OverallStatistics::default(),
            vec![line],
            std::iter::empty(),
        );
        let text = report.to_string();
        assert!(text.contains("120.0ms"));
        assert!(text.contains("jitter    15.0ms"));
        assert!(text.contains("loss  25.0%"));
        assert!(!text.contains("last error"));
    }
}
