//! Health classification for presentation.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::status::ConnectionStatus;

/// Coarse connection quality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionHealth {
    Disconnected,
    Poor,
    Fair,
    Good,
    Excellent,
}

/// Upper bound (exclusive) of the `Excellent` band.
pub const EXCELLENT_BELOW: Duration = Duration::from_millis(50);
/// Upper bound (exclusive) of the `Good` band.
pub const GOOD_BELOW: Duration = Duration::from_millis(150);
/// Upper bound (exclusive) of the `Fair` band.
pub const FAIR_BELOW: Duration = Duration::from_millis(300);

impl ConnectionHealth {
    /// Band for a measured RTT.
    pub fn from_latency(rtt: Duration) -> Self {
        if rtt < EXCELLENT_BELOW {
            ConnectionHealth::Excellent
        } else if rtt < GOOD_BELOW {
            ConnectionHealth::Good
        } else if rtt < FAIR_BELOW {
            ConnectionHealth::Fair
        } else {
            ConnectionHealth::Poor
        }
    }

    /// Classify a record.
    ///
    /// Only `connected` records are rated by latency; transitional states are
    /// `Poor` and dead ones `Disconnected`. A connected record with no samples
    /// yet is assumed `Good`, and a stale one is never better than `Poor`.
    pub fn assess(status: ConnectionStatus, average_latency: Option<Duration>, stale: bool) -> Self {
        match status {
            ConnectionStatus::Disconnected | ConnectionStatus::Error => ConnectionHealth::Disconnected,
            ConnectionStatus::Connecting | ConnectionStatus::Reconnecting => ConnectionHealth::Poor,
            ConnectionStatus::Connected => {
                let rated = average_latency.map_or(ConnectionHealth::Good, Self::from_latency);
                if stale { rated.min(ConnectionHealth::Poor) } else { rated }
            }
        }
    }
}

impl fmt::Display for ConnectionHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectionHealth::Disconnected => "disconnected",
            ConnectionHealth::Poor => "poor",
            ConnectionHealth::Fair => "fair",
            ConnectionHealth::Good => "good",
            ConnectionHealth::Excellent => "excellent",
        })
    }
}
