//! Connection lifecycle states and the legal transitions between them.
//!
//! ```text
//!                 ┌──────────────┐
//!   add ───────▶  │  connecting  │ ──fail──▶ error ◀──exhausted──┐
//!                 └──────┬───────┘             │                 │
//!                        │ ok        explicit retry              │
//!                        ▼                     ▼                 │
//!                   connected ──stale──▶ reconnecting ───────────┘
//!                        ▲                     │
//!                        └────────ok───────────┘
//!
//!   any ──remove──▶ disconnected
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a connection record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    /// No channel. Initial and terminal state.
    #[default]
    Disconnected,
    /// First handshake in progress.
    Connecting,
    /// Handshake succeeded; traffic may flow.
    Connected,
    /// Re-handshaking after staleness, a remote close, or an explicit request.
    Reconnecting,
    /// Handshake or reconnection failed. Ends only on explicit retry or removal.
    Error,
}

impl ConnectionStatus {
    /// Whether moving from `self` to `next` is allowed.
    ///
    /// `explicit` marks a caller-initiated reconnection; it is the only way out
    /// of `Error` short of removal.
    pub fn can_transition_to(self, next: ConnectionStatus, explicit: bool) -> bool {
        use ConnectionStatus::*;
        matches!(
            (self, next),
            (_, Disconnected)
                | (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Error)
                | (Connected, Reconnecting)
                | (Reconnecting, Connected)
                | (Reconnecting, Error)
        ) || (self == Error && next == Reconnecting && explicit)
    }

    /// Whether the record holds (or is establishing) a live channel.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            ConnectionStatus::Connecting | ConnectionStatus::Connected | ConnectionStatus::Reconnecting
        )
    }

    /// All states, in lifecycle order.
    pub const ALL: [ConnectionStatus; 5] = [
        ConnectionStatus::Disconnected,
        ConnectionStatus::Connecting,
        ConnectionStatus::Connected,
        ConnectionStatus::Reconnecting,
        ConnectionStatus::Error,
    ];
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Reconnecting => "reconnecting",
            ConnectionStatus::Error => "error",
        })
    }
}
