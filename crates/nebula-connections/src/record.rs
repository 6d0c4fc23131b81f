//! The live state the registry keeps for one world.

use std::sync::Arc;
use std::time::SystemTime;

use nebula_net::ConnectionId;

use crate::statistics::ConnectionStatistics;
use crate::status::ConnectionStatus;
use crate::world::WorldDescriptor;

/// Snapshot of a world's connection, as handed to observers.
///
/// Only the registry mutates records; everything outside sees clones.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionRecord {
    pub world: Arc<WorldDescriptor>,
    /// Id of the current transport channel. Changes on every re-handshake.
    pub connection_id: ConnectionId,
    pub status: ConnectionStatus,
    pub created_at: SystemTime,
    /// Last time traffic was observed.
    pub last_activity: SystemTime,
    /// First time the record reached `connected`.
    pub connected_at: Option<SystemTime>,
    pub statistics: ConnectionStatistics,
}

impl ConnectionRecord {
    pub(crate) fn new(world: Arc<WorldDescriptor>, connection_id: ConnectionId) -> Self {
        let now = SystemTime::now();
        Self {
            world,
            connection_id,
            status: ConnectionStatus::Disconnected,
            created_at: now,
            last_activity: now,
            connected_at: None,
            statistics: ConnectionStatistics::default(),
        }
    }

    /// Whether the record ever reached `connected`.
    pub fn ever_connected(&self) -> bool {
        self.connected_at.is_some()
    }
}
