//! Change notifications published by the registry.

use crate::history::ConnectionHistoryEntry;
use crate::record::ConnectionRecord;
use crate::status::ConnectionStatus;
use crate::world::WorldId;

/// Capacity of the broadcast channel. Slow subscribers see `Lagged`.
pub const EVENT_CAPACITY: usize = 256;

/// One registry change.
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    /// A world was added; the record is already `connecting`.
    Added(ConnectionRecord),
    /// A record changed state.
    StatusChanged {
        record: ConnectionRecord,
        previous: ConnectionStatus,
    },
    /// Traffic or probe counters changed.
    StatisticsUpdated(ConnectionRecord),
    /// A record was removed; `entry` is what went into the history.
    Removed {
        world_id: WorldId,
        entry: ConnectionHistoryEntry,
    },
}

impl RegistryEvent {
    /// World the event concerns.
    pub fn world_id(&self) -> &WorldId {
        match self {
            RegistryEvent::Added(record)
            | RegistryEvent::StatusChanged { record, .. }
            | RegistryEvent::StatisticsUpdated(record) => &record.world.id,
            RegistryEvent::Removed { world_id, .. } => world_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use nebula_net::ConnectionId;

    use super::*;
    use crate::world::{ProtocolKind, WorldDescriptor};

    #[test]
    fn test_world_id_of_each_event() {
        let world = Arc::new(WorldDescriptor::new("Alpha", "ws://a", ProtocolKind::DuplexStream));
        let record = ConnectionRecord::new(Arc::clone(&world), ConnectionId(7));
        let events = [
            RegistryEvent::Added(record.clone()),
            RegistryEvent::StatusChanged {
                record: record.clone(),
                previous: ConnectionStatus::Connecting,
            },
            RegistryEvent::StatisticsUpdated(record),
            RegistryEvent::Removed {
                world_id: world.id.clone(),
                entry: ConnectionHistoryEntry::default(),
            },
        ];
        for event in &events {
            assert_eq!(event.world_id(), &WorldId::new("Alpha"));
        }
    }
}
