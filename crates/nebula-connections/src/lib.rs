//! Connection management for a virtual-world client.
//!
//! The [`ConnectionRegistry`] tracks one [`ConnectionRecord`] per world: it
//! drives the handshake through a [`Connector`], keeps traffic and latency
//! statistics, detects stale connections, reconnects with a bounded number of
//! attempts, and records finished connections in a persisted history.

pub mod connector;
pub mod events;
pub mod health;
pub mod history;
pub mod record;
pub mod registry;
pub mod report;
pub mod retry;
pub mod statistics;
pub mod status;
pub mod store;
pub mod world;

pub use connector::{Connector, TransportConnector};
pub use events::RegistryEvent;
pub use health::ConnectionHealth;
pub use history::{ConnectionHistory, ConnectionHistoryEntry, DEFAULT_HISTORY_LIMIT};
pub use record::ConnectionRecord;
pub use registry::{ConnectionRegistry, DEFAULT_HISTORY_KEY, RegistryConfig};
pub use report::{ConnectionReport, WorldLine};
pub use retry::{ExponentialBackoff, FixedDelay, RetryPolicy, policy_from_config};
pub use statistics::{ConnectionStatistics, OverallStatistics, StatisticsDelta};
pub use status::ConnectionStatus;
pub use store::{FileStore, KeyValueStore, MemoryStore, StoreError};
pub use world::{
    Credentials, ProtocolKind, ProtocolSettings, WorldDescriptor, WorldId, WorldMetadata,
};
