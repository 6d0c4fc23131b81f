//! Bounded post-mortem log of finished connections.

use std::collections::VecDeque;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use nebula_net::ConnectionId;
use serde::{Deserialize, Serialize};

use crate::statistics::ConnectionStatistics;
use crate::status::ConnectionStatus;
use crate::world::WorldDescriptor;

/// Schema version written into every persisted document.
pub const HISTORY_VERSION: u32 = 1;

/// Default number of entries kept.
pub const DEFAULT_HISTORY_LIMIT: usize = 100;

/// Milliseconds since the Unix epoch.
pub fn unix_millis(at: SystemTime) -> u64 {
    at.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Immutable record of one finished connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionHistoryEntry {
    /// The world as it was configured, without credentials.
    pub world: WorldDescriptor,
    pub connection_id: ConnectionId,
    /// When the record first reached `connected`, or was created if it never did.
    pub connected_at_ms: u64,
    pub disconnected_at_ms: u64,
    /// Time spent since first connecting; zero if the record never connected.
    pub duration: Duration,
    /// Whether the record ever reached `connected`.
    pub success: bool,
    /// Status just before removal.
    pub final_status: ConnectionStatus,
    pub statistics: ConnectionStatistics,
}

impl Default for ConnectionHistoryEntry {
    fn default() -> Self {
        Self {
            world: WorldDescriptor::default(),
            connection_id: ConnectionId(0),
            connected_at_ms: 0,
            disconnected_at_ms: 0,
            duration: Duration::ZERO,
            success: false,
            final_status: ConnectionStatus::Disconnected,
            statistics: ConnectionStatistics::default(),
        }
    }
}

/// On-disk shape of the history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryDocument {
    pub version: u32,
    pub entries: Vec<ConnectionHistoryEntry>,
}

impl Default for HistoryDocument {
    fn default() -> Self {
        Self {
            version: HISTORY_VERSION,
            entries: Vec::new(),
        }
    }
}

/// Append-only ring of the most recent entries, oldest first.
#[derive(Debug, Clone)]
pub struct ConnectionHistory {
    entries: VecDeque<ConnectionHistoryEntry>,
    limit: usize,
}

impl Default for ConnectionHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LIMIT)
    }
}

impl ConnectionHistory {
    /// Empty history keeping at most `limit` entries.
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            entries: VecDeque::with_capacity(limit),
            limit,
        }
    }

    /// Append `entry`, evicting the oldest beyond the limit.
    pub fn push(&mut self, entry: ConnectionHistoryEntry) {
        self.entries.push_back(entry);
        while self.entries.len() > self.limit {
            self.entries.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &ConnectionHistoryEntry> {
        self.entries.iter()
    }

    /// Entries that ended at or after `since_ms`.
    pub fn ended_since(&self, since_ms: u64) -> impl Iterator<Item = &ConnectionHistoryEntry> {
        self.entries
            .iter()
            .filter(move |e| e.disconnected_at_ms >= since_ms)
    }

    /// Snapshot for persisting.
    pub fn to_document(&self) -> HistoryDocument {
        HistoryDocument {
            version: HISTORY_VERSION,
            entries: self.entries.iter().cloned().collect(),
        }
    }

    /// Encode as a JSON document.
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&self.to_document())
    }

    /// Decode a stored document. Anything unreadable yields an empty history.
    pub fn decode(bytes: &[u8], limit: usize) -> Self {
        let mut history = Self::new(limit);
        match serde_json::from_slice::<HistoryDocument>(bytes) {
            Ok(doc) => {
                if doc.version > HISTORY_VERSION {
                    tracing::warn!(
                        "Connection history has newer version {} (expected {HISTORY_VERSION}), reading what we understand",
                        doc.version
                    );
                }
                for entry in doc.entries {
                    history.push(entry);
                }
            }
            Err(e) => {
                tracing::warn!("Discarding unreadable connection history: {e}");
            }
        }
        history
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::ProtocolKind;

    fn entry(n: u64) -> ConnectionHistoryEntry {
        ConnectionHistoryEntry {
            world: WorldDescriptor::new(format!("w{n}"), "ws://w", ProtocolKind::DuplexStream),
            connection_id: ConnectionId(n),
            connected_at_ms: n * 1000,
            disconnected_at_ms: n * 1000 + 500,
            duration: Duration::from_millis(500),
            success: true,
            final_status: ConnectionStatus::Connected,
            statistics: ConnectionStatistics::default(),
        }
    }

    #[test]
    fn test_cap_keeps_most_recent() {
        let mut history = ConnectionHistory::new(100);
        for n in 0..150 {
            history.push(entry(n));
        }
        assert_eq!(history.len(), 100);
        let ids: Vec<u64> = history.iter().map(|e| e.connection_id.0).collect();
        assert_eq!(ids.first(), Some(&50));
        assert_eq!(ids.last(), Some(&149));
    }

    #[test]
    fn test_document_roundtrip_preserves_fields() {
        let mut history = ConnectionHistory::new(10);
        let mut e = entry(7);
        e.statistics.bytes_received = 42;
        e.statistics.record_probe(Some(Duration::from_millis(35)));
        e.statistics.last_error = Some("timed out".into());
        e.world.metadata.tags.push("pvp".into());
        history.push(e.clone());

        let decoded = ConnectionHistory::decode(&history.encode().unwrap(), 10);
        assert_eq!(decoded.iter().next(), Some(&e));
    }

    #[test]
    fn test_garbage_decodes_empty() {
        assert!(ConnectionHistory::decode(b"not json", 100).is_empty());
        assert!(ConnectionHistory::decode(b"{\"entries\": 5}", 100).is_empty());
    }

    #[test]
    fn test_missing_fields_default() {
        let json = br#"{"entries":[{"world":{"id":"Alpha"},"success":true}]}"#;
        let history = ConnectionHistory::decode(json, 100);
        let first = history.iter().next().unwrap();
        assert_eq!(first.world.id.as_str(), "Alpha");
        assert!(first.success);
        assert_eq!(first.final_status, ConnectionStatus::Disconnected);
    }

    #[test]
    fn test_decode_applies_limit() {
        let mut big = ConnectionHistory::new(200);
        for n in 0..150 {
            big.push(entry(n));
        }
        let small = ConnectionHistory::decode(&big.encode().unwrap(), 100);
        assert_eq!(small.len(), 100);
        assert_eq!(small.iter().next().map(|e| e.connection_id.0), Some(50));
    }

    #[test]
    fn test_ended_since() {
        let mut history = ConnectionHistory::new(10);
        for n in 1..=5 {
            history.push(entry(n));
        }
        assert_eq!(history.ended_since(3000).count(), 3);
    }
}
