//! The connection registry.
//!
//! A single worker task owns every [`ConnectionRecord`] and applies all
//! mutations in the order they arrive. Callers talk to it through the
//! cloneable [`ConnectionRegistry`] handle; handshakes, probes, and history
//! writes run on their own tasks and report back over channels.
//!
//! Every handshake attempt runs under a fresh [`ConnectionId`]. Reports and
//! channel events carrying an id other than the record's current one are
//! stale and ignored, so a cancelled attempt can never resurrect a record.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use nebula_config::ConnectionsConfig;
use nebula_net::{CloseReason, ConnectionId, IdGenerator, NetError, StreamEvent};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::{Instant, Interval, MissedTickBehavior};

use crate::connector::Connector;
use crate::events::{EVENT_CAPACITY, RegistryEvent};
use crate::health::ConnectionHealth;
use crate::history::{ConnectionHistory, ConnectionHistoryEntry, DEFAULT_HISTORY_LIMIT, unix_millis};
use crate::record::ConnectionRecord;
use crate::report::{ConnectionReport, WorldLine};
use crate::retry::RetryPolicy;
use crate::statistics::{OverallStatistics, StatisticsDelta};
use crate::status::ConnectionStatus;
use crate::store::KeyValueStore;
use crate::world::{ProtocolKind, WorldDescriptor, WorldId};

/// Key the history is stored under unless configured otherwise.
pub const DEFAULT_HISTORY_KEY: &str = "connection_history";

/// Runtime settings for the registry.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Idle time after which a connected record is stale. Default: 300 s.
    pub stale_threshold: Duration,
    /// Period of the activity sweep (latency probes). Default: 5 s.
    pub activity_interval: Duration,
    /// Period of the staleness sweep. Default: 30 s.
    pub staleness_interval: Duration,
    /// Slack on top of a world's handshake timeout before the registry gives
    /// up on the connector itself. Covers the stream confirmation window.
    pub handshake_grace: Duration,
    /// History entries kept. Default: 100.
    pub history_limit: usize,
    /// Store key for the history.
    pub history_key: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            stale_threshold: Duration::from_secs(300),
            activity_interval: Duration::from_secs(5),
            staleness_interval: Duration::from_secs(30),
            handshake_grace: Duration::from_secs(5),
            history_limit: DEFAULT_HISTORY_LIMIT,
            history_key: DEFAULT_HISTORY_KEY.to_string(),
        }
    }
}

impl From<&ConnectionsConfig> for RegistryConfig {
    fn from(config: &ConnectionsConfig) -> Self {
        Self {
            stale_threshold: Duration::from_secs(config.stale_threshold_secs),
            activity_interval: Duration::from_secs(config.activity_sweep_secs.max(1)),
            staleness_interval: Duration::from_secs(config.staleness_sweep_secs.max(1)),
            history_limit: config.history_limit.max(1),
            history_key: config.history_key.clone(),
            ..Self::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

enum Filter {
    All,
    Status(ConnectionStatus),
    Protocol(ProtocolKind),
}

enum Command {
    Add {
        world: WorldDescriptor,
        reply: oneshot::Sender<Result<ConnectionRecord, NetError>>,
    },
    Remove {
        world_id: WorldId,
        reply: oneshot::Sender<Option<ConnectionHistoryEntry>>,
    },
    Reconnect {
        world_id: WorldId,
        reply: oneshot::Sender<Result<ConnectionStatus, NetError>>,
    },
    UpdateStatistics {
        world_id: WorldId,
        delta: StatisticsDelta,
        reply: oneshot::Sender<Result<(), NetError>>,
    },
    Get {
        world_id: WorldId,
        reply: oneshot::Sender<Option<ConnectionRecord>>,
    },
    List {
        filter: Filter,
        reply: oneshot::Sender<Vec<ConnectionRecord>>,
    },
    Overall {
        reply: oneshot::Sender<OverallStatistics>,
    },
    Health {
        world_id: WorldId,
        reply: oneshot::Sender<ConnectionHealth>,
    },
    History {
        reply: oneshot::Sender<Vec<ConnectionHistoryEntry>>,
    },
    Report {
        window: Duration,
        reply: oneshot::Sender<ConnectionReport>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Results from tasks the worker spawned.
enum TaskReport {
    Handshake {
        world_id: WorldId,
        connection_id: ConnectionId,
        result: Result<(), NetError>,
    },
    Probe {
        world_id: WorldId,
        connection_id: ConnectionId,
        rtt: Option<Duration>,
    },
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Handle to a running registry. Cheap to clone.
///
/// Mutations on a stopped registry fail with `ConnectionNotFound`; queries
/// never fail and return empty answers instead.
#[derive(Clone)]
pub struct ConnectionRegistry {
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<RegistryEvent>,
}

impl ConnectionRegistry {
    /// Start the worker. History is loaded from `store` before the first
    /// command is served.
    pub fn spawn<C: Connector>(
        connector: Arc<C>,
        store: Arc<dyn KeyValueStore>,
        config: RegistryConfig,
        policy: Box<dyn RetryPolicy>,
    ) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (reports_tx, reports_rx) = mpsc::unbounded_channel();
        let (relay_tx, relay_rx) = mpsc::unbounded_channel();
        let (persist_tx, persist_rx) = mpsc::unbounded_channel();

        let writer = tokio::spawn(write_history(
            Arc::clone(&store),
            config.history_key.clone(),
            persist_rx,
        ));

        let worker = Worker {
            connector,
            store,
            policy,
            history: ConnectionHistory::new(config.history_limit),
            config,
            entries: HashMap::new(),
            by_connection: HashMap::new(),
            ids: IdGenerator::new(),
            events: events.clone(),
            reports_tx,
            relay_tx,
            persist_tx: Some(persist_tx),
            writer: Some(writer),
        };
        tokio::spawn(worker.run(command_rx, reports_rx, relay_rx));

        Self { commands, events }
    }

    /// Subscribe to change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    async fn call<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Option<T> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(command(tx)).ok()?;
        rx.await.ok()
    }

    /// Start connecting to `world`. The returned record is `connecting`; the
    /// outcome arrives as a status change.
    pub async fn add_connection(&self, world: WorldDescriptor) -> Result<ConnectionRecord, NetError> {
        self.call(|reply| Command::Add { world, reply })
            .await
            .unwrap_or(Err(NetError::ConnectionNotFound))
    }

    /// Remove a world, cancelling any in-flight work and recording it in the
    /// history. Removing an unknown world is a no-op returning `None`.
    pub async fn remove_connection(&self, world_id: &WorldId) -> Option<ConnectionHistoryEntry> {
        let world_id = world_id.clone();
        self.call(|reply| Command::Remove { world_id, reply })
            .await
            .flatten()
    }

    /// Explicitly reconnect a `connected` or `error` world. Returns the status
    /// after the request; other states are left untouched.
    pub async fn attempt_reconnection(&self, world_id: &WorldId) -> Result<ConnectionStatus, NetError> {
        let world_id = world_id.clone();
        self.call(|reply| Command::Reconnect { world_id, reply })
            .await
            .unwrap_or(Err(NetError::ConnectionNotFound))
    }

    /// Merge a traffic delta into a world's statistics and mark it active.
    pub async fn update_statistics(&self, world_id: &WorldId, delta: StatisticsDelta) -> Result<(), NetError> {
        let world_id = world_id.clone();
        self.call(|reply| Command::UpdateStatistics { world_id, delta, reply })
            .await
            .unwrap_or(Err(NetError::ConnectionNotFound))
    }

    pub async fn get_connection(&self, world_id: &WorldId) -> Option<ConnectionRecord> {
        let world_id = world_id.clone();
        self.call(|reply| Command::Get { world_id, reply }).await.flatten()
    }

    /// Every record, ordered by world id.
    pub async fn active_connections(&self) -> Vec<ConnectionRecord> {
        self.list(Filter::All).await
    }

    pub async fn connections_by_status(&self, status: ConnectionStatus) -> Vec<ConnectionRecord> {
        self.list(Filter::Status(status)).await
    }

    pub async fn connections_for_protocol(&self, protocol: ProtocolKind) -> Vec<ConnectionRecord> {
        self.list(Filter::Protocol(protocol)).await
    }

    async fn list(&self, filter: Filter) -> Vec<ConnectionRecord> {
        self.call(|reply| Command::List { filter, reply })
            .await
            .unwrap_or_default()
    }

    pub async fn overall_statistics(&self) -> OverallStatistics {
        self.call(|reply| Command::Overall { reply })
            .await
            .unwrap_or_default()
    }

    /// Health of a world; unknown worlds are `Disconnected`.
    pub async fn health_of(&self, world_id: &WorldId) -> ConnectionHealth {
        let world_id = world_id.clone();
        self.call(|reply| Command::Health { world_id, reply })
            .await
            .unwrap_or(ConnectionHealth::Disconnected)
    }

    /// Finished connections, oldest first.
    pub async fn history(&self) -> Vec<ConnectionHistoryEntry> {
        self.call(|reply| Command::History { reply })
            .await
            .unwrap_or_default()
    }

    /// Summarize live records and the sessions that ended within `window`.
    pub async fn generate_report(&self, window: Duration) -> ConnectionReport {
        match self.call(|reply| Command::Report { window, reply }).await {
            Some(report) => report,
            None => ConnectionReport::build(
                window,
                unix_millis(SystemTime::now()),
                OverallStatistics::default(),
                Vec::new(),
                std::iter::empty(),
            ),
        }
    }

    /// Remove every record, flush the history, and stop the worker.
    pub async fn shutdown(&self) {
        let _ = self.call(|reply| Command::Shutdown { reply }).await;
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

struct Entry {
    record: ConnectionRecord,
    /// Monotonic twin of `record.last_activity`, used for staleness.
    last_seen: Instant,
    reconnect_attempts: u32,
    handshake: Option<JoinHandle<()>>,
    probe: Option<AbortHandle>,
    /// The channel ended before its handshake result was processed.
    closed_early: bool,
}

impl Entry {
    fn new(record: ConnectionRecord) -> Self {
        Self {
            record,
            last_seen: Instant::now(),
            reconnect_attempts: 0,
            handshake: None,
            probe: None,
            closed_early: false,
        }
    }

    fn touch(&mut self) {
        self.record.last_activity = SystemTime::now();
        self.last_seen = Instant::now();
    }

    fn is_stale(&self, threshold: Duration) -> bool {
        self.record.status == ConnectionStatus::Connected && self.last_seen.elapsed() > threshold
    }

    /// Abort the pending handshake and wait for it to unwind, so a channel it
    /// registered before the abort landed is visible to a later disconnect.
    async fn stop_handshake(&mut self) {
        if let Some(task) = self.handshake.take() {
            task.abort();
            let _ = task.await;
        }
    }

    async fn cancel_tasks(&mut self) {
        self.stop_handshake().await;
        if let Some(task) = self.probe.take() {
            task.abort();
        }
    }
}

/// Move `entry` to `next` if the edge is legal. Returns the previous status.
fn advance(entry: &mut Entry, next: ConnectionStatus, explicit: bool) -> Option<ConnectionStatus> {
    let previous = entry.record.status;
    if !previous.can_transition_to(next, explicit) {
        tracing::warn!(
            "Ignoring illegal transition {previous} -> {next} for {}",
            entry.record.world.id
        );
        return None;
    }
    entry.record.status = next;
    tracing::info!("{}: {previous} -> {next}", entry.record.world.id);
    Some(previous)
}

fn announce(events: &broadcast::Sender<RegistryEvent>, entry: &Entry, previous: ConnectionStatus) {
    let _ = events.send(RegistryEvent::StatusChanged {
        record: entry.record.clone(),
        previous,
    });
}

fn sweep_interval(period: Duration) -> Interval {
    let period = period.max(Duration::from_millis(1));
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

struct Worker<C> {
    connector: Arc<C>,
    store: Arc<dyn KeyValueStore>,
    policy: Box<dyn RetryPolicy>,
    config: RegistryConfig,
    entries: HashMap<WorldId, Entry>,
    by_connection: HashMap<ConnectionId, WorldId>,
    ids: IdGenerator,
    history: ConnectionHistory,
    events: broadcast::Sender<RegistryEvent>,
    reports_tx: mpsc::UnboundedSender<TaskReport>,
    relay_tx: mpsc::UnboundedSender<StreamEvent>,
    persist_tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
    writer: Option<JoinHandle<()>>,
}

impl<C: Connector> Worker<C> {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut reports: mpsc::UnboundedReceiver<TaskReport>,
        mut relay: mpsc::UnboundedReceiver<StreamEvent>,
    ) {
        self.load_history().await;

        let mut activity = sweep_interval(self.config.activity_interval);
        let mut staleness = sweep_interval(self.config.staleness_interval);

        loop {
            tokio::select! {
                biased;
                command = commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        return;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.shutdown().await;
                        return;
                    }
                },
                Some(report) = reports.recv() => self.handle_report(report).await,
                Some(event) = relay.recv() => self.handle_stream_event(event).await,
                _ = activity.tick() => self.activity_sweep(),
                _ = staleness.tick() => self.staleness_sweep().await,
            }
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Add { world, reply } => {
                let _ = reply.send(self.add(world));
            }
            Command::Remove { world_id, reply } => {
                let _ = reply.send(self.remove(&world_id).await);
            }
            Command::Reconnect { world_id, reply } => {
                let _ = reply.send(self.begin_reconnect(&world_id, true).await);
            }
            Command::UpdateStatistics { world_id, delta, reply } => {
                let _ = reply.send(self.update_statistics(&world_id, &delta));
            }
            Command::Get { world_id, reply } => {
                let _ = reply.send(self.entries.get(&world_id).map(|e| e.record.clone()));
            }
            Command::List { filter, reply } => {
                let _ = reply.send(self.list(&filter));
            }
            Command::Overall { reply } => {
                let _ = reply.send(self.overall());
            }
            Command::Health { world_id, reply } => {
                let _ = reply.send(self.health(&world_id));
            }
            Command::History { reply } => {
                let _ = reply.send(self.history.iter().cloned().collect());
            }
            Command::Report { window, reply } => {
                let _ = reply.send(self.report(window));
            }
            Command::Shutdown { .. } => unreachable!("handled by the run loop"),
        }
    }

    async fn handle_report(&mut self, report: TaskReport) {
        match report {
            TaskReport::Handshake {
                world_id,
                connection_id,
                result,
            } => self.on_handshake(world_id, connection_id, result).await,
            TaskReport::Probe {
                world_id,
                connection_id,
                rtt,
            } => self.on_probe(world_id, connection_id, rtt),
        }
    }

    // -- mutations ----------------------------------------------------------

    fn add(&mut self, world: WorldDescriptor) -> Result<ConnectionRecord, NetError> {
        if self.entries.contains_key(&world.id) {
            tracing::warn!("{} is already registered", world.id);
            return Err(NetError::ConnectionAlreadyExists);
        }

        let world_id = world.id.clone();
        let id = self.ids.next_id();
        let mut entry = Entry::new(ConnectionRecord::new(Arc::new(world), id));
        advance(&mut entry, ConnectionStatus::Connecting, false);
        let record = entry.record.clone();

        tracing::info!("Connecting to {world_id} ({}) as {id}", record.world.protocol);
        self.by_connection.insert(id, world_id.clone());
        self.entries.insert(world_id.clone(), entry);
        let _ = self.events.send(RegistryEvent::Added(record.clone()));

        self.spawn_handshake(&world_id, Duration::ZERO);
        Ok(record)
    }

    async fn remove(&mut self, world_id: &WorldId) -> Option<ConnectionHistoryEntry> {
        let mut entry = self.entries.remove(world_id)?;
        entry.cancel_tasks().await;

        let id = entry.record.connection_id;
        self.by_connection.remove(&id);
        self.connector.disconnect(id).await;

        let previous = entry.record.status;
        entry.record.status = ConnectionStatus::Disconnected;

        let now = SystemTime::now();
        let record = &entry.record;
        let finished = ConnectionHistoryEntry {
            world: record.world.snapshot(),
            connection_id: id,
            connected_at_ms: unix_millis(record.connected_at.unwrap_or(record.created_at)),
            disconnected_at_ms: unix_millis(now),
            duration: record
                .connected_at
                .and_then(|at| now.duration_since(at).ok())
                .unwrap_or_default(),
            success: record.ever_connected(),
            final_status: previous,
            statistics: record.statistics.clone(),
        };
        tracing::info!("{world_id}: {previous} -> disconnected (removed)");

        self.history.push(finished.clone());
        self.persist_history();
        let _ = self.events.send(RegistryEvent::Removed {
            world_id: world_id.clone(),
            entry: finished.clone(),
        });
        Some(finished)
    }

    fn update_statistics(&mut self, world_id: &WorldId, delta: &StatisticsDelta) -> Result<(), NetError> {
        let entry = self
            .entries
            .get_mut(world_id)
            .ok_or(NetError::ConnectionNotFound)?;
        entry.record.statistics.apply(delta);
        entry.touch();
        let _ = self
            .events
            .send(RegistryEvent::StatisticsUpdated(entry.record.clone()));
        Ok(())
    }

    /// Enter `reconnecting` and schedule the first attempt.
    async fn begin_reconnect(&mut self, world_id: &WorldId, explicit: bool) -> Result<ConnectionStatus, NetError> {
        let entry = self
            .entries
            .get_mut(world_id)
            .ok_or(NetError::ConnectionNotFound)?;
        let Some(previous) = advance(entry, ConnectionStatus::Reconnecting, explicit) else {
            return Ok(entry.record.status);
        };
        entry.reconnect_attempts = 0;
        entry.closed_early = false;
        entry.stop_handshake().await;
        announce(&self.events, entry, previous);

        self.schedule_attempt(world_id).await;
        Ok(self
            .entries
            .get(world_id)
            .map_or(ConnectionStatus::Disconnected, |e| e.record.status))
    }

    /// Queue the next reconnection attempt, or give up if the world's bound
    /// is spent.
    async fn schedule_attempt(&mut self, world_id: &WorldId) {
        let Some(entry) = self.entries.get_mut(world_id) else {
            return;
        };
        let max = entry.record.world.settings.max_reconnect_attempts;
        if entry.reconnect_attempts >= max {
            tracing::warn!(
                "Giving up on {world_id} after {} reconnection attempts",
                entry.reconnect_attempts
            );
            entry
                .record
                .statistics
                .last_error
                .get_or_insert_with(|| format!("gave up after {max} reconnection attempts"));
            if let Some(previous) = advance(entry, ConnectionStatus::Error, false) {
                announce(&self.events, entry, previous);
            }
            return;
        }

        entry.reconnect_attempts += 1;
        let attempt = entry.reconnect_attempts;
        let delay = self.policy.delay(attempt);
        tracing::info!("Reconnecting {world_id}: attempt {attempt}/{max} in {delay:?}");

        self.rotate_connection(world_id).await;
        self.spawn_handshake(world_id, delay);
    }

    /// Give the record a fresh connection id and release the old channel.
    async fn rotate_connection(&mut self, world_id: &WorldId) {
        let Some(entry) = self.entries.get_mut(world_id) else {
            return;
        };
        entry.stop_handshake().await;
        let fresh = self.ids.next_id();
        let old = std::mem::replace(&mut entry.record.connection_id, fresh);
        self.by_connection.remove(&old);
        self.by_connection.insert(fresh, world_id.clone());
        self.connector.disconnect(old).await;
    }

    fn spawn_handshake(&mut self, world_id: &WorldId, delay: Duration) {
        let Some(entry) = self.entries.get_mut(world_id) else {
            return;
        };
        let connector = Arc::clone(&self.connector);
        let world = Arc::clone(&entry.record.world);
        let id = entry.record.connection_id;
        let relay = self.relay_tx.clone();
        let reports = self.reports_tx.clone();
        let deadline = world.timeout() + self.config.handshake_grace;

        let task = tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let result = match tokio::time::timeout(deadline, connector.connect(&world, id, relay)).await {
                Ok(result) => result,
                Err(_) => Err(NetError::Timeout),
            };
            let _ = reports.send(TaskReport::Handshake {
                world_id: world.id.clone(),
                connection_id: id,
                result,
            });
        });

        if let Some(previous) = entry.handshake.replace(task) {
            previous.abort();
        }
        entry.closed_early = false;
    }

    async fn on_handshake(&mut self, world_id: WorldId, connection_id: ConnectionId, result: Result<(), NetError>) {
        let Some(entry) = self.entries.get_mut(&world_id) else {
            return;
        };
        if entry.record.connection_id != connection_id {
            tracing::debug!("Ignoring stale handshake result for {world_id} ({connection_id})");
            return;
        }
        entry.handshake = None;
        let status = entry.record.status;

        match result {
            Ok(()) => {
                let Some(previous) = advance(entry, ConnectionStatus::Connected, false) else {
                    return;
                };
                if entry.record.connected_at.is_none() {
                    entry.record.connected_at = Some(SystemTime::now());
                }
                if previous == ConnectionStatus::Reconnecting {
                    entry.record.statistics.reconnect_count += 1;
                }
                entry.reconnect_attempts = 0;
                entry.touch();
                announce(&self.events, entry, previous);

                if std::mem::take(&mut entry.closed_early) {
                    self.channel_lost(&world_id).await;
                }
            }
            Err(e) => {
                tracing::warn!("Handshake with {world_id} failed: {e}");
                entry.record.statistics.last_error = Some(e.to_string());
                self.connector.disconnect(connection_id).await;
                match status {
                    ConnectionStatus::Connecting => {
                        if let Some(previous) = advance(entry, ConnectionStatus::Error, false) {
                            announce(&self.events, entry, previous);
                        }
                    }
                    ConnectionStatus::Reconnecting => self.schedule_attempt(&world_id).await,
                    _ => {}
                }
            }
        }
    }

    /// A confirmed channel went away without being asked to.
    async fn channel_lost(&mut self, world_id: &WorldId) {
        let Some(entry) = self.entries.get(world_id) else {
            return;
        };
        if entry.record.world.settings.auto_reconnect {
            let _ = self.begin_reconnect(world_id, false).await;
        } else {
            tracing::info!("{world_id} was closed by the peer");
            self.remove(world_id).await;
        }
    }

    async fn handle_stream_event(&mut self, event: StreamEvent) {
        let id = event.connection_id();
        let Some(world_id) = self.by_connection.get(&id).cloned() else {
            return;
        };
        let Some(entry) = self.entries.get_mut(&world_id) else {
            return;
        };

        match event {
            StreamEvent::Message(_, payload) => {
                entry
                    .record
                    .statistics
                    .apply(&StatisticsDelta::received(payload.len() as u64));
                entry.touch();
                let _ = self
                    .events
                    .send(RegistryEvent::StatisticsUpdated(entry.record.clone()));
            }
            StreamEvent::Closed(_, reason) => {
                match reason {
                    CloseReason::Local => return,
                    CloseReason::Remote => tracing::info!("{world_id}: channel closed by peer"),
                    CloseReason::Error(e) => {
                        tracing::warn!("{world_id}: channel failed: {e}");
                        entry.record.statistics.last_error = Some(e.to_string());
                    }
                }
                self.by_connection.remove(&id);
                if entry.record.status == ConnectionStatus::Connected {
                    self.channel_lost(&world_id).await;
                } else {
                    entry.closed_early = true;
                }
            }
            StreamEvent::Opened(_) | StreamEvent::Failed(..) => {}
        }
    }

    // -- sweeps -------------------------------------------------------------

    fn activity_sweep(&mut self) {
        let mut probes = 0;
        for entry in self.entries.values_mut() {
            if entry.record.status != ConnectionStatus::Connected || entry.probe.is_some() {
                continue;
            }
            let connector = Arc::clone(&self.connector);
            let world = Arc::clone(&entry.record.world);
            let connection_id = entry.record.connection_id;
            let reports = self.reports_tx.clone();
            let task = tokio::spawn(async move {
                let rtt = connector.probe(&world).await;
                let _ = reports.send(TaskReport::Probe {
                    world_id: world.id.clone(),
                    connection_id,
                    rtt,
                });
            });
            entry.probe = Some(task.abort_handle());
            probes += 1;
        }
        tracing::debug!("Activity sweep: {probes} probes started");
    }

    fn on_probe(&mut self, world_id: WorldId, connection_id: ConnectionId, rtt: Option<Duration>) {
        let Some(entry) = self.entries.get_mut(&world_id) else {
            return;
        };
        entry.probe = None;
        if entry.record.connection_id != connection_id || entry.record.status != ConnectionStatus::Connected {
            return;
        }
        entry.record.statistics.record_probe(rtt);
        let _ = self
            .events
            .send(RegistryEvent::StatisticsUpdated(entry.record.clone()));
    }

    async fn staleness_sweep(&mut self) {
        let threshold = self.config.stale_threshold;
        let stale: Vec<WorldId> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_stale(threshold))
            .map(|(id, _)| id.clone())
            .collect();
        tracing::debug!("Staleness sweep: {} stale", stale.len());

        for world_id in stale {
            let auto = self
                .entries
                .get(&world_id)
                .is_some_and(|e| e.record.world.settings.auto_reconnect);
            if auto {
                tracing::info!("{world_id} idle for more than {threshold:?}, reconnecting");
                let _ = self.begin_reconnect(&world_id, false).await;
            } else {
                tracing::debug!("{world_id} is stale but auto-reconnect is off");
            }
        }
    }

    // -- queries ------------------------------------------------------------

    fn sorted_entries(&self) -> Vec<&Entry> {
        let mut entries: Vec<&Entry> = self.entries.values().collect();
        entries.sort_by(|a, b| a.record.world.id.cmp(&b.record.world.id));
        entries
    }

    fn list(&self, filter: &Filter) -> Vec<ConnectionRecord> {
        self.sorted_entries()
            .into_iter()
            .filter(|e| match filter {
                Filter::All => true,
                Filter::Status(status) => e.record.status == *status,
                Filter::Protocol(protocol) => e.record.world.protocol == *protocol,
            })
            .map(|e| e.record.clone())
            .collect()
    }

    fn overall(&self) -> OverallStatistics {
        OverallStatistics::aggregate(self.entries.values().map(|e| {
            (
                &e.record.statistics,
                e.record.status == ConnectionStatus::Connected,
            )
        }))
    }

    fn health_of_entry(&self, entry: &Entry) -> ConnectionHealth {
        ConnectionHealth::assess(
            entry.record.status,
            entry.record.statistics.average_latency(),
            entry.is_stale(self.config.stale_threshold),
        )
    }

    fn health(&self, world_id: &WorldId) -> ConnectionHealth {
        self.entries
            .get(world_id)
            .map_or(ConnectionHealth::Disconnected, |e| self.health_of_entry(e))
    }

    fn report(&self, window: Duration) -> ConnectionReport {
        let now_ms = unix_millis(SystemTime::now());
        let since_ms = now_ms.saturating_sub(window.as_millis() as u64);
        let worlds = self
            .sorted_entries()
            .into_iter()
            .map(|e| WorldLine {
                world_id: e.record.world.id.clone(),
                name: e.record.world.name.clone(),
                protocol: e.record.world.protocol,
                status: e.record.status,
                health: self.health_of_entry(e),
                average_latency: e.record.statistics.average_latency(),
                jitter: e.record.statistics.latency_jitter(),
                packet_loss_rate: e.record.statistics.packet_loss_rate(),
                reconnect_count: e.record.statistics.reconnect_count,
                last_error: e.record.statistics.last_error.clone(),
            })
            .collect();
        ConnectionReport::build(
            window,
            now_ms,
            self.overall(),
            worlds,
            self.history.ended_since(since_ms),
        )
    }

    // -- persistence --------------------------------------------------------

    async fn load_history(&mut self) {
        let store = Arc::clone(&self.store);
        let key = self.config.history_key.clone();
        match tokio::task::spawn_blocking(move || store.load(&key)).await {
            Ok(Ok(Some(bytes))) => {
                self.history = ConnectionHistory::decode(&bytes, self.config.history_limit);
                tracing::info!("Loaded {} connection history entries", self.history.len());
            }
            Ok(Ok(None)) => tracing::debug!("No stored connection history"),
            Ok(Err(e)) => tracing::warn!("Could not read connection history: {e}"),
            Err(e) => tracing::warn!("History load task failed: {e}"),
        }
    }

    fn persist_history(&self) {
        let Some(persist) = &self.persist_tx else {
            return;
        };
        match self.history.encode() {
            Ok(bytes) => {
                let _ = persist.send(bytes);
            }
            Err(e) => tracing::warn!("Could not encode connection history: {e}"),
        }
    }

    async fn shutdown(&mut self) {
        let world_ids: Vec<WorldId> = self.entries.keys().cloned().collect();
        for world_id in world_ids {
            self.remove(&world_id).await;
        }

        // Dropping the sender lets the writer drain and exit.
        self.persist_tx = None;
        if let Some(writer) = self.writer.take() {
            let _ = writer.await;
        }
        tracing::info!("Connection registry stopped");
    }
}

/// Write history snapshots in order, skipping ones already superseded.
async fn write_history(
    store: Arc<dyn KeyValueStore>,
    key: String,
    mut snapshots: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    while let Some(mut bytes) = snapshots.recv().await {
        while let Ok(newer) = snapshots.try_recv() {
            bytes = newer;
        }
        let store = Arc::clone(&store);
        let key = key.clone();
        match tokio::task::spawn_blocking(move || store.save(&key, &bytes)).await {
            Ok(Ok(())) => tracing::debug!("Connection history saved"),
            Ok(Err(e)) => tracing::warn!("Could not save connection history: {e}"),
            Err(e) => tracing::warn!("History write task failed: {e}"),
        }
    }
}
