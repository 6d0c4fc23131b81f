//! The transport client: one pooled request/response channel, any number of
//! duplex streams, reachability, and latency probing.
//!
//! A [`TransportClient`] is an ordinary value. Construct one per process (or
//! per test) and share it by reference or `Arc`; nothing here is global.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;

use crate::diagnostics::{self, PROBE_TIMEOUT};
use crate::reachability::{self, PathProbe, Reachability, ReachabilityWatch};
use crate::request::{self, DEFAULT_REQUEST_TIMEOUT, Request};
use crate::stream::{
    ChannelTable, DEFAULT_CONFIRM_DELAY, DEFAULT_HANDSHAKE_TIMEOUT, Payload, StreamEvent,
    StreamOptions,
};
use crate::{ConnectionId, NetError};

/// Runtime settings for a [`TransportClient`].
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Default deadline for request/response exchanges. Default: 30 s.
    pub request_timeout: Duration,
    /// Default deadline for streaming handshakes. Default: 15 s.
    pub handshake_timeout: Duration,
    /// Confirmation window after a streaming handshake. Default: 2 s.
    pub confirm_delay: Duration,
    /// Upper bound on a latency probe. Default: 5 s.
    pub probe_timeout: Duration,
    /// How often the path monitor re-checks reachability. Default: 5 s.
    pub reachability_interval: Duration,
    /// `User-Agent` sent with every request.
    pub user_agent: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            confirm_delay: DEFAULT_CONFIRM_DELAY,
            probe_timeout: PROBE_TIMEOUT,
            reachability_interval: Duration::from_secs(5),
            user_agent: concat!("nebula-net/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl From<&nebula_config::NetworkConfig> for TransportConfig {
    fn from(config: &nebula_config::NetworkConfig) -> Self {
        Self {
            request_timeout: Duration::from_secs(config.request_timeout_secs),
            handshake_timeout: Duration::from_secs(config.stream_handshake_timeout_secs),
            confirm_delay: Duration::from_millis(config.stream_confirm_delay_ms),
            probe_timeout: Duration::from_secs(config.probe_timeout_secs).min(PROBE_TIMEOUT),
            reachability_interval: Duration::from_secs(config.reachability_interval_secs.max(1)),
            user_agent: config.user_agent.clone(),
        }
    }
}

/// Handle to the path-monitor task.
struct PathMonitor {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Performs network requests and streams and reports low-level network
/// health. Knows nothing about worlds.
pub struct TransportClient {
    config: TransportConfig,
    http: reqwest::Client,
    channels: ChannelTable,
    reachability: Arc<ReachabilityWatch>,
    monitor: Mutex<Option<PathMonitor>>,
}

impl TransportClient {
    /// Build a client with the given settings.
    pub fn new(config: TransportConfig) -> Result<Self, NetError> {
        let http = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| NetError::ProtocolError(format!("HTTP client setup failed: {e}")))?;

        Ok(Self {
            config,
            http,
            channels: ChannelTable::default(),
            reachability: Arc::new(ReachabilityWatch::new()),
            monitor: Mutex::new(None),
        })
    }

    /// Settings this client was built with.
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    // -----------------------------------------------------------------------
    // Reachability
    // -----------------------------------------------------------------------

    /// Current connectivity and interface kind.
    pub fn reachability(&self) -> Reachability {
        self.reachability.current()
    }

    /// Subscribe to reachability changes.
    pub fn subscribe_reachability(&self) -> watch::Receiver<Reachability> {
        self.reachability.subscribe()
    }

    /// Start (or restart) the background path monitor with `probe`.
    pub async fn monitor_path<P: PathProbe>(&self, probe: P) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(reachability::monitor_loop(
            probe,
            self.config.reachability_interval,
            Arc::clone(&self.reachability),
            shutdown_rx,
        ));

        let previous = self.monitor.lock().await.replace(PathMonitor {
            shutdown_tx,
            handle,
        });
        if let Some(previous) = previous {
            let _ = previous.shutdown_tx.send(true);
        }
    }

    /// Stop the path monitor, waiting for it to exit.
    pub async fn stop_path_monitor(&self) {
        let monitor = self.monitor.lock().await.take();
        if let Some(monitor) = monitor {
            let _ = monitor.shutdown_tx.send(true);
            let _ = monitor.handle.await;
        }
    }

    // -----------------------------------------------------------------------
    // Latency
    // -----------------------------------------------------------------------

    /// Time a lightweight probe to `target`. `None` means unknown (error or
    /// timeout, bounded at 5 s).
    pub async fn probe_latency(&self, target: &str) -> Option<Duration> {
        diagnostics::probe(&self.http, target, self.config.probe_timeout).await
    }

    // -----------------------------------------------------------------------
    // Request/response
    // -----------------------------------------------------------------------

    /// Perform one request/response exchange; returns the body on 2xx.
    pub async fn request(&self, request: Request) -> Result<Vec<u8>, NetError> {
        request::perform(&self.http, request).await
    }

    // -----------------------------------------------------------------------
    // Duplex streams
    // -----------------------------------------------------------------------

    /// Stream options derived from this client's defaults.
    pub fn stream_options(&self) -> StreamOptions {
        StreamOptions {
            handshake_timeout: self.config.handshake_timeout,
            confirm_delay: self.config.confirm_delay,
            auth: None,
        }
    }

    /// Open a duplex channel under `id`.
    ///
    /// Returns as soon as the channel is registered; the handshake proceeds in
    /// the background and its outcome arrives on `events`.
    pub async fn open_stream(
        &self,
        id: ConnectionId,
        url: &str,
        options: StreamOptions,
        events: mpsc::UnboundedSender<StreamEvent>,
    ) -> Result<(), NetError> {
        tracing::debug!("Opening stream {id} to {url}");
        self.channels.open(id, url, options, events).await
    }

    /// Queue `payload` on channel `id`. Frames queued by one caller are sent
    /// in the order queued.
    pub async fn send_stream(&self, id: ConnectionId, payload: Payload) -> Result<(), NetError> {
        self.channels.send(id, payload).await
    }

    /// Close channel `id`, cancelling its handshake if still in flight.
    /// Unknown ids are ignored.
    pub async fn close_stream(&self, id: ConnectionId) {
        self.channels.close(id).await;
    }

    /// Close every channel.
    pub async fn close_all(&self) {
        self.channels.close_all().await;
    }

    /// Whether a channel is registered under `id`.
    pub async fn has_stream(&self, id: ConnectionId) -> bool {
        self.channels.contains(id).await
    }

    /// Number of registered channels.
    pub async fn stream_count(&self) -> usize {
        self.channels.len().await
    }
}

impl Drop for TransportClient {
    fn drop(&mut self) {
        if let Some(monitor) = self.monitor.get_mut().take() {
            let _ = monitor.shutdown_tx.send(true);
            monitor.handle.abort();
        }
    }
}
