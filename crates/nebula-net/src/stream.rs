//! Duplex streaming channels over websockets.
//!
//! Each channel runs on its own task. The task owns both halves of the
//! socket: it performs the handshake, waits out a short confirmation window,
//! then multiplexes outbound frames from an `mpsc` queue with inbound frames
//! from the socket. Everything the caller needs to know is reported through
//! one ordered [`StreamEvent`] channel:
//!
//! ```text
//! Opened ─┬─ Message* ─ Closed        (handshake confirmed)
//!         │
//! Failed ─┘                           (handshake failed or timed out)
//! ```
//!
//! Every `Opened` is followed by exactly one `Closed`. A channel closed by
//! the caller before its handshake completes reports nothing.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{RwLock, mpsc, watch};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;

use crate::{Auth, ConnectionId, NetError};

/// Default deadline for a streaming handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);

/// Default confirmation window after the handshake completes.
pub const DEFAULT_CONFIRM_DELAY: Duration = Duration::from_secs(2);

/// An opaque frame carried by a duplex channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// UTF-8 text frame.
    Text(String),
    /// Binary frame.
    Binary(Vec<u8>),
}

impl Payload {
    /// Size of the payload in bytes.
    pub fn len(&self) -> usize {
        match self {
            Payload::Text(s) => s.len(),
            Payload::Binary(b) => b.len(),
        }
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn into_ws(self) -> WsMessage {
        match self {
            Payload::Text(s) => WsMessage::Text(s),
            Payload::Binary(b) => WsMessage::Binary(b),
        }
    }
}

/// Why a confirmed channel ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The caller closed the channel.
    Local,
    /// The peer sent a close frame or ended the stream.
    Remote,
    /// Reading or writing failed.
    Error(NetError),
}

/// Ordered lifecycle and data events for one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// The handshake completed and the channel survived the confirmation window.
    Opened(ConnectionId),
    /// The handshake failed; the channel has been released.
    Failed(ConnectionId, NetError),
    /// A frame arrived.
    Message(ConnectionId, Payload),
    /// A confirmed channel ended; the channel has been released.
    Closed(ConnectionId, CloseReason),
}

impl StreamEvent {
    /// The channel this event belongs to.
    pub fn connection_id(&self) -> ConnectionId {
        match self {
            StreamEvent::Opened(id)
            | StreamEvent::Failed(id, _)
            | StreamEvent::Message(id, _)
            | StreamEvent::Closed(id, _) => *id,
        }
    }
}

/// Per-channel handshake settings.
#[derive(Debug, Clone)]
pub struct StreamOptions {
    /// Deadline for the websocket handshake.
    pub handshake_timeout: Duration,
    /// How long the channel must stay up after the handshake before it is
    /// reported as opened.
    pub confirm_delay: Duration,
    /// Credentials sent with the upgrade request.
    pub auth: Option<Auth>,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            confirm_delay: DEFAULT_CONFIRM_DELAY,
            auth: None,
        }
    }
}

/// Live entry in the channel table.
struct ChannelEntry {
    generation: u64,
    outbound: mpsc::UnboundedSender<Payload>,
    shutdown_tx: watch::Sender<bool>,
}

/// Channel-id → live-channel table. Only the transport client touches it.
#[derive(Clone, Default)]
pub(crate) struct ChannelTable {
    inner: Arc<RwLock<HashMap<ConnectionId, ChannelEntry>>>,
    generations: Arc<AtomicU64>,
}

impl ChannelTable {
    /// Register a channel and spawn its task. Returns once the task is running.
    pub(crate) async fn open(
        &self,
        id: ConnectionId,
        url: &str,
        options: StreamOptions,
        events: mpsc::UnboundedSender<StreamEvent>,
    ) -> Result<(), NetError> {
        let request = build_request(url, options.auth.as_ref())?;

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let generation = self.generations.fetch_add(1, Ordering::Relaxed);

        {
            let mut map = self.inner.write().await;
            if map.contains_key(&id) {
                return Err(NetError::ConnectionAlreadyExists);
            }
            map.insert(
                id,
                ChannelEntry {
                    generation,
                    outbound: outbound_tx,
                    shutdown_tx,
                },
            );
        }

        let table = self.clone();
        tokio::spawn(async move {
            let outcome = run_channel(id, request, options, &events, outbound_rx, shutdown_rx).await;
            table.release(id, generation).await;
            match outcome {
                ChannelOutcome::Failed(err) => {
                    tracing::debug!("Stream {id} handshake failed: {err}");
                    let _ = events.send(StreamEvent::Failed(id, err));
                }
                ChannelOutcome::Closed(reason) => {
                    tracing::debug!("Stream {id} closed: {reason:?}");
                    let _ = events.send(StreamEvent::Closed(id, reason));
                }
                ChannelOutcome::Cancelled => {
                    tracing::debug!("Stream {id} cancelled before it opened");
                }
            }
        });

        Ok(())
    }

    /// Queue a frame on a registered channel.
    pub(crate) async fn send(&self, id: ConnectionId, payload: Payload) -> Result<(), NetError> {
        let map = self.inner.read().await;
        let entry = map.get(&id).ok_or(NetError::ConnectionNotFound)?;
        entry
            .outbound
            .send(payload)
            .map_err(|_| NetError::ConnectionNotFound)
    }

    /// Close a channel. Unknown ids are ignored.
    pub(crate) async fn close(&self, id: ConnectionId) {
        if let Some(entry) = self.inner.write().await.remove(&id) {
            let _ = entry.shutdown_tx.send(true);
        }
    }

    /// Close every channel.
    pub(crate) async fn close_all(&self) {
        let drained: Vec<ChannelEntry> = self.inner.write().await.drain().map(|(_, e)| e).collect();
        for entry in drained {
            let _ = entry.shutdown_tx.send(true);
        }
    }

    /// Whether a channel is registered under `id`.
    pub(crate) async fn contains(&self, id: ConnectionId) -> bool {
        self.inner.read().await.contains_key(&id)
    }

    /// Number of registered channels.
    pub(crate) async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    /// Remove `id` only if it still refers to the channel of `generation`.
    async fn release(&self, id: ConnectionId, generation: u64) {
        let mut map = self.inner.write().await;
        if map.get(&id).is_some_and(|e| e.generation == generation) {
            map.remove(&id);
        }
    }
}

type WsRequest = tokio_tungstenite::tungstenite::handshake::client::Request;

fn build_request(url: &str, auth: Option<&Auth>) -> Result<WsRequest, NetError> {
    match url.split_once("://").map(|(scheme, _)| scheme) {
        Some("ws" | "wss") => {}
        _ => return Err(NetError::InvalidUrl(format!("{url}: expected ws:// or wss://"))),
    }

    let mut request = url.into_client_request().map_err(NetError::from_ws)?;
    if let Some(Auth::Bearer(token)) = auth {
        let value = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|e| NetError::ProtocolError(e.to_string()))?;
        request.headers_mut().insert("authorization", value);
    }
    Ok(request)
}

enum ChannelOutcome {
    Failed(NetError),
    Closed(CloseReason),
    Cancelled,
}

fn is_shutdown(changed: Result<(), watch::error::RecvError>, rx: &watch::Receiver<bool>) -> bool {
    changed.is_err() || *rx.borrow()
}

async fn run_channel(
    id: ConnectionId,
    request: WsRequest,
    options: StreamOptions,
    events: &mpsc::UnboundedSender<StreamEvent>,
    mut outbound_rx: mpsc::UnboundedReceiver<Payload>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> ChannelOutcome {
    let handshake = tokio::time::timeout(
        options.handshake_timeout,
        tokio_tungstenite::connect_async(request),
    );
    tokio::pin!(handshake);
    let ws = loop {
        tokio::select! {
            result = &mut handshake => match result {
                Ok(Ok((ws, _response))) => break ws,
                Ok(Err(e)) => return ChannelOutcome::Failed(NetError::from_ws(e)),
                Err(_) => return ChannelOutcome::Failed(NetError::Timeout),
            },
            changed = shutdown_rx.changed() => {
                if is_shutdown(changed, &shutdown_rx) {
                    return ChannelOutcome::Cancelled;
                }
            }
        }
    };

    let (mut sink, mut source) = ws.split();

    // Frames that arrive during the confirmation window are held back and
    // delivered right after `Opened`.
    let mut early = Vec::new();
    let confirm = tokio::time::sleep(options.confirm_delay);
    tokio::pin!(confirm);
    loop {
        tokio::select! {
            _ = &mut confirm => break,
            changed = shutdown_rx.changed() => {
                if is_shutdown(changed, &shutdown_rx) {
                    let _ = sink.close().await;
                    return ChannelOutcome::Cancelled;
                }
            }
            frame = source.next() => match frame {
                Some(Ok(msg)) => match into_payload(msg) {
                    Inbound::Frame(p) => early.push(p),
                    Inbound::Control => {}
                    Inbound::Close => {
                        return ChannelOutcome::Failed(NetError::ProtocolError(
                            "closed during handshake confirmation".into(),
                        ));
                    }
                },
                Some(Err(e)) => return ChannelOutcome::Failed(NetError::from_ws(e)),
                None => {
                    return ChannelOutcome::Failed(NetError::ProtocolError(
                        "stream ended during handshake confirmation".into(),
                    ));
                }
            }
        }
    }

    let _ = events.send(StreamEvent::Opened(id));
    for payload in early {
        let _ = events.send(StreamEvent::Message(id, payload));
    }

    loop {
        tokio::select! {
            biased;
            changed = shutdown_rx.changed() => {
                if is_shutdown(changed, &shutdown_rx) {
                    let _ = sink.close().await;
                    return ChannelOutcome::Closed(CloseReason::Local);
                }
            }
            outgoing = outbound_rx.recv() => match outgoing {
                Some(payload) => {
                    if let Err(e) = sink.send(payload.into_ws()).await {
                        return ChannelOutcome::Closed(CloseReason::Error(NetError::from_ws(e)));
                    }
                }
                // The table entry (and with it the sender) is gone.
                None => {
                    let _ = sink.close().await;
                    return ChannelOutcome::Closed(CloseReason::Local);
                }
            },
            frame = source.next() => match frame {
                Some(Ok(msg)) => match into_payload(msg) {
                    Inbound::Frame(p) => {
                        let _ = events.send(StreamEvent::Message(id, p));
                    }
                    Inbound::Control => {}
                    Inbound::Close => return ChannelOutcome::Closed(CloseReason::Remote),
                },
                Some(Err(e)) => {
                    return ChannelOutcome::Closed(CloseReason::Error(NetError::from_ws(e)));
                }
                None => return ChannelOutcome::Closed(CloseReason::Remote),
            }
        }
    }
}

enum Inbound {
    Frame(Payload),
    Control,
    Close,
}

fn into_payload(msg: WsMessage) -> Inbound {
    match msg {
        WsMessage::Text(s) => Inbound::Frame(Payload::Text(s)),
        WsMessage::Binary(b) => Inbound::Frame(Payload::Binary(b)),
        WsMessage::Close(_) => Inbound::Close,
        // Pings are answered by tungstenite on the next read/write.
        WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_) => Inbound::Control,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    fn fast_options() -> StreamOptions {
        StreamOptions {
            handshake_timeout: Duration::from_secs(5),
            confirm_delay: Duration::from_millis(50),
            auth: None,
        }
    }

    /// Accept one websocket client and echo every data frame back.
    async fn echo_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            while let Some(Ok(msg)) = ws.next().await {
                if msg.is_text() || msg.is_binary() {
                    if ws.send(msg).await.is_err() {
                        break;
                    }
                }
            }
        });
        format!("ws://{addr}")
    }

    /// Accept one websocket client, send `frames`, then close.
    async fn push_then_close_server(frames: Vec<&'static str>, hold: Duration) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            tokio::time::sleep(hold).await;
            for f in frames {
                ws.send(WsMessage::Text(f.to_string())).await.unwrap();
            }
            let _ = ws.close(None).await;
        });
        format!("ws://{addr}")
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<StreamEvent>) -> StreamEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("event in time")
            .expect("channel open")
    }

    #[tokio::test]
    async fn test_open_send_receive_close() {
        let table = ChannelTable::default();
        let url = echo_server().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = ConnectionId(1);

        table.open(id, &url, fast_options(), tx).await.unwrap();
        assert_eq!(next_event(&mut rx).await, StreamEvent::Opened(id));

        table.send(id, Payload::Text("a".into())).await.unwrap();
        table.send(id, Payload::Binary(vec![1, 2])).await.unwrap();
        assert_eq!(next_event(&mut rx).await, StreamEvent::Message(id, Payload::Text("a".into())));
        assert_eq!(next_event(&mut rx).await, StreamEvent::Message(id, Payload::Binary(vec![1, 2])));

        table.close(id).await;
        assert_eq!(next_event(&mut rx).await, StreamEvent::Closed(id, CloseReason::Local));
        assert!(!table.contains(id).await);
    }

    #[tokio::test]
    async fn test_frames_delivered_in_arrival_order_then_single_close() {
        let table = ChannelTable::default();
        let url = push_then_close_server(vec!["1", "2", "3", "4"], Duration::from_millis(150)).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = ConnectionId(9);

        table.open(id, &url, fast_options(), tx).await.unwrap();
        assert_eq!(next_event(&mut rx).await, StreamEvent::Opened(id));
        for expected in ["1", "2", "3", "4"] {
            assert_eq!(
                next_event(&mut rx).await,
                StreamEvent::Message(id, Payload::Text(expected.into()))
            );
        }
        assert_eq!(next_event(&mut rx).await, StreamEvent::Closed(id, CloseReason::Remote));

        // Sender side is dropped once the task is done: no second close.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
        assert!(!table.contains(id).await);
    }

    #[tokio::test]
    async fn test_close_during_confirmation_window_fails_open() {
        let table = ChannelTable::default();
        let url = push_then_close_server(vec![], Duration::ZERO).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = ConnectionId(2);

        let options = StreamOptions {
            confirm_delay: Duration::from_millis(500),
            ..fast_options()
        };
        table.open(id, &url, options, tx).await.unwrap();
        assert!(matches!(
            next_event(&mut rx).await,
            StreamEvent::Failed(got, NetError::ProtocolError(_)) if got == id
        ));
    }

    #[tokio::test]
    async fn test_refused_connection_reports_failed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let table = ChannelTable::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = ConnectionId(3);
        table.open(id, &format!("ws://{addr}"), fast_options(), tx).await.unwrap();

        assert!(matches!(next_event(&mut rx).await, StreamEvent::Failed(got, _) if got == id));
        assert_eq!(table.len().await, 0);
    }

    #[tokio::test]
    async fn test_send_to_unknown_id_fails() {
        let table = ChannelTable::default();
        let result = table.send(ConnectionId(42), Payload::Text("x".into())).await;
        assert_eq!(result, Err(NetError::ConnectionNotFound));
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let table = ChannelTable::default();
        let url = echo_server().await;
        let (tx, _rx) = mpsc::unbounded_channel();
        let id = ConnectionId(4);
        table.open(id, &url, fast_options(), tx.clone()).await.unwrap();
        assert_eq!(
            table.open(id, &url, fast_options(), tx).await,
            Err(NetError::ConnectionAlreadyExists)
        );
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let table = ChannelTable::default();
        let url = echo_server().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = ConnectionId(5);
        table.open(id, &url, fast_options(), tx).await.unwrap();
        assert_eq!(next_event(&mut rx).await, StreamEvent::Opened(id));

        table.close(id).await;
        table.close(id).await;
        table.close(ConnectionId(999)).await;

        assert_eq!(next_event(&mut rx).await, StreamEvent::Closed(id, CloseReason::Local));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_close_before_handshake_reports_nothing() {
        // A listener that never completes the websocket upgrade.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
        });

        let table = ChannelTable::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = ConnectionId(6);
        table.open(id, &format!("ws://{addr}"), fast_options(), tx).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        table.close(id).await;

        // The task drops its event sender without reporting anything.
        let got = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap();
        assert!(got.is_none());
    }

    #[test]
    fn test_http_scheme_rejected_for_streams() {
        assert!(matches!(
            build_request("http://example.com", None),
            Err(NetError::InvalidUrl(_))
        ));
    }

    #[test]
    fn test_bearer_token_sets_authorization_header() {
        let request =
            build_request("ws://example.com/world", Some(&Auth::Bearer("abc".into()))).unwrap();
        assert_eq!(request.headers()["authorization"], "Bearer abc");
    }
}
