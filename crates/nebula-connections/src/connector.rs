//! The seam between the registry and the transport.
//!
//! The registry never touches sockets. It asks a [`Connector`] to perform a
//! world's handshake, to drop a channel, and to time a probe, and it hears
//! about later channel traffic through the relay sender handed to `connect`.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use nebula_net::{ConnectionId, NetError, Request, StreamEvent, TransportClient};
use tokio::sync::mpsc;

use crate::world::{Credentials, ProtocolKind, WorldDescriptor};

/// Performs handshakes and probes on behalf of the registry.
pub trait Connector: Send + Sync + 'static {
    /// Establish `world`'s channel under `id`.
    ///
    /// Resolves once the handshake has succeeded or failed. For channels that
    /// outlive the handshake, every later event for `id` goes to `relay`.
    fn connect(
        &self,
        world: &WorldDescriptor,
        id: ConnectionId,
        relay: mpsc::UnboundedSender<StreamEvent>,
    ) -> impl Future<Output = Result<(), NetError>> + Send;

    /// Release whatever is held under `id`. Unknown ids are ignored.
    fn disconnect(&self, id: ConnectionId) -> impl Future<Output = ()> + Send;

    /// Round-trip time to `world`, or `None` if unknown.
    fn probe(&self, world: &WorldDescriptor) -> impl Future<Output = Option<Duration>> + Send;
}

/// [`Connector`] backed by a [`TransportClient`].
#[derive(Clone)]
pub struct TransportConnector {
    client: Arc<TransportClient>,
}

impl TransportConnector {
    pub fn new(client: Arc<TransportClient>) -> Self {
        Self { client }
    }

    /// The wrapped transport.
    pub fn client(&self) -> &Arc<TransportClient> {
        &self.client
    }

    async fn request_handshake(&self, world: &WorldDescriptor) -> Result<(), NetError> {
        let mut request = Request::get(world.url.as_str()).timeout(world.timeout());
        if let Some(credentials) = &world.credentials {
            request = request.auth(credentials.http_auth());
        }
        match self.client.request(request).await {
            Ok(_) => Ok(()),
            Err(NetError::HttpError(401 | 403)) => Err(NetError::AuthenticationFailed),
            Err(e) => Err(e),
        }
    }

    async fn stream_handshake(
        &self,
        world: &WorldDescriptor,
        id: ConnectionId,
        relay: mpsc::UnboundedSender<StreamEvent>,
    ) -> Result<(), NetError> {
        let mut options = self.client.stream_options();
        options.handshake_timeout = world.timeout();
        options.auth = world.credentials.as_ref().map(Credentials::stream_auth);

        let (tx, mut rx) = mpsc::unbounded_channel();
        self.client.open_stream(id, &world.url, options, tx).await?;

        // The first event settles the handshake; everything after is relayed.
        match rx.recv().await {
            Some(StreamEvent::Opened(_)) => {
                tokio::spawn(async move {
                    while let Some(event) = rx.recv().await {
                        if relay.send(event).is_err() {
                            break;
                        }
                    }
                });
                Ok(())
            }
            Some(StreamEvent::Failed(_, e)) => Err(e),
            Some(other) => Err(NetError::ProtocolError(format!(
                "unexpected {other:?} before the channel opened"
            ))),
            None => Err(NetError::ProtocolError(
                "channel ended during handshake".to_string(),
            )),
        }
    }
}

impl Connector for TransportConnector {
    async fn connect(
        &self,
        world: &WorldDescriptor,
        id: ConnectionId,
        relay: mpsc::UnboundedSender<StreamEvent>,
    ) -> Result<(), NetError> {
        if !self.client.reachability().is_reachable() && world.protocol != ProtocolKind::LocalOnly {
            return Err(NetError::NetworkUnavailable);
        }
        if world.settings.encryption && !world.has_secure_scheme() {
            return Err(NetError::ProtocolError(format!(
                "{} requires an encrypted scheme, got {}",
                world.id, world.url
            )));
        }

        match world.protocol {
            ProtocolKind::LocalOnly => Ok(()),
            ProtocolKind::RequestResponse => self.request_handshake(world).await,
            ProtocolKind::DuplexStream => self.stream_handshake(world, id, relay).await,
        }
    }

    async fn disconnect(&self, id: ConnectionId) {
        self.client.close_stream(id).await;
    }

    async fn probe(&self, world: &WorldDescriptor) -> Option<Duration> {
        match world.protocol {
            ProtocolKind::LocalOnly => Some(Duration::ZERO),
            _ => self.client.probe_latency(&world.url).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::ProtocolSettings;
    use futures_util::{SinkExt, StreamExt};
    use nebula_net::{
        CloseReason, InterfaceKind, Payload, PathProbe, PathStatus, Reachability, TransportConfig,
    };
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;
    use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;

    fn connector() -> TransportConnector {
        let config = TransportConfig {
            confirm_delay: Duration::from_millis(50),
            ..Default::default()
        };
        TransportConnector::new(Arc::new(TransportClient::new(config).unwrap()))
    }

    /// Serve one HTTP/1.1 connection with a canned status line.
    async fn canned_server(status_line: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            let _ = stream.read(&mut buf).await;
            let response = format!("HTTP/1.1 {status_line}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n");
            let _ = stream.write_all(response.as_bytes()).await;
        });
        format!("http://{addr}/login")
    }

    /// Accept one websocket client, greet it, then close after `hold`.
    async fn greeting_server(hold: Duration) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            tokio::time::sleep(hold).await;
            ws.send(WsMessage::Text("welcome".to_string())).await.unwrap();
            let _ = ws.close(None).await;
            while ws.next().await.is_some() {}
        });
        format!("ws://{addr}")
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<StreamEvent>) -> StreamEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("event in time")
            .expect("relay open")
    }

    struct Offline;

    impl PathProbe for Offline {
        fn check(&self) -> impl Future<Output = Reachability> + Send {
            async { Reachability::UNSATISFIED }
        }
    }

    #[tokio::test]
    async fn test_local_only_connects_immediately() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let world = WorldDescriptor::new("Home", "", ProtocolKind::LocalOnly);
        assert_eq!(connector().connect(&world, ConnectionId(1), tx).await, Ok(()));
    }

    #[tokio::test]
    async fn test_encryption_requires_secure_scheme() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let world = WorldDescriptor::new("Alpha", "ws://127.0.0.1:1", ProtocolKind::DuplexStream)
            .with_settings(ProtocolSettings {
                encryption: true,
                ..Default::default()
            });
        let result = connector().connect(&world, ConnectionId(1), tx).await;
        assert!(matches!(result, Err(NetError::ProtocolError(_))));
    }

    #[tokio::test]
    async fn test_request_handshake_ok() {
        let url = canned_server("204 No Content").await;
        let (tx, _rx) = mpsc::unbounded_channel();
        let world = WorldDescriptor::new("Beta", url, ProtocolKind::RequestResponse);
        assert_eq!(connector().connect(&world, ConnectionId(1), tx).await, Ok(()));
    }

    #[tokio::test]
    async fn test_unauthorized_maps_to_authentication_failed() {
        let url = canned_server("401 Unauthorized").await;
        let (tx, _rx) = mpsc::unbounded_channel();
        let world = WorldDescriptor::new("Beta", url, ProtocolKind::RequestResponse)
            .with_credentials(Credentials {
                username: "ann".into(),
                secret: "wrong".into(),
            });
        let result = connector().connect(&world, ConnectionId(1), tx).await;
        assert_eq!(result, Err(NetError::AuthenticationFailed));
    }

    #[tokio::test]
    async fn test_unsatisfied_path_fails_fast() {
        let connector = connector();
        let mut rx = connector.client().subscribe_reachability();
        connector.client().monitor_path(Offline).await;
        rx.changed().await.unwrap();

        let (tx, _relay) = mpsc::unbounded_channel();
        let world = WorldDescriptor::new("Beta", "http://127.0.0.1:1", ProtocolKind::RequestResponse);
        let result = connector.connect(&world, ConnectionId(1), tx).await;
        assert_eq!(result, Err(NetError::NetworkUnavailable));

        // Local worlds do not need a network path.
        let (tx, _relay) = mpsc::unbounded_channel();
        let home = WorldDescriptor::new("Home", "", ProtocolKind::LocalOnly);
        assert_eq!(connector.connect(&home, ConnectionId(2), tx).await, Ok(()));
        assert_eq!(connector.client().reachability().interface, InterfaceKind::None);
        assert_eq!(connector.client().reachability().status, PathStatus::Unsatisfied);
        connector.client().stop_path_monitor().await;
    }

    #[tokio::test]
    async fn test_stream_handshake_then_relay() {
        let url = greeting_server(Duration::from_millis(200)).await;
        let connector = connector();
        let (relay_tx, mut relay_rx) = mpsc::unbounded_channel();
        let world = WorldDescriptor::new("Alpha", url, ProtocolKind::DuplexStream);
        let id = ConnectionId(9);

        connector.connect(&world, id, relay_tx).await.unwrap();
        assert!(connector.client().has_stream(id).await);

        assert_eq!(
            next(&mut relay_rx).await,
            StreamEvent::Message(id, Payload::Text("welcome".into()))
        );
        assert_eq!(next(&mut relay_rx).await, StreamEvent::Closed(id, CloseReason::Remote));
    }

    #[tokio::test]
    async fn test_stream_refused_fails_handshake() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (tx, _rx) = mpsc::unbounded_channel();
        let world = WorldDescriptor::new("Alpha", format!("ws://{addr}"), ProtocolKind::DuplexStream);
        let connector = connector();
        assert!(connector.connect(&world, ConnectionId(3), tx).await.is_err());
        assert!(!connector.client().has_stream(ConnectionId(3)).await);
    }

    #[tokio::test]
    async fn test_disconnect_unknown_is_noop() {
        connector().disconnect(ConnectionId(42)).await;
    }

    #[tokio::test]
    async fn test_local_probe_is_zero() {
        let world = WorldDescriptor::new("Home", "", ProtocolKind::LocalOnly);
        assert_eq!(connector().probe(&world).await, Some(Duration::ZERO));
    }
}
