//! World descriptors: identity and connection settings for a remote world.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use nebula_net::Auth;
use serde::{Deserialize, Serialize};

/// Unique identifier of a world.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorldId(pub String);

impl WorldId {
    /// Create an id from anything string-like.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorldId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WorldId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// How the client talks to a world.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProtocolKind {
    /// Stateless exchanges; the handshake is a single request.
    RequestResponse,
    /// A persistent bidirectional channel.
    DuplexStream,
    /// No network at all.
    LocalOnly,
}

impl ProtocolKind {
    /// Handshake deadline used when a world does not set one.
    pub fn default_timeout(self) -> Duration {
        match self {
            ProtocolKind::RequestResponse => Duration::from_secs(30),
            ProtocolKind::DuplexStream => Duration::from_secs(15),
            ProtocolKind::LocalOnly => Duration::from_secs(1),
        }
    }

    /// Guess the protocol from a URL scheme. Anything that is neither
    /// websocket nor HTTP is treated as local.
    pub fn for_url(url: &str) -> Self {
        let scheme = url.split_once("://").map_or("", |(scheme, _)| scheme);
        match scheme.to_ascii_lowercase().as_str() {
            "ws" | "wss" => ProtocolKind::DuplexStream,
            "http" | "https" => ProtocolKind::RequestResponse,
            _ => ProtocolKind::LocalOnly,
        }
    }
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ProtocolKind::RequestResponse => "request-response",
            ProtocolKind::DuplexStream => "duplex-stream",
            ProtocolKind::LocalOnly => "local-only",
        })
    }
}

/// Credentials presented during the handshake. Never persisted.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Account name.
    pub username: String,
    /// Password or session token.
    pub secret: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("secret", &"<redacted>")
            .finish()
    }
}

impl Credentials {
    /// Transport-level auth for a request/response handshake.
    pub fn http_auth(&self) -> Auth {
        Auth::Basic {
            username: self.username.clone(),
            password: self.secret.clone(),
        }
    }

    /// Transport-level auth for a stream upgrade.
    pub fn stream_auth(&self) -> Auth {
        Auth::Bearer(self.secret.clone())
    }
}

/// Per-protocol connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolSettings {
    /// Handshake deadline. `None` uses the protocol default.
    pub timeout: Option<Duration>,
    /// Reconnect automatically after staleness or a remote close.
    pub auto_reconnect: bool,
    /// Reconnection attempts before giving up.
    pub max_reconnect_attempts: u32,
    /// Ask for compressed payloads where the protocol supports it.
    pub compression: bool,
    /// Require a secure scheme (`https`/`wss`).
    pub encryption: bool,
}

impl Default for ProtocolSettings {
    fn default() -> Self {
        Self {
            timeout: None,
            auto_reconnect: true,
            max_reconnect_attempts: 5,
            compression: false,
            encryption: false,
        }
    }
}

/// Free-form descriptive metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorldMetadata {
    /// Feature tags advertised by the world.
    pub tags: Vec<String>,
    /// Maturity rating, if any.
    pub maturity: Option<String>,
    /// Anything else the catalog knows.
    pub extra: BTreeMap<String, String>,
}

/// Immutable identity and configuration of a world.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorldDescriptor {
    /// Unique id.
    pub id: WorldId,
    /// Display name.
    pub name: String,
    /// Endpoint URL.
    pub url: String,
    /// Protocol used to reach the endpoint.
    pub protocol: ProtocolKind,
    /// Credentials for the handshake.
    #[serde(skip)]
    pub credentials: Option<Credentials>,
    /// Protocol settings.
    pub settings: ProtocolSettings,
    /// Descriptive metadata.
    pub metadata: WorldMetadata,
}

impl Default for WorldDescriptor {
    fn default() -> Self {
        Self {
            id: WorldId::default(),
            name: String::new(),
            url: String::new(),
            protocol: ProtocolKind::RequestResponse,
            credentials: None,
            settings: ProtocolSettings::default(),
            metadata: WorldMetadata::default(),
        }
    }
}

impl WorldDescriptor {
    /// Create a descriptor whose id and display name are both `name`.
    pub fn new(name: impl Into<String>, url: impl Into<String>, protocol: ProtocolKind) -> Self {
        let name = name.into();
        Self {
            id: WorldId(name.clone()),
            name,
            url: url.into(),
            protocol,
            ..Self::default()
        }
    }

    /// Replace the settings.
    pub fn with_settings(mut self, settings: ProtocolSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Attach credentials.
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Effective handshake deadline.
    pub fn timeout(&self) -> Duration {
        self.settings
            .timeout
            .unwrap_or_else(|| self.protocol.default_timeout())
    }

    /// Whether the URL uses a secure scheme.
    pub fn has_secure_scheme(&self) -> bool {
        self.url.starts_with("https://") || self.url.starts_with("wss://")
    }

    /// Copy suitable for persisting: credentials removed.
    pub fn snapshot(&self) -> Self {
        Self {
            credentials: None,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_default_timeouts() {
        assert_eq!(ProtocolKind::RequestResponse.default_timeout(), Duration::from_secs(30));
        assert_eq!(ProtocolKind::DuplexStream.default_timeout(), Duration::from_secs(15));
    }

    #[test]
    fn test_protocol_from_scheme() {
        assert_eq!(ProtocolKind::for_url("wss://alpha:9000"), ProtocolKind::DuplexStream);
        assert_eq!(ProtocolKind::for_url("HTTP://beta/login"), ProtocolKind::RequestResponse);
        assert_eq!(ProtocolKind::for_url("file:///tmp/home"), ProtocolKind::LocalOnly);
        assert_eq!(ProtocolKind::for_url("home"), ProtocolKind::LocalOnly);
    }

    #[test]
    fn test_explicit_timeout_wins() {
        let world = WorldDescriptor::new("Alpha", "ws://a", ProtocolKind::DuplexStream)
            .with_settings(ProtocolSettings {
                timeout: Some(Duration::from_secs(3)),
                ..Default::default()
            });
        assert_eq!(world.timeout(), Duration::from_secs(3));
    }

    #[test]
    fn test_snapshot_strips_credentials() {
        let world = WorldDescriptor::new("Alpha", "ws://a", ProtocolKind::DuplexStream)
            .with_credentials(Credentials {
                username: "ann".into(),
                secret: "hunter2".into(),
            });
        assert!(world.snapshot().credentials.is_none());
        assert!(!format!("{world:?}").contains("hunter2"));
    }

    #[test]
    fn test_serialized_descriptor_omits_credentials() {
        let world = WorldDescriptor::new("Alpha", "ws://a", ProtocolKind::DuplexStream)
            .with_credentials(Credentials {
                username: "ann".into(),
                secret: "hunter2".into(),
            });
        let json = serde_json::to_string(&world).unwrap();
        assert!(!json.contains("hunter2"));
        assert!(json.contains("\"duplex-stream\""));
    }

    #[test]
    fn test_missing_fields_default() {
        let world: WorldDescriptor = serde_json::from_str(r#"{"id":"Gamma","url":"http://g"}"#).unwrap();
        assert_eq!(world.id, WorldId::new("Gamma"));
        assert_eq!(world.protocol, ProtocolKind::RequestResponse);
        assert!(world.settings.auto_reconnect);
    }

    #[test]
    fn test_secure_scheme_detection() {
        assert!(WorldDescriptor::new("a", "wss://x", ProtocolKind::DuplexStream).has_secure_scheme());
        assert!(!WorldDescriptor::new("a", "http://x", ProtocolKind::RequestResponse).has_secure_scheme());
    }
}
