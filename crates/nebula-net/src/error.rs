//! Error taxonomy shared by the transport client and the connection registry.

/// Errors produced by transport operations and connection management.
///
/// Details are carried as strings so the error can be cloned into events,
/// history entries, and `last_error` fields without holding onto I/O handles.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NetError {
    /// The endpoint URL could not be parsed or uses an unsupported scheme.
    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    /// The operation did not complete before its deadline.
    #[error("operation timed out")]
    Timeout,

    /// The server answered with a non-2xx status.
    #[error("HTTP error: status {0}")]
    HttpError(u16),

    /// No channel or record is registered under the given id.
    #[error("connection not found")]
    ConnectionNotFound,

    /// A channel or record already exists under the given id.
    #[error("connection already exists")]
    ConnectionAlreadyExists,

    /// The server rejected the supplied credentials.
    #[error("authentication failed")]
    AuthenticationFailed,

    /// The peer violated the transport protocol or the handshake failed.
    #[error("protocol error: {0}")]
    ProtocolError(String),

    /// The network path is currently unavailable.
    #[error("network unavailable")]
    NetworkUnavailable,
}

impl NetError {
    /// Translate a `reqwest` failure into the transport taxonomy.
    pub(crate) fn from_reqwest(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            NetError::Timeout
        } else if let Some(status) = err.status() {
            NetError::HttpError(status.as_u16())
        } else if err.is_builder() {
            NetError::InvalidUrl(err.to_string())
        } else if err.is_connect() {
            NetError::NetworkUnavailable
        } else {
            NetError::ProtocolError(err.to_string())
        }
    }

    /// Translate a websocket failure into the transport taxonomy.
    pub(crate) fn from_ws(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;

        match err {
            WsError::Url(e) => NetError::InvalidUrl(e.to_string()),
            WsError::Http(response) => match response.status().as_u16() {
                401 | 403 => NetError::AuthenticationFailed,
                status => NetError::HttpError(status),
            },
            WsError::Io(e) => match e.kind() {
                std::io::ErrorKind::TimedOut => NetError::Timeout,
                std::io::ErrorKind::NetworkUnreachable
                | std::io::ErrorKind::HostUnreachable => NetError::NetworkUnavailable,
                _ => NetError::ProtocolError(e.to_string()),
            },
            other => NetError::ProtocolError(other.to_string()),
        }
    }
}
