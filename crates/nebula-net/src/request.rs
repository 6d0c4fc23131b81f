//! Single request/response exchanges over the pooled HTTP client.

use std::time::Duration;

pub use reqwest::Method;
use reqwest::Url;

use crate::NetError;

/// Default deadline for a request/response exchange.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Credentials attached to a request or stream handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Auth {
    /// `Authorization: Bearer <token>`.
    Bearer(String),
    /// HTTP basic authentication.
    Basic {
        /// Account name.
        username: String,
        /// Password or secret.
        password: String,
    },
}

/// Description of one request/response exchange.
#[derive(Debug, Clone)]
pub struct Request {
    /// Target URL (`http` or `https`).
    pub url: String,
    /// HTTP method.
    pub method: Method,
    /// Optional request body.
    pub body: Option<Vec<u8>>,
    /// Extra headers, sent in order.
    pub headers: Vec<(String, String)>,
    /// Optional credentials.
    pub auth: Option<Auth>,
    /// Deadline for the whole exchange, including reading the body.
    pub timeout: Duration,
}

impl Request {
    /// Create a request with the given method and the default timeout.
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method,
            body: None,
            headers: Vec::new(),
            auth: None,
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Shorthand for a `GET` request.
    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    /// Shorthand for a `POST` request carrying `body`.
    pub fn post(url: impl Into<String>, body: Vec<u8>) -> Self {
        Self::new(Method::POST, url).body(body)
    }

    /// Set the request body.
    pub fn body(mut self, body: Vec<u8>) -> Self {
        self.body = Some(body);
        self
    }

    /// Append a header.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Attach credentials.
    pub fn auth(mut self, auth: Auth) -> Self {
        self.auth = Some(auth);
        self
    }

    /// Override the deadline.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Parse `url` and require an HTTP scheme.
pub(crate) fn parse_http_url(url: &str) -> Result<Url, NetError> {
    let parsed = Url::parse(url).map_err(|e| NetError::InvalidUrl(format!("{url}: {e}")))?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        other => Err(NetError::InvalidUrl(format!(
            "{url}: unsupported scheme '{other}'"
        ))),
    }
}

/// Perform one exchange and return the response body on 2xx.
///
/// The transport never retries; a failed exchange is reported once.
pub(crate) async fn perform(client: &reqwest::Client, request: Request) -> Result<Vec<u8>, NetError> {
    let url = parse_http_url(&request.url)?;

    let mut builder = client
        .request(request.method.clone(), url)
        .timeout(request.timeout);
    for (name, value) in &request.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    builder = match request.auth {
        Some(Auth::Bearer(token)) => builder.bearer_auth(token),
        Some(Auth::Basic { username, password }) => builder.basic_auth(username, Some(password)),
        None => builder,
    };
    if let Some(body) = request.body {
        builder = builder.body(body);
    }

    let response = builder.send().await.map_err(|e| NetError::from_reqwest(&e))?;
    let status = response.status();
    if !status.is_success() {
        tracing::debug!("{} {} -> {}", request.method, request.url, status);
        return Err(NetError::HttpError(status.as_u16()));
    }

    let payload = response
        .bytes()
        .await
        .map_err(|e| NetError::from_reqwest(&e))?;
    Ok(payload.to_vec())
}
