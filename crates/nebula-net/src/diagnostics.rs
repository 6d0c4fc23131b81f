//! Latency probing and rolling RTT diagnostics.

use std::collections::VecDeque;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::request::Method;

/// Upper bound on a single latency probe.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Default number of samples kept in a [`LatencyWindow`].
pub const DEFAULT_WINDOW_SIZE: usize = 20;

/// Map a stream URL to the HTTP URL of the same host, so `ws://` worlds can
/// be probed with a plain request.
pub(crate) fn probe_url(target: &str) -> String {
    if let Some(rest) = target.strip_prefix("wss://") {
        format!("https://{rest}")
    } else if let Some(rest) = target.strip_prefix("ws://") {
        format!("http://{rest}")
    } else {
        target.to_string()
    }
}

/// Issue a `HEAD` request to `target` and time it.
///
/// Any HTTP answer counts: the probe measures the round trip, not the
/// endpoint's opinion of the request. Returns `None` on error or timeout.
pub(crate) async fn probe(client: &reqwest::Client, target: &str, timeout: Duration) -> Option<Duration> {
    let url = crate::request::parse_http_url(&probe_url(target)).ok()?;
    let started = Instant::now();
    let request = client.request(Method::HEAD, url).timeout(timeout.min(PROBE_TIMEOUT));
    match request.send().await {
        Ok(_) => Some(started.elapsed()),
        Err(e) => {
            tracing::debug!("Latency probe to {target} failed: {e}");
            None
        }
    }
}

/// Rolling window of RTT samples with lifetime extremes.
///
/// The average slides with the window; `min` and `peak` cover every sample
/// ever recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LatencyWindow {
    window_size: usize,
    samples: VecDeque<Duration>,
    min: Option<Duration>,
    peak: Option<Duration>,
}

impl Default for LatencyWindow {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_SIZE)
    }
}

impl LatencyWindow {
    /// Create an empty window holding at most `window_size` samples.
    pub fn new(window_size: usize) -> Self {
        let window_size = window_size.max(1);
        Self {
            window_size,
            samples: VecDeque::with_capacity(window_size),
            min: None,
            peak: None,
        }
    }

    /// Record one RTT sample.
    pub fn record(&mut self, rtt: Duration) {
        if self.samples.len() >= self.window_size {
            self.samples.pop_front();
        }
        self.samples.push_back(rtt);
        self.min = Some(self.min.map_or(rtt, |m| m.min(rtt)));
        self.peak = Some(self.peak.map_or(rtt, |p| p.max(rtt)));
    }

    /// Average RTT over the rolling window.
    pub fn average(&self) -> Option<Duration> {
        if self.samples.is_empty() {
            return None;
        }
        let sum = self
            .samples
            .iter()
            .fold(Duration::ZERO, |acc, s| acc.saturating_add(*s));
        Some(sum / self.samples.len() as u32)
    }

    /// Lowest RTT ever recorded.
    pub fn min(&self) -> Option<Duration> {
        self.min
    }

    /// Highest RTT ever recorded.
    pub fn peak(&self) -> Option<Duration> {
        self.peak
    }

    /// Jitter: standard deviation of RTT samples in the window.
    pub fn jitter(&self) -> Option<Duration> {
        if self.samples.len() < 2 {
            return None;
        }

        let avg = self.average()?.as_secs_f64();
        let variance: f64 = self
            .samples
            .iter()
            .map(|s| {
                let diff = s.as_secs_f64() - avg;
                diff * diff
            })
            .sum::<f64>()
            / (self.samples.len() - 1) as f64;

        Duration::try_from_secs_f64(variance.sqrt()).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn test_empty_window_returns_none() {
        let window = LatencyWindow::default();
        assert!(window.average().is_none());
        assert!(window.min().is_none());
        assert!(window.peak().is_none());
        assert!(window.jitter().is_none());
    }

    #[test]
    fn test_average_slides_with_window() {
        let mut window = LatencyWindow::new(2);
        window.record(ms(100));
        window.record(ms(20));
        window.record(ms(40));
        assert_eq!(window.average(), Some(ms(30)));
    }

    #[test]
    fn test_extremes_cover_evicted_samples() {
        let mut window = LatencyWindow::new(2);
        window.record(ms(5));
        window.record(ms(500));
        window.record(ms(50));
        window.record(ms(60));
        assert_eq!(window.min(), Some(ms(5)));
        assert_eq!(window.peak(), Some(ms(500)));
        assert_eq!(window.average(), Some(ms(55)));
    }

    #[test]
    fn test_jitter_calculated_from_variance() {
        let mut window = LatencyWindow::new(10);
        for v in [10, 20, 30, 40, 50] {
            window.record(ms(v));
        }
        let jitter_ms = window.jitter().unwrap().as_secs_f64() * 1000.0;
        assert!((jitter_ms - 15.81).abs() < 1.0, "got {jitter_ms:.2}ms");
    }

    #[test]
    fn test_zero_window_size_is_clamped() {
        let mut window = LatencyWindow::new(0);
        window.record(ms(1));
        window.record(ms(3));
        assert_eq!(window.average(), Some(ms(3)));
        assert!(window.jitter().is_none());
    }

    #[test]
    fn test_stream_urls_probe_over_http() {
        assert_eq!(probe_url("wss://w.example/ws"), "https://w.example/ws");
        assert_eq!(probe_url("ws://10.0.0.1:9000"), "http://10.0.0.1:9000");
        assert_eq!(probe_url("https://a.example"), "https://a.example");
    }

    #[tokio::test]
    async fn test_probe_unreachable_is_unknown() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = reqwest::Client::new();
        let result = probe(&client, &format!("http://{addr}"), PROBE_TIMEOUT).await;
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_probe_measures_round_trip() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).await;
            let _ = stream
                .write_all(b"HTTP/1.1 405 Method Not Allowed\r\ncontent-length: 0\r\n\r\n")
                .await;
        });

        let client = reqwest::Client::new();
        let rtt = probe(&client, &format!("ws://{addr}/world"), PROBE_TIMEOUT).await;
        assert!(rtt.is_some_and(|d| d < PROBE_TIMEOUT));
    }

    #[tokio::test]
    async fn test_probe_invalid_url_is_unknown() {
        let client = reqwest::Client::new();
        assert!(probe(&client, "::nope::", PROBE_TIMEOUT).await.is_none());
    }
}
