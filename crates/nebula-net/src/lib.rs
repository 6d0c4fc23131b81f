//! Client-side transport: request/response exchanges, duplex websocket
//! streams, network-path reachability, and latency probing.

pub mod client;
pub mod diagnostics;
pub mod error;
pub mod ids;
pub mod reachability;
pub mod request;
pub mod stream;

pub use client::{TransportClient, TransportConfig};
pub use diagnostics::{LatencyWindow, PROBE_TIMEOUT};
pub use error::NetError;
pub use ids::{ConnectionId, IdGenerator};
pub use reachability::{
    InterfaceKind, PathProbe, PathStatus, Reachability, ReachabilityWatch, UdpRouteProbe,
};
pub use request::{Auth, Method, Request};
pub use stream::{CloseReason, Payload, StreamEvent, StreamOptions};
