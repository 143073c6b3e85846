//! Broker Transport
//!
//! Raw duplex link to the topic-routed message broker.
//!
//! ## Architecture
//!
//! - **Transport**: performs the handshake and yields an established session
//! - **Session**: publish/subscribe/unsubscribe on a live link, plus the
//!   status stream (`TransportEvent`) describing its lifecycle
//! - **codec**: the broker's text protocol (`INFO`, `CONNECT`, `PUB`, `SUB`, `MSG`, ...)
//! - **ws**: WebSocket implementation of [`Transport`]
//! - **memory**: in-process loopback broker used for local runs and tests
//!
//! Enqueue operations on a [`Session`] are synchronous so that callers can do
//! check-then-subscribe inside a single critical section. Only `flush` and
//! `close` suspend.

pub mod codec;
mod error;
pub mod memory;
pub mod topic;
pub mod ws;

pub use error::{TransportError, TransportResult};
pub use memory::MemoryBroker;
pub use topic::{matches, validate_pattern, validate_subject, TopicError};
pub use ws::WsTransport;

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Credentials forwarded to the broker during the handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    /// Bearer token
    Token(String),
    /// Username and password pair
    UserPass { user: String, pass: String },
    /// Anonymous connection
    None,
}

/// Everything a transport needs to open a session
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Broker URL (`ws://` or `wss://`)
    pub url: String,
    /// Authentication forwarded to the broker
    pub credentials: Credentials,
    /// Client name announced in the handshake
    pub name: String,
}

impl ConnectOptions {
    /// Create options for an anonymous connection
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            credentials: Credentials::None,
            name: format!("wirelink-{}", uuid::Uuid::new_v4()),
        }
    }

    /// Set the credentials
    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }
}

/// A message delivered by the broker on a subscription
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Concrete subject the message was published on
    pub subject: String,
    /// Optional reply subject
    pub reply: Option<String>,
    /// Raw payload bytes
    pub payload: Bytes,
}

/// Transport-level lifecycle signal (the "status stream")
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The link dropped
    Disconnect { reason: Option<String> },
    /// The link was re-established underneath the session
    Reconnect,
    /// The broker reported an error without closing the link
    Error { message: String },
}

/// A subscription opened on the transport
#[derive(Debug)]
pub struct TransportSubscription {
    /// Transport-assigned subscription id (the opaque handle)
    pub sid: u64,
    /// Unbounded sequence of deliveries; closes on unsubscribe or link close
    pub messages: mpsc::UnboundedReceiver<InboundMessage>,
}

/// Result of a successful handshake
pub struct Established {
    /// The live session
    pub session: Arc<dyn Session>,
    /// Status stream for this session
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Opens sessions against a broker
#[async_trait]
pub trait Transport: Send + Sync {
    /// Perform the handshake with url + auth
    async fn connect(&self, options: &ConnectOptions) -> TransportResult<Established>;
}

/// A live, established link
#[async_trait]
pub trait Session: Send + Sync {
    /// Queue a publish
    fn publish(&self, subject: &str, payload: Bytes) -> TransportResult<()>;

    /// Open a subscription on a pattern
    fn subscribe(&self, pattern: &str) -> TransportResult<TransportSubscription>;

    /// Cancel a subscription; its message channel closes
    fn unsubscribe(&self, sid: u64) -> TransportResult<()>;

    /// Wait until queued operations reached the wire
    async fn flush(&self) -> TransportResult<()>;

    /// Close the link; every subscription channel closes
    async fn close(&self) -> TransportResult<()>;
}
