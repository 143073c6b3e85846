//! In-Process Loopback Broker
//!
//! Routes publishes to matching subscriptions within the process. Used for
//! `--loopback` runs of the CLI and throughout the test suite, where the
//! knobs below simulate slow handshakes, rejected credentials and drops on
//! the status stream.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;

use super::error::{TransportError, TransportResult};
use super::topic::{matches, validate_pattern, validate_subject};
use super::ws::check_url;
use super::{
    ConnectOptions, Credentials, Established, InboundMessage, Session, Transport,
    TransportEvent, TransportSubscription,
};

/// Loopback broker shared by every session it hands out
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

#[derive(Default)]
struct BrokerInner {
    sessions: Mutex<HashMap<u64, SessionEntry>>,
    next_session: AtomicU64,
    handshakes: AtomicUsize,
    published: AtomicUsize,
    refuse: AtomicBool,
    handshake_delay: Mutex<Option<Duration>>,
    required: Mutex<Option<Credentials>>,
}

struct SessionEntry {
    events: mpsc::UnboundedSender<TransportEvent>,
    subscriptions: HashMap<u64, (String, mpsc::UnboundedSender<InboundMessage>)>,
    next_sid: u64,
}

impl BrokerInner {
    fn sessions(&self) -> MutexGuard<'_, HashMap<u64, SessionEntry>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn route(&self, subject: &str, payload: Bytes) -> usize {
        let sessions = self.sessions();
        let mut delivered = 0;
        for entry in sessions.values() {
            for (pattern, tx) in entry.subscriptions.values() {
                if matches(pattern, subject) {
                    let message = InboundMessage {
                        subject: subject.to_string(),
                        reply: None,
                        payload: payload.clone(),
                    };
                    if tx.send(message).is_ok() {
                        delivered += 1;
                    }
                }
            }
        }
        delivered
    }
}

impl MemoryBroker {
    /// Create an empty broker
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every handshake by `delay`
    pub fn with_handshake_delay(self, delay: Duration) -> Self {
        *self
            .inner
            .handshake_delay
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(delay);
        self
    }

    /// Accept only these credentials
    pub fn require_credentials(self, credentials: Credentials) -> Self {
        *self.inner.required.lock().unwrap_or_else(|e| e.into_inner()) = Some(credentials);
        self
    }

    /// Refuse (or accept again) new handshakes
    pub fn set_refuse_connections(&self, refuse: bool) {
        self.inner.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Number of handshakes attempted against this broker
    pub fn handshake_count(&self) -> usize {
        self.inner.handshakes.load(Ordering::SeqCst)
    }

    /// Number of publishes accepted
    pub fn publish_count(&self) -> usize {
        self.inner.published.load(Ordering::SeqCst)
    }

    /// Number of open sessions
    pub fn session_count(&self) -> usize {
        self.inner.sessions().len()
    }

    /// Number of live subscriptions across all sessions
    pub fn subscription_count(&self) -> usize {
        self.inner
            .sessions()
            .values()
            .map(|s| s.subscriptions.len())
            .sum()
    }

    /// Publish from outside any session (another client on the broker)
    pub fn publish_external(&self, subject: &str, payload: impl Into<Bytes>) -> usize {
        self.inner.route(subject, payload.into())
    }

    /// Push an event onto every session's status stream
    ///
    /// A `Disconnect` also drops the sessions, closing their subscriptions.
    pub fn inject(&self, event: TransportEvent) {
        let mut sessions = self.inner.sessions();
        for entry in sessions.values() {
            let _ = entry.events.send(event.clone());
        }
        if matches!(event, TransportEvent::Disconnect { .. }) {
            sessions.clear();
        }
    }

    /// Drop every session as if the link failed
    pub fn drop_connections(&self) {
        self.inject(TransportEvent::Disconnect {
            reason: Some("connection lost".to_string()),
        });
    }
}

#[async_trait]
impl Transport for MemoryBroker {
    async fn connect(&self, options: &ConnectOptions) -> TransportResult<Established> {
        self.inner.handshakes.fetch_add(1, Ordering::SeqCst);

        let delay = *self
            .inner
            .handshake_delay
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        check_url(&options.url)?;

        if self.inner.refuse.load(Ordering::SeqCst) {
            return Err(TransportError::Handshake("connection refused".to_string()));
        }

        let required = self
            .inner
            .required
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(required) = required {
            if required != options.credentials {
                return Err(TransportError::Authorization(
                    "Authorization Violation".to_string(),
                ));
            }
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let id = self.inner.next_session.fetch_add(1, Ordering::SeqCst);
        self.inner.sessions().insert(
            id,
            SessionEntry {
                events: events_tx,
                subscriptions: HashMap::new(),
                next_sid: 1,
            },
        );

        tracing::debug!(session = id, name = %options.name, "Loopback session opened");

        Ok(Established {
            session: Arc::new(MemorySession {
                broker: Arc::clone(&self.inner),
                id,
            }),
            events: events_rx,
        })
    }
}

/// Session handed out by [`MemoryBroker`]
pub struct MemorySession {
    broker: Arc<BrokerInner>,
    id: u64,
}

#[async_trait]
impl Session for MemorySession {
    fn publish(&self, subject: &str, payload: Bytes) -> TransportResult<()> {
        validate_subject(subject)?;
        if !self.broker.sessions().contains_key(&self.id) {
            return Err(TransportError::Closed);
        }
        self.broker.published.fetch_add(1, Ordering::SeqCst);
        self.broker.route(subject, payload);
        Ok(())
    }

    fn subscribe(&self, pattern: &str) -> TransportResult<TransportSubscription> {
        validate_pattern(pattern)?;
        let mut sessions = self.broker.sessions();
        let entry = sessions.get_mut(&self.id).ok_or(TransportError::Closed)?;

        let sid = entry.next_sid;
        entry.next_sid += 1;
        let (tx, rx) = mpsc::unbounded_channel();
        entry.subscriptions.insert(sid, (pattern.to_string(), tx));

        Ok(TransportSubscription { sid, messages: rx })
    }

    fn unsubscribe(&self, sid: u64) -> TransportResult<()> {
        let mut sessions = self.broker.sessions();
        let entry = sessions.get_mut(&self.id).ok_or(TransportError::Closed)?;
        entry.subscriptions.remove(&sid);
        Ok(())
    }

    async fn flush(&self) -> TransportResult<()> {
        if self.broker.sessions().contains_key(&self.id) {
            Ok(())
        } else {
            Err(TransportError::Closed)
        }
    }

    async fn close(&self) -> TransportResult<()> {
        self.broker.sessions().remove(&self.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> ConnectOptions {
        ConnectOptions::new("ws://localhost:8080")
    }

    #[tokio::test]
    async fn test_publish_routes_to_matching_patterns() {
        let broker = MemoryBroker::new();
        let established = broker.connect(&options()).await.unwrap();
        let session = established.session;

        let mut all = session.subscribe("orders.>").unwrap();
        let mut eu = session.subscribe("orders.*.eu").unwrap();
        let mut other = session.subscribe("payments.*").unwrap();

        session
            .publish("orders.created.eu", Bytes::from_static(b"1"))
            .unwrap();

        assert_eq!(all.messages.try_recv().unwrap().subject, "orders.created.eu");
        assert_eq!(&eu.messages.try_recv().unwrap().payload[..], b"1");
        assert!(other.messages.try_recv().is_err());
        assert_eq!(broker.publish_count(), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_closes_channel() {
        let broker = MemoryBroker::new();
        let session = broker.connect(&options()).await.unwrap().session;

        let mut sub = session.subscribe("a.b").unwrap();
        assert_eq!(broker.subscription_count(), 1);

        session.unsubscribe(sub.sid).unwrap();
        assert_eq!(broker.subscription_count(), 0);
        assert!(sub.messages.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_rejects_bad_credentials() {
        let broker = MemoryBroker::new().require_credentials(Credentials::Token("t".into()));

        let result = broker.connect(&options()).await;
        assert!(matches!(result, Err(TransportError::Authorization(_))));

        let ok = broker
            .connect(&options().credentials(Credentials::Token("t".into())))
            .await;
        assert!(ok.is_ok());
        assert_eq!(broker.handshake_count(), 2);
    }

    #[tokio::test]
    async fn test_drop_connections_emits_disconnect() {
        let broker = MemoryBroker::new();
        let Established { session, mut events } = broker.connect(&options()).await.unwrap();
        let mut sub = session.subscribe("x.y").unwrap();

        broker.drop_connections();

        assert!(matches!(
            events.recv().await,
            Some(TransportEvent::Disconnect { .. })
        ));
        assert!(sub.messages.recv().await.is_none());
        assert_eq!(broker.session_count(), 0);
        assert!(matches!(
            session.publish("x.y", Bytes::new()),
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_invalid_url_rejected() {
        let broker = MemoryBroker::new();
        let result = broker.connect(&ConnectOptions::new("http://localhost")).await;
        assert!(matches!(result, Err(TransportError::InvalidUrl(_))));
    }
}
