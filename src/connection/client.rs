//! Shared Broker Connection
//!
//! One duplex link shared by every consumer in the process. Owns the
//! transport session, the subscription registry and the status notifier.
//!
//! State machine:
//!
//! ```text
//! disconnected --connect--> connecting --ok--> connected
//!                           connecting --fail--> error --connect--> connecting
//! connected --link drop--> disconnected
//! connected --link reconnect--> connected
//! ```

use bytes::Bytes;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::payload::Payload;
use super::registry::{Subscription, SubscriptionRegistry};
use super::status::{ConnectionStatus, ListenerId, StatusNotifier, StatusSnapshot};
use crate::store::{ConfigStore, ConnectionConfig};
use crate::transport::{
    validate_pattern, ConnectOptions, Established, InboundMessage, Session, Transport,
    TransportEvent,
};

/// Message used when publishing without a live link
pub const NOT_CONNECTED: &str = "Not connected";

/// Delivery callback: decoded payload, concrete subject, subscription id
pub type MessageCallback = Arc<dyn Fn(Payload, &str, u64) + Send + Sync>;

type PendingConnect = Shared<BoxFuture<'static, bool>>;

/// Shared connection handle; clones refer to the same link
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    transport: Arc<dyn Transport>,
    notifier: StatusNotifier,
    link: Mutex<LinkState>,
}

#[derive(Default)]
struct LinkState {
    session: Option<Arc<dyn Session>>,
    registry: SubscriptionRegistry,
    /// Handshake in flight; concurrent callers await the same attempt
    pending: Option<PendingConnect>,
    /// Bumped on every teardown; stale handshakes and event loops compare
    /// against it
    epoch: u64,
    events_task: Option<JoinHandle<()>>,
}

impl ConnectionInner {
    fn link(&self) -> MutexGuard<'_, LinkState> {
        self.link.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Connection {
    /// Create a disconnected connection over a transport
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            inner: Arc::new(ConnectionInner {
                transport,
                notifier: StatusNotifier::new(),
                link: Mutex::new(LinkState::default()),
            }),
        }
    }

    // ============================================
    // Lifecycle
    // ============================================

    /// Connect using `config`
    ///
    /// Returns `true` immediately when already connected. While a handshake
    /// is in flight every caller awaits that same attempt. An invalid config
    /// fails without any I/O.
    pub async fn connect(&self, config: &ConnectionConfig) -> bool {
        let report = ConfigStore::validate_config(config);
        if !report.valid {
            let message = report.messages().join("; ");
            tracing::warn!(errors = %message, "Refusing to connect with invalid config");
            self.set_status(ConnectionStatus::Error, Some(message));
            return false;
        }

        let attempt = {
            let mut link = self.inner.link();
            if link.session.is_some() && self.is_connected() {
                return true;
            }
            match &link.pending {
                Some(pending) => {
                    tracing::debug!("Joining in-flight connect");
                    pending.clone()
                }
                None => {
                    let epoch = link.epoch;
                    let this = self.clone();
                    let options = config.connect_options();
                    let pending = async move { this.establish(options, epoch).await }
                        .boxed()
                        .shared();
                    link.pending = Some(pending.clone());
                    pending
                }
            }
        };

        attempt.await
    }

    async fn establish(self, options: ConnectOptions, epoch: u64) -> bool {
        self.set_status(ConnectionStatus::Connecting, None);
        tracing::info!(url = %options.url, "Connecting to broker");

        let result = self.inner.transport.connect(&options).await;

        let (stale, replaced) = {
            let mut link = self.inner.link();
            if link.epoch != epoch {
                (true, None)
            } else {
                link.pending = None;
                match &result {
                    Ok(established) => {
                        // Retry from `error` while the old link is still open
                        let previous = link.session.replace(Arc::clone(&established.session));
                        let old_task = link.events_task.take();
                        if previous.is_some() {
                            link.registry.drain();
                        }
                        (false, previous.map(|session| (session, old_task)))
                    }
                    Err(_) => (false, None),
                }
            }
        };

        if let Some((session, old_task)) = replaced {
            if let Some(task) = old_task {
                task.abort();
            }
            if let Err(e) = session.close().await {
                tracing::debug!(error = %e, "Closing replaced session failed");
            }
        }

        if stale {
            // disconnect() ran during the handshake
            tracing::debug!("Discarding handshake that finished after disconnect");
            if let Ok(established) = result {
                if let Err(e) = established.session.close().await {
                    tracing::debug!(error = %e, "Closing discarded session failed");
                }
            }
            return false;
        }

        match result {
            Ok(Established { events, .. }) => {
                // Connected must be visible before the first status-stream event
                self.set_status(ConnectionStatus::Connected, None);
                let task = tokio::spawn(watch_events(Arc::downgrade(&self.inner), events, epoch));
                let superseded = {
                    let mut link = self.inner.link();
                    if link.epoch != epoch {
                        task.abort();
                        Some(link.pending.is_none() && link.session.is_none())
                    } else {
                        link.events_task = Some(task);
                        None
                    }
                };
                if let Some(idle) = superseded {
                    // A teardown landed between the handshake and Connected
                    tracing::debug!("Handshake superseded while reporting connected");
                    if idle {
                        self.set_status(ConnectionStatus::Disconnected, None);
                    }
                    return false;
                }
                tracing::info!(url = %options.url, "Connected to broker");
                true
            }
            Err(e) => {
                tracing::warn!(url = %options.url, error = %e, "Broker connection failed");
                self.set_status(ConnectionStatus::Error, Some(e.to_string()));
                false
            }
        }
    }

    /// Tear down the link
    ///
    /// Safe in any state, including mid-connect. Tracked subscriptions are
    /// unsubscribed best-effort first.
    pub async fn disconnect(&self) {
        let (session, subs, task) = {
            let mut link = self.inner.link();
            link.epoch += 1;
            link.pending = None;
            (
                link.session.take(),
                link.registry.drain(),
                link.events_task.take(),
            )
        };

        if let Some(task) = task {
            task.abort();
        }

        if let Some(session) = session {
            for sub in &subs {
                if let Err(e) = session.unsubscribe(sub.sid) {
                    tracing::warn!(topic = %sub.topic, id = sub.id, error = %e, "Unsubscribe during disconnect failed");
                }
            }
            if let Err(e) = session.close().await {
                tracing::warn!(error = %e, "Closing broker link failed");
            }
        }

        self.set_status(ConnectionStatus::Disconnected, None);
        tracing::info!(released = subs.len(), "Disconnected from broker");
    }

    /// Link dropped underneath us: cascade teardown
    fn handle_link_drop(&self, epoch: u64, reason: Option<String>) {
        let released = {
            let mut link = self.inner.link();
            if link.epoch != epoch {
                return;
            }
            link.epoch += 1;
            link.session = None;
            link.events_task = None;
            link.registry.drain().len()
        };

        tracing::warn!(reason = ?reason, released, "Broker link lost");
        self.set_status(ConnectionStatus::Disconnected, reason);
    }

    // ============================================
    // Messaging
    // ============================================

    /// Publish `data` serialized as JSON
    ///
    /// Without a live link the status becomes `error` ("Not connected") and
    /// `false` is returned.
    pub async fn publish<T: Serialize + ?Sized>(&self, topic: &str, data: &T) -> bool {
        match serde_json::to_vec(data) {
            Ok(bytes) => self.publish_bytes(topic, Bytes::from(bytes)).await,
            Err(e) => {
                tracing::error!(topic = %topic, error = %e, "Failed to serialize payload");
                false
            }
        }
    }

    /// Publish a pre-encoded payload
    pub async fn publish_bytes(&self, topic: &str, payload: Bytes) -> bool {
        let session = self.live_session();
        let Some(session) = session else {
            self.set_status(ConnectionStatus::Error, Some(NOT_CONNECTED.to_string()));
            return false;
        };

        if let Err(e) = session.publish(topic, payload) {
            tracing::warn!(topic = %topic, error = %e, "Publish failed");
            return false;
        }
        if let Err(e) = session.flush().await {
            tracing::warn!(topic = %topic, error = %e, "Publish flush failed");
            return false;
        }

        tracing::trace!(topic = %topic, "Published");
        true
    }

    /// Subscribe to a topic pattern
    ///
    /// Returns `None` when not connected. If `topic` is already subscribed the
    /// existing subscription is returned and `callback` is dropped: all
    /// consumers of a topic share the first subscriber's feed.
    pub fn subscribe<F>(&self, topic: &str, callback: F) -> Option<Subscription>
    where
        F: Fn(Payload, &str, u64) + Send + Sync + 'static,
    {
        if !self.is_connected() {
            tracing::debug!(topic = %topic, "Subscribe ignored, not connected");
            return None;
        }
        if let Err(e) = validate_pattern(topic) {
            tracing::warn!(topic = %topic, error = %e, "Subscribe rejected");
            return None;
        }

        let opened = {
            let mut link = self.inner.link();
            let session = link.session.clone()?;

            if let Some(existing) = link.registry.by_topic(topic) {
                tracing::debug!(topic = %topic, id = existing.id, "Reusing existing subscription");
                return Some(existing.clone());
            }

            session.subscribe(topic).map(|transport_sub| {
                let sub = link.registry.insert(topic, transport_sub.sid);
                (sub, transport_sub.messages)
            })
        };

        match opened {
            Ok((sub, messages)) => {
                tracing::debug!(topic = %topic, id = sub.id, sid = sub.sid, "Subscribed");
                tokio::spawn(consume(
                    Arc::downgrade(&self.inner),
                    sub.clone(),
                    messages,
                    Arc::new(callback),
                ));
                Some(sub)
            }
            Err(e) => {
                tracing::warn!(topic = %topic, error = %e, "Transport subscribe failed");
                self.set_status(ConnectionStatus::Error, Some(e.to_string()));
                None
            }
        }
    }

    /// Cancel a subscription and forget it in both indexes
    pub fn unsubscribe(&self, sub: &Subscription) {
        let (removed, session) = {
            let mut link = self.inner.link();
            (link.registry.remove(sub.id), link.session.clone())
        };

        if removed.is_none() {
            tracing::debug!(topic = %sub.topic, id = sub.id, "Unsubscribe of untracked subscription");
            return;
        }

        if let Some(session) = session {
            if let Err(e) = session.unsubscribe(sub.sid) {
                tracing::warn!(topic = %sub.topic, id = sub.id, error = %e, "Transport unsubscribe failed");
            }
        }
        tracing::debug!(topic = %sub.topic, id = sub.id, "Unsubscribed");
    }

    // ============================================
    // Status
    // ============================================

    /// Update the status; identical `(status, message)` pairs are ignored
    pub fn set_status(&self, status: ConnectionStatus, message: Option<String>) -> bool {
        self.inner.notifier.set(status, message)
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.notifier.status()
    }

    pub fn status_snapshot(&self) -> StatusSnapshot {
        self.inner.notifier.snapshot()
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    /// Register a listener for distinct status transitions
    pub fn on_status_change<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&StatusSnapshot) + Send + Sync + 'static,
    {
        self.inner.notifier.subscribe(Arc::new(listener))
    }

    pub fn remove_status_listener(&self, id: ListenerId) -> bool {
        self.inner.notifier.unsubscribe(id)
    }

    // ============================================
    // Introspection
    // ============================================

    pub fn subscription_count(&self) -> usize {
        self.inner.link().registry.len()
    }

    pub fn subscribed_topics(&self) -> Vec<String> {
        self.inner.link().registry.topics()
    }

    fn live_session(&self) -> Option<Arc<dyn Session>> {
        if !self.is_connected() {
            return None;
        }
        self.inner.link().session.clone()
    }

    fn is_tracked(&self, id: u64) -> bool {
        self.inner.link().registry.contains_id(id)
    }

    fn current_epoch(&self) -> u64 {
        self.inner.link().epoch
    }
}

/// Map the transport status stream onto the connection state
async fn watch_events(
    inner: Weak<ConnectionInner>,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    epoch: u64,
) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let conn = Connection { inner };

        if conn.current_epoch() != epoch {
            break;
        }

        match event {
            TransportEvent::Disconnect { reason } => {
                conn.handle_link_drop(epoch, reason);
                break;
            }
            TransportEvent::Reconnect => {
                tracing::info!("Broker link re-established");
                conn.set_status(ConnectionStatus::Connected, None);
            }
            TransportEvent::Error { message } => {
                tracing::warn!(message = %message, "Broker link error");
                conn.set_status(ConnectionStatus::Error, Some(message));
            }
        }
    }
}

/// Deliver one subscription's messages until it is closed or forgotten
async fn consume(
    inner: Weak<ConnectionInner>,
    sub: Subscription,
    mut messages: mpsc::UnboundedReceiver<InboundMessage>,
    callback: MessageCallback,
) {
    while let Some(message) = messages.recv().await {
        let tracked = inner
            .upgrade()
            .map(|inner| Connection { inner }.is_tracked(sub.id))
            .unwrap_or(false);
        if !tracked {
            break;
        }

        let payload = Payload::decode(message.payload);
        let subject = message.subject;
        if catch_unwind(AssertUnwindSafe(|| callback(payload, &subject, sub.id))).is_err() {
            tracing::error!(topic = %sub.topic, id = sub.id, "Subscription callback panicked");
        }
    }

    if let Some(inner) = inner.upgrade() {
        if inner.link().registry.remove(sub.id).is_some() {
            tracing::debug!(topic = %sub.topic, id = sub.id, "Subscription feed ended");
        }
    }
}
