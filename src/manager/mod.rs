//! Connection Manager
//!
//! Policy layer above [`Connection`]: decides when to auto-connect, when to
//! reconnect after a drop, and when to retry because another instance of the
//! profile edited the connection config.
//!
//! Flags:
//! - **auto-connect attempt**: at most one per session, cached with its result
//! - **manual disconnect**: set by [`ConnectionManager::disconnect`], suppresses
//!   auto-reconnect until the next manual [`ConnectionManager::connect`]

mod reconnect;

pub use reconnect::ReconnectPolicy;

use bytes::Bytes;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::task::JoinHandle;

use crate::connection::{
    Connection, ConnectionStatus, ListenerId, MessageCallback, Payload, StatusSnapshot,
    Subscription,
};
use crate::store::{ConfigChange, ConfigStore, ConfigWatcher, ConnectionConfig};

type AutoConnectAttempt = Shared<BoxFuture<'static, bool>>;

/// Orchestrates the shared connection; clones share state
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    connection: Connection,
    config_store: ConfigStore,
    policy: ReconnectPolicy,
    flags: Mutex<ManagerFlags>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Default)]
struct ManagerFlags {
    initialized: bool,
    manual_disconnect: bool,
    reconnecting: bool,
    /// Present once auto-connect was attempted this session
    auto_connect: Option<AutoConnectAttempt>,
    status_listener: Option<ListenerId>,
}

impl ConnectionManager {
    pub fn new(connection: Connection, config_store: ConfigStore) -> Self {
        Self::with_policy(connection, config_store, ReconnectPolicy::default())
    }

    pub fn with_policy(
        connection: Connection,
        config_store: ConfigStore,
        policy: ReconnectPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                connection,
                config_store,
                policy,
                flags: Mutex::new(ManagerFlags::default()),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    fn flags(&self) -> MutexGuard<'_, ManagerFlags> {
        self.inner.flags.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn connection(&self) -> &Connection {
        &self.inner.connection
    }

    pub fn config_store(&self) -> &ConfigStore {
        &self.inner.config_store
    }

    // ============================================
    // Startup
    // ============================================

    /// Register the reconnect listener and the config watcher
    ///
    /// Must run inside a tokio runtime. Calling it again is a no-op.
    pub fn initialize(&self) {
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(e) => {
                tracing::error!(error = %e, "ConnectionManager::initialize needs a tokio runtime");
                return;
            }
        };

        {
            let mut flags = self.flags();
            if flags.initialized {
                tracing::debug!("ConnectionManager already initialized");
                return;
            }
            flags.initialized = true;
        }

        let weak = Arc::downgrade(&self.inner);
        let listener_runtime = runtime.clone();
        let listener = self.inner.connection.on_status_change(move |snapshot| {
            if snapshot.status != ConnectionStatus::Disconnected {
                return;
            }
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let manager = ConnectionManager { inner };
            if manager.flags().manual_disconnect {
                return;
            }
            listener_runtime.spawn(async move {
                manager.attempt_auto_reconnect().await;
            });
        });
        self.flags().status_listener = Some(listener);

        let watcher = self.inner.config_store.watch();
        let task = runtime.spawn(watch_config(Arc::downgrade(&self.inner), watcher));
        self.inner
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(task);

        tracing::info!("ConnectionManager initialized");
    }

    /// Undo [`initialize`](Self::initialize): drop the listener, stop the watcher
    pub fn shutdown(&self) {
        let listener = {
            let mut flags = self.flags();
            flags.initialized = false;
            flags.status_listener.take()
        };
        if let Some(id) = listener {
            self.inner.connection.remove_status_listener(id);
        }

        let tasks: Vec<_> = self
            .inner
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for task in tasks {
            task.abort();
        }
    }

    // ============================================
    // Policy
    // ============================================

    /// Connect from the persisted config, at most once per session
    ///
    /// Later calls return the cached (or in-flight) result. With
    /// `autoConnect` disabled nothing touches the network.
    pub async fn attempt_auto_connect(&self) -> bool {
        let attempt = {
            let mut flags = self.flags();
            match &flags.auto_connect {
                Some(attempt) => attempt.clone(),
                None => {
                    let this = self.clone();
                    let attempt = async move { this.run_auto_connect().await }
                        .boxed()
                        .shared();
                    flags.auto_connect = Some(attempt.clone());
                    attempt
                }
            }
        };

        attempt.await
    }

    async fn run_auto_connect(self) -> bool {
        let config = self.inner.config_store.get_config();
        if !config.auto_connect {
            tracing::debug!("Auto-connect disabled");
            return false;
        }

        let report = ConfigStore::validate_config(&config);
        if !report.valid {
            tracing::warn!(errors = ?report.messages(), "Auto-connect skipped, config invalid");
            return false;
        }

        tracing::info!(url = %config.url, "Auto-connecting");
        let connected = self.inner.connection.connect(&config).await;
        if !connected {
            tracing::warn!(
                url = %config.url,
                status = ?self.inner.connection.status_snapshot(),
                "Auto-connect failed"
            );
        }
        connected
    }

    /// Reconnect after an unexpected drop
    ///
    /// No-op (returns `false`, no transport call) after a manual disconnect,
    /// while another reconnect loop runs, or when auto-connect is disabled.
    pub async fn attempt_auto_reconnect(&self) -> bool {
        {
            let mut flags = self.flags();
            if flags.manual_disconnect {
                tracing::debug!("Skipping reconnect after manual disconnect");
                return false;
            }
            if flags.reconnecting {
                tracing::debug!("Reconnect already in progress");
                return false;
            }
            flags.reconnecting = true;
        }

        let result = self.reconnect_loop().await;
        self.flags().reconnecting = false;
        result
    }

    async fn reconnect_loop(&self) -> bool {
        let config = self.inner.config_store.get_config();
        if !config.auto_connect {
            tracing::debug!("Not reconnecting, auto-connect disabled");
            return false;
        }
        if !ConfigStore::validate_config(&config).valid {
            tracing::warn!("Not reconnecting, stored config is invalid");
            return false;
        }

        let policy = &self.inner.policy;
        for attempt in 0..policy.max_attempts {
            if self.inner.connection.is_connected() {
                return true;
            }

            let delay = policy.delay_for(attempt);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if self.flags().manual_disconnect {
                tracing::debug!("Reconnect cancelled by manual disconnect");
                return false;
            }

            tracing::info!(attempt = attempt + 1, max = policy.max_attempts, "Reconnecting to broker");
            if self.inner.connection.connect(&config).await {
                tracing::info!(attempt = attempt + 1, "Reconnected");
                return true;
            }
        }

        tracing::warn!(attempts = policy.max_attempts, "Giving up on reconnect");
        false
    }

    /// Clear the attempt and manual-disconnect flags so auto-connect may run
    /// again this session
    pub fn reset_connection_state(&self) {
        let mut flags = self.flags();
        flags.auto_connect = None;
        flags.manual_disconnect = false;
    }

    /// React to an edit made by another instance of the profile
    ///
    /// Any edit whose new document has auto-connect enabled triggers a fresh
    /// attempt, not only a switch from disabled to enabled: a sibling that
    /// fixes the URL while auto-connect stays on should be retried too.
    /// Nothing happens while connected or after a manual disconnect.
    async fn handle_config_change(&self, change: ConfigChange) {
        tracing::debug!(
            enabled = change.current.auto_connect,
            "Connection config changed elsewhere"
        );

        if !change.current.auto_connect
            || self.inner.connection.is_connected()
            || self.flags().manual_disconnect
        {
            return;
        }

        tracing::info!("Auto-connect enabled by another instance, retrying");
        self.reset_connection_state();
        self.attempt_auto_connect().await;
    }

    pub fn is_manual_disconnect(&self) -> bool {
        self.flags().manual_disconnect
    }

    pub fn auto_connect_attempted(&self) -> bool {
        self.flags().auto_connect.is_some()
    }

    // ============================================
    // Manual operations
    // ============================================

    /// Connect explicitly; clears the manual-disconnect flag
    pub async fn connect(&self, config: &ConnectionConfig) -> bool {
        self.flags().manual_disconnect = false;
        self.inner.connection.connect(config).await
    }

    /// Disconnect explicitly; later drops are not auto-reconnected
    pub async fn disconnect(&self) {
        self.flags().manual_disconnect = true;
        self.inner.connection.disconnect().await;
    }

    pub async fn publish<T: Serialize + ?Sized>(&self, topic: &str, data: &T) -> bool {
        self.inner.connection.publish(topic, data).await
    }

    pub async fn publish_bytes(&self, topic: &str, payload: Bytes) -> bool {
        self.inner.connection.publish_bytes(topic, payload).await
    }

    pub fn subscribe<F>(&self, topic: &str, callback: F) -> Option<Subscription>
    where
        F: Fn(Payload, &str, u64) + Send + Sync + 'static,
    {
        self.inner.connection.subscribe(topic, callback)
    }

    /// Subscribe to every default subject of the persisted config
    pub fn subscribe_defaults<F>(&self, callback: F) -> Vec<Subscription>
    where
        F: Fn(Payload, &str, u64) + Send + Sync + 'static,
    {
        let callback: MessageCallback = Arc::new(callback);
        self.subscribe_all(&[], &callback)
    }

    /// Keep `patterns` subscribed across reconnects
    ///
    /// An empty `patterns` means the default subjects of the persisted config,
    /// re-read on every resubscribe. Subscribes right away when connected and
    /// again each time the link comes back. Remove the returned listener to
    /// stop resubscribing.
    pub fn monitor<F>(&self, patterns: Vec<String>, callback: F) -> ListenerId
    where
        F: Fn(Payload, &str, u64) + Send + Sync + 'static,
    {
        let callback: MessageCallback = Arc::new(callback);

        let weak = Arc::downgrade(&self.inner);
        let listener_patterns = patterns.clone();
        let listener_callback = Arc::clone(&callback);
        let id = self.on_status_change(move |snapshot| {
            if snapshot.status != ConnectionStatus::Connected {
                return;
            }
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let manager = ConnectionManager { inner };
            let subs = manager.subscribe_all(&listener_patterns, &listener_callback);
            tracing::debug!(count = subs.len(), "Monitored topics resubscribed");
        });

        if self.is_connected() {
            self.subscribe_all(&patterns, &callback);
        }
        id
    }

    fn subscribe_all(&self, patterns: &[String], callback: &MessageCallback) -> Vec<Subscription> {
        let defaults;
        let topics = if patterns.is_empty() {
            defaults = self.inner.config_store.get_config().subjects;
            &defaults[..]
        } else {
            patterns
        };

        topics
            .iter()
            .filter_map(|topic| {
                let callback = Arc::clone(callback);
                self.subscribe(topic, move |payload, subject, id| callback(payload, subject, id))
            })
            .collect()
    }

    pub fn unsubscribe(&self, sub: &Subscription) {
        self.inner.connection.unsubscribe(sub)
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.connection.status()
    }

    pub fn status_snapshot(&self) -> StatusSnapshot {
        self.inner.connection.status_snapshot()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connection.is_connected()
    }

    pub fn on_status_change<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&StatusSnapshot) + Send + Sync + 'static,
    {
        self.inner.connection.on_status_change(listener)
    }

    pub fn remove_status_listener(&self, id: ListenerId) -> bool {
        self.inner.connection.remove_status_listener(id)
    }
}

async fn watch_config(inner: Weak<ManagerInner>, mut watcher: ConfigWatcher) {
    while let Some(change) = watcher.next().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        ConnectionManager { inner }.handle_config_change(change).await;
    }
}
