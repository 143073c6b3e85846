//! # wirelink
//!
//! Shared connection core for a topic-routed publish/subscribe broker: one
//! duplex link per process, used by many independent consumers.
//!
//! ## Features
//!
//! - **Single shared link**: concurrent `connect` calls join one handshake
//! - **Subscription deduplication**: one transport subscription per topic
//! - **Auto-connect / auto-reconnect**: driven by the persisted config,
//!   suppressed after a manual disconnect
//! - **Cross-instance config sync**: edits made by another instance of the
//!   same profile trigger a fresh auto-connect
//!
//! ## Modules
//!
//! - [`transport`]: transport traits, WebSocket and in-memory implementations
//! - [`connection`]: the connection, its subscription registry and status
//! - [`manager`]: connect/reconnect policy
//! - [`store`]: profile storage and the persisted connection config
//! - [`settings`]: process settings (TOML + environment)
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use wirelink::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let storage = Arc::new(FileStorage::open("./profile")?);
//!     let store = ConfigStore::new(storage);
//!     store.save_config(
//!         &ConnectionConfig::new("ws://localhost:8080")
//!             .user_pass("a", "b")
//!             .auto_connect(true),
//!     )?;
//!
//!     let manager = ConnectionManager::new(Connection::new(Arc::new(WsTransport::new())), store);
//!     manager.initialize();
//!
//!     if manager.attempt_auto_connect().await {
//!         manager.subscribe("orders.*", |payload, subject, _id| {
//!             println!("{}: {:?}", subject, payload.as_text());
//!         });
//!         manager.publish("orders.created", &serde_json::json!({"id": 1})).await;
//!     }
//!
//!     manager.disconnect().await;
//!     Ok(())
//! }
//! ```

pub mod connection;
pub mod manager;
pub mod settings;
pub mod store;
pub mod transport;

// Re-export top-level types for convenience
pub use connection::{
    Connection, ConnectionStatus, ListenerId, Payload, StatusSnapshot, Subscription,
    NOT_CONNECTED,
};

pub use manager::{ConnectionManager, ReconnectPolicy};

pub use store::{
    ConfigChange, ConfigStore, ConfigViolation, ConnectionConfig, FileStorage, MemoryStorage,
    ProfileStorage, StorageError, StorageResult, ValidationReport,
};

pub use transport::{
    ConnectOptions, Credentials, MemoryBroker, Transport, TransportError, TransportEvent,
    TransportResult, WsTransport,
};

pub use settings::{generate_default_settings, Settings, SettingsError};
