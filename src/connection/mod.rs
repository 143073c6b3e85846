//! Shared Connection Core
//!
//! ## Architecture
//!
//! - **Connection**: the single shared link (connect/disconnect/publish/subscribe)
//! - **SubscriptionRegistry**: topic- and id-indexed subscription maps
//! - **StatusNotifier**: four-state status with deduplicated fan-out
//! - **Payload**: structured-or-raw decoding of deliveries
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use wirelink::connection::Connection;
//! use wirelink::store::ConnectionConfig;
//! use wirelink::transport::WsTransport;
//!
//! # async fn example() {
//! let conn = Connection::new(Arc::new(WsTransport::new()));
//! let config = ConnectionConfig::new("ws://localhost:8080").user_pass("a", "b");
//!
//! if conn.connect(&config).await {
//!     conn.subscribe("metrics.>", |payload, subject, id| {
//!         println!("[{}] {}: {:?}", id, subject, payload);
//!     });
//!     conn.publish("metrics.cpu", &serde_json::json!({"load": 0.42})).await;
//! }
//! # }
//! ```

mod client;
mod payload;
mod registry;
mod status;

pub use client::{Connection, MessageCallback, NOT_CONNECTED};
pub use payload::Payload;
pub use registry::{Subscription, SubscriptionRegistry};
pub use status::{ConnectionStatus, ListenerId, StatusListener, StatusNotifier, StatusSnapshot};
