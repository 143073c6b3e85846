//! Connection Configuration Persistence
//!
//! - **ConfigStore**: get/save/validate the connection document
//! - **ProfileStorage**: key/value backends shared by every instance of a
//!   profile (`MemoryStorage`, `FileStorage`)
//! - **ConfigWatcher**: edits made by sibling instances

mod config;
mod error;
mod storage;

pub use config::{
    ConfigChange, ConfigStore, ConfigViolation, ConfigWatcher, ConnectionConfig,
    ValidationReport, CONFIG_KEY,
};
pub use error::{StorageError, StorageResult};
pub use storage::{FileStorage, MemoryStorage, ProfileStorage, StorageEvent};
