//! idbx core
//!
//! A future-based access layer over versioned, transactional object store engines
//! shaped like IndexedDB. The same code drives the browser engine (`idbx-indexeddb`)
//! and the in-memory engine shipped here.
//!
//! # Layers
//!
//! - [`bridge`] - native success/error signals to futures
//! - [`transaction`] - one single-store transaction per call
//! - [`connection`] - versioned open with store reconciliation and forced refresh
//! - [`actions`] - typed get/add/update/delete/cursor operations for one store
//!
//! # Example
//!
//! ```rust
//! use idbx_core::{open_db_connection, DatabaseConfig, MemoryEngine, StoreSchema};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, PartialEq, Serialize, Deserialize)]
//! struct User {
//!     id: u32,
//!     name: String,
//! }
//!
//! # futures::executor::block_on(async {
//! let engine = MemoryEngine::new();
//! let config = DatabaseConfig::new("app", 1).store(StoreSchema::new("users").key_path("id"));
//!
//! let connection = open_db_connection(&engine, &config).await?;
//! let users = connection.actions::<User>("users");
//!
//! let key = users.add(&User { id: 1, name: "Ann".into() }).await?;
//! assert_eq!(users.get_by_id(key).await?.map(|u| u.name), Some("Ann".to_string()));
//! assert!(users.delete_all().await?);
//! assert!(users.get_all().await?.is_empty());
//! # Ok::<(), idbx_core::IdbxError>(())
//! # }).unwrap();
//! ```

pub mod actions;
pub mod bridge;
pub mod connection;
pub mod engine;
pub mod error;
pub mod key;
pub mod logging;
pub mod memory;
pub mod schema;
pub mod transaction;

// Re-export main types at crate root
pub use actions::{get_actions, ActionBinding, Actions, ResultPolicy};
pub use bridge::{promisify, promisify_cursor, Settled};
pub use connection::{
    delete_database, list_databases, open_db_connection, reconcile_stores, Connection,
    RefreshState,
};
pub use engine::{
    Database, DatabaseInfo, Engine, KeyCursor, TransactionMode, UpgradeDatabase,
    VersionTransition,
};
pub use error::{EngineError, EngineErrorKind, EngineResult, IdbxError, Result};
pub use key::{Key, KeyPath, KeyRange};
pub use memory::{MemoryDatabase, MemoryEngine};
pub use schema::{DatabaseConfig, IndexDescriptor, KeyDescriptor, StoreSchema, StoreSummary};
pub use transaction::acquire_store;
