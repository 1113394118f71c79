//! IndexedDB engine for idbx (browser WASM)
//!
//! Implements the `idbx_core::engine` traits over web-sys, so the connection manager
//! and typed actions from `idbx-core` run against the browser's IndexedDB unchanged.
//!
//! Records cross the boundary as JSON: `serde_json::Value` is turned into a JS value
//! with `JSON.parse`, and results come back through `JSON.stringify`. Keys that JSON
//! cannot express (dates, binary keys) are not supported.
//!
//! # Example
//!
//! ```rust,ignore
//! use idbx_core::{open_db_connection, DatabaseConfig, StoreSchema};
//! use idbx_indexeddb::WebEngine;
//!
//! let engine = WebEngine::new()?;
//! let config = DatabaseConfig::new("app", 1).store(StoreSchema::new("users").key_path("id"));
//!
//! let connection = open_db_connection(&engine, &config).await?;
//! let users = connection.actions::<serde_json::Value>("users");
//! users.add(&serde_json::json!({ "id": 1, "name": "Ann" })).await?;
//! ```

pub mod engine;
pub mod error;
pub mod idb;

pub use engine::{WebDatabase, WebEngine, WebKeyCursor, WebObjectStore, WebUpgrade};
pub use error::{IndexedDbError, Result};
pub use idb::{idb_factory, live_cursor_walks, WebCursorRequest, WebRequest};
