//! Engine interface consumed by the access layer
//!
//! These traits describe the native transactional key-value engine the way
//! IndexedDB presents it: a versioned database opened by name, an upgrade callback
//! that runs inside the versionchange transaction, store-scoped transactions, and
//! request objects that report completion through success/error signals.
//!
//! Implementations exist for:
//!
//! - **Memory**: single-threaded in-memory engine ([`crate::memory::MemoryEngine`])
//! - **IndexedDB**: browser engine over web-sys (`idbx-indexeddb` crate, WASM only)
//!
//! Nothing here is `Send`: engines are driven from one event loop.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{EngineError, EngineResult};
use crate::key::{Key, KeyRange};
use crate::schema::{IndexDescriptor, KeyDescriptor};

/// Called once with the success payload of a request.
pub type SuccessHandler<T> = Box<dyn FnOnce(T)>;

/// Called once with the error payload of a request.
pub type ErrorHandler = Box<dyn FnOnce(EngineError)>;

/// Called on every cursor step: `Some(cursor)` per entry, `None` once exhausted.
pub type CursorHandler<C> = Box<dyn FnMut(Option<C>)>;

/// Runs inside the versionchange transaction of an open request.
///
/// Returning an error aborts the upgrade, and the open request fails.
pub type UpgradeHandler<U> = Box<dyn FnOnce(&U, VersionTransition) -> EngineResult<()>>;

/// Access mode of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionMode {
    ReadOnly,
    ReadWrite,
}

/// Versions observed by an upgrade pass. `old == 0` means the database was just created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionTransition {
    pub old: u32,
    pub new: u32,
}

/// Entry returned by database enumeration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseInfo {
    pub name: String,
    pub version: u32,
}

/// A pending native operation.
///
/// Implementations call at most one of the two handlers, at most once.
pub trait NativeRequest: 'static {
    type Output: 'static;

    fn on_settled(self, on_success: SuccessHandler<Self::Output>, on_error: ErrorHandler);
}

/// A pending cursor operation. The success signal repeats once per cursor step.
pub trait CursorRequest: 'static {
    type Cursor: KeyCursor;

    fn on_each(self, on_success: CursorHandler<Self::Cursor>, on_error: ErrorHandler);
}

/// Position of a key cursor. Moving it re-fires the request's success signal.
pub trait KeyCursor: 'static {
    fn key(&self) -> Key;

    fn primary_key(&self) -> Key;

    /// Move to the next entry.
    fn continue_(&self) -> EngineResult<()>;

    /// Skip `count` entries.
    fn advance(&self, count: u32) -> EngineResult<()>;
}

/// Factory side of an engine: open, delete and enumerate databases.
pub trait Engine {
    type Database: Database;
    type Upgrade: UpgradeDatabase;
    type Request<T: 'static>: NativeRequest<Output = T>;

    /// Open `name` at `version`, calling `on_upgrade` first if the stored version is lower.
    fn open(
        &self,
        name: &str,
        version: u32,
        on_upgrade: UpgradeHandler<Self::Upgrade>,
    ) -> EngineResult<Self::Request<Self::Database>>;

    fn delete_database(&self, name: &str) -> EngineResult<Self::Request<()>>;

    fn databases(&self) -> EngineResult<Self::Request<Vec<DatabaseInfo>>>;
}

/// An open connection. Clones share the same connection.
pub trait Database: Clone + 'static {
    type Transaction: Transaction;

    fn name(&self) -> String;

    fn version(&self) -> u32;

    fn object_store_names(&self) -> Vec<String>;

    fn contains_store(&self, name: &str) -> bool {
        self.object_store_names().iter().any(|n| n == name)
    }

    /// Start a transaction scoped to a single store.
    fn transaction(&self, store_name: &str, mode: TransactionMode)
        -> EngineResult<Self::Transaction>;

    fn close(&self);
}

pub trait Transaction: 'static {
    type Store: ObjectStore;

    fn mode(&self) -> TransactionMode;

    fn object_store(&self, name: &str) -> EngineResult<Self::Store>;
}

/// A store as seen from inside a transaction.
pub trait ObjectStore: 'static {
    type Request<T: 'static>: NativeRequest<Output = T>;
    type CursorRequest: CursorRequest;

    fn name(&self) -> String;

    fn get(&self, key: &Key) -> EngineResult<Self::Request<Option<Value>>>;

    fn get_all(&self) -> EngineResult<Self::Request<Vec<Value>>>;

    /// Insert; the request fails with `ConstraintError` if the key exists.
    fn add(&self, value: &Value, key: Option<&Key>) -> EngineResult<Self::Request<Key>>;

    /// Insert or overwrite.
    fn put(&self, value: &Value, key: Option<&Key>) -> EngineResult<Self::Request<Key>>;

    fn delete(&self, key: &Key) -> EngineResult<Self::Request<()>>;

    fn clear(&self) -> EngineResult<Self::Request<()>>;

    /// First record (by primary key) whose index key equals `key`.
    fn index_get(&self, index: &str, key: &Key) -> EngineResult<Self::Request<Option<Value>>>;

    fn index_get_all(&self, index: &str, key: &Key) -> EngineResult<Self::Request<Vec<Value>>>;

    /// Forward key cursor over the primary keys in `range`.
    fn open_key_cursor(&self, range: Option<&KeyRange>) -> EngineResult<Self::CursorRequest>;
}

/// The database as seen by an upgrade handler.
pub trait UpgradeDatabase: 'static {
    type Store: UpgradeStore;

    fn object_store_names(&self) -> Vec<String>;

    fn contains_store(&self, name: &str) -> bool {
        self.object_store_names().iter().any(|n| n == name)
    }

    fn create_object_store(&self, name: &str, key: &KeyDescriptor) -> EngineResult<Self::Store>;

    fn delete_object_store(&self, name: &str) -> EngineResult<()>;

    /// An existing store, for index changes.
    fn object_store(&self, name: &str) -> EngineResult<Self::Store>;
}

pub trait UpgradeStore {
    fn index_names(&self) -> Vec<String>;

    fn create_index(&self, index: &IndexDescriptor) -> EngineResult<()>;
}

/// Store handle produced by a database's transactions.
pub type StoreOf<D> = <<D as Database>::Transaction as Transaction>::Store;

/// Request type produced by a database's stores.
pub type RequestOf<D, T> = <StoreOf<D> as ObjectStore>::Request<T>;

/// Cursor type produced by a database's stores.
pub type CursorOf<D> = <<StoreOf<D> as ObjectStore>::CursorRequest as CursorRequest>::Cursor;
