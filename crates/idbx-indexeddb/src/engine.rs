//! Engine implementation over the browser's IndexedDB

use std::cell::RefCell;

use idbx_core::engine::{
    Database, DatabaseInfo, Engine, KeyCursor, ObjectStore, Transaction, TransactionMode,
    UpgradeDatabase, UpgradeHandler, UpgradeStore, VersionTransition,
};
use idbx_core::{EngineError, EngineResult, IndexDescriptor, Key, KeyDescriptor, KeyPath, KeyRange};
use serde_json::Value;
use tracing::{debug, warn};
use wasm_bindgen::prelude::*;
use wasm_bindgen::JsCast;
use web_sys::{
    DomStringList, IdbCursor, IdbDatabase, IdbFactory, IdbIndexParameters, IdbObjectStore,
    IdbObjectStoreParameters, IdbOpenDbRequest, IdbRequest, IdbTransaction, IdbTransactionMode,
};

use crate::error::{js_error, IndexedDbError, Result};
use crate::idb::{
    decode, idb_factory, js_to_key, js_to_value, key_range_to_js, key_to_js, value_to_js,
    WebCursorRequest, WebRequest,
};

fn names(list: DomStringList) -> Vec<String> {
    (0..list.length()).filter_map(|i| list.item(i)).collect()
}

fn key_path_to_js(path: &KeyPath) -> JsValue {
    match path {
        KeyPath::Single(path) => JsValue::from_str(path),
        KeyPath::Compound(paths) => paths
            .iter()
            .map(|p| JsValue::from_str(p))
            .collect::<js_sys::Array>()
            .into(),
    }
}

fn set(target: &JsValue, property: &str, value: &JsValue) -> EngineResult<()> {
    js_sys::Reflect::set(target, &property.into(), value)
        .map(|_| ())
        .map_err(js_error)
}

/// The browser's IndexedDB factory.
#[derive(Debug, Clone)]
pub struct WebEngine {
    factory: IdbFactory,
}

impl WebEngine {
    /// Engine over the global `indexedDB`.
    pub fn new() -> Result<Self> {
        Ok(Self {
            factory: idb_factory()?,
        })
    }

    pub fn from_factory(factory: IdbFactory) -> Self {
        Self { factory }
    }
}

fn decode_database(value: JsValue) -> EngineResult<WebDatabase> {
    value
        .dyn_into::<IdbDatabase>()
        .map(|db| WebDatabase { db })
        .map_err(|_| EngineError::data("open result is not an IDBDatabase"))
}

fn decode_databases(value: JsValue) -> EngineResult<Vec<DatabaseInfo>> {
    let infos: Vec<DatabaseInfo> =
        serde_json::from_value(js_to_value(&value)?).map_err(IndexedDbError::from)?;
    Ok(infos)
}

impl Engine for WebEngine {
    type Database = WebDatabase;
    type Upgrade = WebUpgrade;
    type Request<T: 'static> = WebRequest<T>;

    fn open(
        &self,
        name: &str,
        version: u32,
        on_upgrade: UpgradeHandler<WebUpgrade>,
    ) -> EngineResult<WebRequest<WebDatabase>> {
        let open_req: IdbOpenDbRequest = self
            .factory
            .open_with_u32(name, version)
            .map_err(js_error)?;

        let handler = RefCell::new(Some(on_upgrade));
        let req = open_req.clone();
        let on_upgrade = Closure::wrap(Box::new(move |event: web_sys::IdbVersionChangeEvent| {
            let Some(handler) = handler.borrow_mut().take() else {
                return;
            };
            let db: IdbDatabase = match req.result() {
                Ok(result) => result.unchecked_into(),
                Err(e) => {
                    warn!("upgradeneeded without a database: {:?}", e);
                    return;
                }
            };
            let upgrade = WebUpgrade {
                db,
                tx: req.transaction(),
            };
            let old = event.old_version() as u32;
            let transition = VersionTransition {
                old,
                new: event.new_version().map_or(old, |v| v as u32),
            };
            if let Err(e) = handler(&upgrade, transition) {
                warn!("aborting upgrade to version {}: {}", transition.new, e);
                if let Some(tx) = &upgrade.tx {
                    let _ = tx.abort();
                }
            }
        }) as Box<dyn FnMut(web_sys::IdbVersionChangeEvent)>);

        open_req.set_onupgradeneeded(Some(on_upgrade.as_ref().unchecked_ref()));

        Ok(WebRequest::open(
            open_req.unchecked_into::<IdbRequest>(),
            on_upgrade,
            decode_database,
        ))
    }

    fn delete_database(&self, name: &str) -> EngineResult<WebRequest<()>> {
        let req = self.factory.delete_database(name).map_err(js_error)?;
        Ok(WebRequest::new(req.unchecked_into(), decode::unit))
    }

    fn databases(&self) -> EngineResult<WebRequest<Vec<DatabaseInfo>>> {
        let databases = js_sys::Reflect::get(&self.factory, &"databases".into())
            .map_err(js_error)?
            .dyn_into::<js_sys::Function>()
            .map_err(|_| IndexedDbError::Unsupported("indexedDB.databases()".into()))?;
        let promise = databases
            .call0(&self.factory)
            .map_err(js_error)?
            .dyn_into::<js_sys::Promise>()
            .map_err(|_| IndexedDbError::Unsupported("indexedDB.databases() promise".into()))?;
        Ok(WebRequest::from_promise(promise, decode_databases))
    }
}

/// An open IndexedDB connection.
#[derive(Debug, Clone)]
pub struct WebDatabase {
    db: IdbDatabase,
}

impl WebDatabase {
    pub fn raw(&self) -> &IdbDatabase {
        &self.db
    }
}

impl Database for WebDatabase {
    type Transaction = WebTransaction;

    fn name(&self) -> String {
        self.db.name()
    }

    fn version(&self) -> u32 {
        self.db.version() as u32
    }

    fn object_store_names(&self) -> Vec<String> {
        names(self.db.object_store_names())
    }

    fn contains_store(&self, name: &str) -> bool {
        self.db.object_store_names().contains(name)
    }

    fn transaction(&self, store_name: &str, mode: TransactionMode) -> EngineResult<WebTransaction> {
        let idb_mode = match mode {
            TransactionMode::ReadOnly => IdbTransactionMode::Readonly,
            TransactionMode::ReadWrite => IdbTransactionMode::Readwrite,
        };
        let tx = self
            .db
            .transaction_with_str_and_mode(store_name, idb_mode)
            .map_err(js_error)?;
        Ok(WebTransaction { tx, mode })
    }

    fn close(&self) {
        debug!(database = %self.db.name(), "closing");
        self.db.close();
    }
}

pub struct WebTransaction {
    tx: IdbTransaction,
    mode: TransactionMode,
}

impl Transaction for WebTransaction {
    type Store = WebObjectStore;

    fn mode(&self) -> TransactionMode {
        self.mode
    }

    fn object_store(&self, name: &str) -> EngineResult<WebObjectStore> {
        let store = self.tx.object_store(name).map_err(js_error)?;
        Ok(WebObjectStore { store })
    }
}

/// A store inside a [`WebTransaction`].
pub struct WebObjectStore {
    store: IdbObjectStore,
}

impl WebObjectStore {
    fn write(
        &self,
        value: &Value,
        key: Option<&Key>,
        put: bool,
    ) -> EngineResult<WebRequest<Key>> {
        let value = value_to_js(value)?;
        let req = match (key, put) {
            (None, false) => self.store.add(&value),
            (None, true) => self.store.put(&value),
            (Some(key), false) => self.store.add_with_key(&value, &key_to_js(key)?),
            (Some(key), true) => self.store.put_with_key(&value, &key_to_js(key)?),
        }
        .map_err(js_error)?;
        Ok(WebRequest::new(req, decode::key))
    }
}

impl ObjectStore for WebObjectStore {
    type Request<T: 'static> = WebRequest<T>;
    type CursorRequest = WebCursorRequest;

    fn name(&self) -> String {
        self.store.name()
    }

    fn get(&self, key: &Key) -> EngineResult<WebRequest<Option<Value>>> {
        let req = self.store.get(&key_to_js(key)?).map_err(js_error)?;
        Ok(WebRequest::new(req, decode::optional_value))
    }

    fn get_all(&self) -> EngineResult<WebRequest<Vec<Value>>> {
        let req = self.store.get_all().map_err(js_error)?;
        Ok(WebRequest::new(req, decode::values))
    }

    fn add(&self, value: &Value, key: Option<&Key>) -> EngineResult<WebRequest<Key>> {
        self.write(value, key, false)
    }

    fn put(&self, value: &Value, key: Option<&Key>) -> EngineResult<WebRequest<Key>> {
        self.write(value, key, true)
    }

    fn delete(&self, key: &Key) -> EngineResult<WebRequest<()>> {
        let req = self.store.delete(&key_to_js(key)?).map_err(js_error)?;
        Ok(WebRequest::new(req, decode::unit))
    }

    fn clear(&self) -> EngineResult<WebRequest<()>> {
        let req = self.store.clear().map_err(js_error)?;
        Ok(WebRequest::new(req, decode::unit))
    }

    fn index_get(&self, index: &str, key: &Key) -> EngineResult<WebRequest<Option<Value>>> {
        let index = self.store.index(index).map_err(js_error)?;
        let req = index.get(&key_to_js(key)?).map_err(js_error)?;
        Ok(WebRequest::new(req, decode::optional_value))
    }

    fn index_get_all(&self, index: &str, key: &Key) -> EngineResult<WebRequest<Vec<Value>>> {
        let index = self.store.index(index).map_err(js_error)?;
        let req = index.get_all_with_key(&key_to_js(key)?).map_err(js_error)?;
        Ok(WebRequest::new(req, decode::values))
    }

    fn open_key_cursor(&self, range: Option<&KeyRange>) -> EngineResult<WebCursorRequest> {
        let range = match range {
            Some(range) => key_range_to_js(range)?,
            None => None,
        };
        let req = match range {
            Some(range) => self.store.open_key_cursor_with_range(&range),
            None => self.store.open_key_cursor(),
        }
        .map_err(js_error)?;
        Ok(WebCursorRequest::new(req))
    }
}

/// `IDBCursor` handed to navigators.
pub struct WebKeyCursor {
    cursor: IdbCursor,
}

impl WebKeyCursor {
    pub(crate) fn new(cursor: IdbCursor) -> Self {
        Self { cursor }
    }

    fn read_key(value: std::result::Result<JsValue, JsValue>) -> Key {
        value
            .map_err(js_error)
            .and_then(|v| js_to_key(&v))
            .unwrap_or_else(|e| {
                warn!("unreadable cursor key: {}", e);
                Key::Array(Vec::new())
            })
    }
}

impl KeyCursor for WebKeyCursor {
    fn key(&self) -> Key {
        Self::read_key(self.cursor.key())
    }

    fn primary_key(&self) -> Key {
        Self::read_key(self.cursor.primary_key())
    }

    fn continue_(&self) -> EngineResult<()> {
        self.cursor.continue_().map_err(js_error)
    }

    fn advance(&self, count: u32) -> EngineResult<()> {
        self.cursor.advance(count).map_err(js_error)
    }
}

/// The database inside its versionchange transaction.
pub struct WebUpgrade {
    db: IdbDatabase,
    tx: Option<IdbTransaction>,
}

impl UpgradeDatabase for WebUpgrade {
    type Store = WebUpgradeStore;

    fn object_store_names(&self) -> Vec<String> {
        names(self.db.object_store_names())
    }

    fn contains_store(&self, name: &str) -> bool {
        self.db.object_store_names().contains(name)
    }

    fn create_object_store(&self, name: &str, key: &KeyDescriptor) -> EngineResult<WebUpgradeStore> {
        let params = IdbObjectStoreParameters::new();
        if let Some(path) = &key.key_path {
            set(&params, "keyPath", &key_path_to_js(path))?;
        }
        if key.auto_increment {
            set(&params, "autoIncrement", &JsValue::TRUE)?;
        }
        let store = self
            .db
            .create_object_store_with_optional_parameters(name, &params)
            .map_err(js_error)?;
        Ok(WebUpgradeStore { store })
    }

    fn delete_object_store(&self, name: &str) -> EngineResult<()> {
        self.db.delete_object_store(name).map_err(js_error)
    }

    fn object_store(&self, name: &str) -> EngineResult<WebUpgradeStore> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| EngineError::invalid_state("no versionchange transaction"))?;
        let store = tx.object_store(name).map_err(js_error)?;
        Ok(WebUpgradeStore { store })
    }
}

pub struct WebUpgradeStore {
    store: IdbObjectStore,
}

impl UpgradeStore for WebUpgradeStore {
    fn index_names(&self) -> Vec<String> {
        names(self.store.index_names())
    }

    fn create_index(&self, index: &IndexDescriptor) -> EngineResult<()> {
        let params = IdbIndexParameters::new();
        set(&params, "unique", &JsValue::from_bool(index.unique))?;
        set(&params, "multiEntry", &JsValue::from_bool(index.multi_entry))?;
        match &index.key_path {
            KeyPath::Single(path) => self
                .store
                .create_index_with_str_and_optional_parameters(&index.name, path, &params),
            KeyPath::Compound(_) => self.store.create_index_with_str_sequence_and_optional_parameters(
                &index.name,
                &key_path_to_js(&index.key_path),
                &params,
            ),
        }
        .map(|_| ())
        .map_err(js_error)
    }
}
