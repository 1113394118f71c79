//! In-memory engine
//!
//! A single-threaded engine with IndexedDB semantics for native targets and tests:
//! versioned databases with an upgrade callback, in-line and out-of-line keys,
//! key generators, unique and multi-entry indices, read-only enforcement and key
//! cursors. Requests settle as soon as their handlers are registered.
//!
//! Differences from a browser engine: upgrades are never blocked by other open
//! connections, and data lives only as long as the `MemoryEngine` value (and its
//! clones).

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::Rc;

use serde_json::Value;

use crate::engine::{
    CursorHandler, CursorRequest, Database, DatabaseInfo, Engine, ErrorHandler, KeyCursor,
    NativeRequest, ObjectStore, SuccessHandler, Transaction, TransactionMode, UpgradeDatabase,
    UpgradeHandler, UpgradeStore, VersionTransition,
};
use crate::error::{EngineError, EngineErrorKind, EngineResult};
use crate::key::{Key, KeyPath, KeyRange};
use crate::schema::{IndexDescriptor, KeyDescriptor};

/// Largest value a key generator hands out.
const MAX_GENERATED_KEY: f64 = 9_007_199_254_740_992.0;

type SharedState = Rc<RefCell<DatabaseState>>;

#[derive(Debug, Clone, Default)]
struct DatabaseState {
    version: u32,
    stores: BTreeMap<String, StoreState>,
}

#[derive(Debug, Clone)]
struct StoreState {
    key: KeyDescriptor,
    indices: BTreeMap<String, IndexDescriptor>,
    records: BTreeMap<Key, Value>,
    next_key: f64,
}

impl StoreState {
    fn new(key: KeyDescriptor) -> Self {
        Self {
            key,
            indices: BTreeMap::new(),
            records: BTreeMap::new(),
            next_key: 1.0,
        }
    }

    fn generate_key(&mut self) -> EngineResult<Key> {
        if self.next_key > MAX_GENERATED_KEY {
            return Err(EngineError::constraint("key generator is exhausted"));
        }
        let key = Key::Number(self.next_key);
        self.next_key += 1.0;
        Ok(key)
    }

    /// Work out the primary key of a record, generating (and injecting) one if needed.
    fn resolve_key(&mut self, record: &mut Value, explicit: Option<&Key>) -> EngineResult<Key> {
        let key_path = self.key.key_path.clone();
        match (key_path, explicit) {
            (Some(_), Some(_)) => Err(EngineError::data(
                "store uses in-line keys, an explicit key is not allowed",
            )),
            (Some(path), None) => match path.extract(record) {
                Some(key) => Ok(key),
                None if self.key.auto_increment && !path.is_present(record) => {
                    let key = self.generate_key()?;
                    path.inject(record, &key)?;
                    Ok(key)
                }
                None => Err(EngineError::data(format!(
                    "record has no valid key at key path {}",
                    path
                ))),
            },
            (None, Some(key)) => Ok(key.clone()),
            (None, None) if self.key.auto_increment => self.generate_key(),
            (None, None) => Err(EngineError::data(
                "store has neither a key path nor a key generator, a key is required",
            )),
        }
    }

    fn insert(&mut self, key: Key, record: Value, no_overwrite: bool) -> EngineResult<Key> {
        if no_overwrite && self.records.contains_key(&key) {
            return Err(EngineError::constraint(format!(
                "key {} already exists in the store",
                key
            )));
        }

        for index in self.indices.values().filter(|i| i.unique) {
            for index_key in index_keys(index, &record) {
                let clash = self
                    .records
                    .iter()
                    .find(|(pk, existing)| **pk != key && index_keys(index, existing).contains(&index_key));
                if let Some((other, _)) = clash {
                    return Err(EngineError::constraint(format!(
                        "unique index '{}' already holds {} for record {}",
                        index.name, index_key, other
                    )));
                }
            }
        }

        if self.key.auto_increment {
            if let Key::Number(n) = key {
                if n >= self.next_key {
                    self.next_key = n.floor() + 1.0;
                }
            }
        }

        self.records.insert(key.clone(), record);
        Ok(key)
    }

    fn index(&self, name: &str) -> EngineResult<&IndexDescriptor> {
        self.indices
            .get(name)
            .ok_or_else(|| EngineError::not_found(format!("no index named '{}'", name)))
    }

    fn matching<'a>(
        &'a self,
        index: &'a IndexDescriptor,
        key: &'a Key,
    ) -> impl Iterator<Item = &'a Value> + 'a {
        self.records
            .values()
            .filter(move |record| index_keys(index, record).contains(key))
    }
}

/// Keys a record contributes to an index. Records without a valid key are not indexed.
///
/// A multi-entry index over an array skips the items that are not valid keys.
fn index_keys(index: &IndexDescriptor, record: &Value) -> Vec<Key> {
    if index.multi_entry {
        if let Some(Value::Array(items)) = index.key_path.value_in(record) {
            let mut keys: Vec<Key> = Vec::with_capacity(items.len());
            for item in items.iter().filter_map(Key::from_value) {
                if !keys.contains(&item) {
                    keys.push(item);
                }
            }
            return keys;
        }
    }
    index.key_path.extract(record).into_iter().collect()
}

/// Request whose outcome is known when it is issued.
#[derive(Debug)]
pub struct MemoryRequest<T> {
    result: EngineResult<T>,
}

impl<T> MemoryRequest<T> {
    fn ready(result: EngineResult<T>) -> Self {
        Self { result }
    }
}

impl<T: 'static> NativeRequest for MemoryRequest<T> {
    type Output = T;

    fn on_settled(self, on_success: SuccessHandler<T>, on_error: ErrorHandler) {
        match self.result {
            Ok(value) => on_success(value),
            Err(error) => on_error(error),
        }
    }
}

/// In-memory engine. Clones share the same set of databases.
#[derive(Debug, Clone, Default)]
pub struct MemoryEngine {
    databases: Rc<RefCell<BTreeMap<String, SharedState>>>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored version of a database, `None` if it does not exist.
    pub fn version(&self, name: &str) -> Option<u32> {
        self.databases
            .borrow()
            .get(name)
            .map(|state| state.borrow().version)
            .filter(|v| *v > 0)
    }
}

impl Engine for MemoryEngine {
    type Database = MemoryDatabase;
    type Upgrade = MemoryUpgrade;
    type Request<T: 'static> = MemoryRequest<T>;

    fn open(
        &self,
        name: &str,
        version: u32,
        on_upgrade: UpgradeHandler<MemoryUpgrade>,
    ) -> EngineResult<MemoryRequest<MemoryDatabase>> {
        if version == 0 {
            return Err(EngineError::new(
                EngineErrorKind::Type,
                "version must be at least 1",
            ));
        }

        let state = self
            .databases
            .borrow_mut()
            .entry(name.to_string())
            .or_default()
            .clone();
        let current = state.borrow().version;

        if current > version {
            return Ok(MemoryRequest::ready(Err(EngineError::version(format!(
                "requested version {} is lower than the stored version {}",
                version, current
            )))));
        }

        if current < version {
            let snapshot = state.borrow().clone();
            let upgrade = MemoryUpgrade {
                state: state.clone(),
            };
            let transition = VersionTransition {
                old: current,
                new: version,
            };
            if let Err(error) = on_upgrade(&upgrade, transition) {
                *state.borrow_mut() = snapshot;
                if current == 0 {
                    self.databases.borrow_mut().remove(name);
                }
                return Ok(MemoryRequest::ready(Err(EngineError::abort(format!(
                    "upgrade to version {} aborted: {}",
                    version, error
                )))));
            }
            state.borrow_mut().version = version;
        }

        Ok(MemoryRequest::ready(Ok(MemoryDatabase {
            name: name.to_string(),
            version,
            state,
            closed: Rc::new(Cell::new(false)),
        })))
    }

    fn delete_database(&self, name: &str) -> EngineResult<MemoryRequest<()>> {
        self.databases.borrow_mut().remove(name);
        Ok(MemoryRequest::ready(Ok(())))
    }

    fn databases(&self) -> EngineResult<MemoryRequest<Vec<DatabaseInfo>>> {
        let infos = self
            .databases
            .borrow()
            .iter()
            .map(|(name, state)| DatabaseInfo {
                name: name.clone(),
                version: state.borrow().version,
            })
            .filter(|info| info.version > 0)
            .collect();
        Ok(MemoryRequest::ready(Ok(infos)))
    }
}

/// An open in-memory connection.
#[derive(Debug, Clone)]
pub struct MemoryDatabase {
    name: String,
    version: u32,
    state: SharedState,
    closed: Rc<Cell<bool>>,
}

impl MemoryDatabase {
    /// Index names of a store, sorted.
    pub fn index_names(&self, store: &str) -> EngineResult<Vec<String>> {
        let state = self.state.borrow();
        let store = state
            .stores
            .get(store)
            .ok_or_else(|| EngineError::not_found(format!("no store named '{}'", store)))?;
        Ok(store.indices.keys().cloned().collect())
    }

    /// Declared shape of one index.
    pub fn index_descriptor(&self, store: &str, index: &str) -> EngineResult<IndexDescriptor> {
        let state = self.state.borrow();
        let store = state
            .stores
            .get(store)
            .ok_or_else(|| EngineError::not_found(format!("no store named '{}'", store)))?;
        store.index(index).cloned()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.get()
    }
}

impl Database for MemoryDatabase {
    type Transaction = MemoryTransaction;

    fn name(&self) -> String {
        self.name.clone()
    }

    fn version(&self) -> u32 {
        self.version
    }

    fn object_store_names(&self) -> Vec<String> {
        self.state.borrow().stores.keys().cloned().collect()
    }

    fn transaction(
        &self,
        store_name: &str,
        mode: TransactionMode,
    ) -> EngineResult<MemoryTransaction> {
        if self.closed.get() {
            return Err(EngineError::invalid_state(format!(
                "connection to '{}' is closed",
                self.name
            )));
        }
        if !self.state.borrow().stores.contains_key(store_name) {
            return Err(EngineError::not_found(format!(
                "no store named '{}'",
                store_name
            )));
        }
        Ok(MemoryTransaction {
            state: self.state.clone(),
            scope: store_name.to_string(),
            mode,
        })
    }

    fn close(&self) {
        self.closed.set(true);
    }
}

/// A transaction over one store.
#[derive(Debug)]
pub struct MemoryTransaction {
    state: SharedState,
    scope: String,
    mode: TransactionMode,
}

impl Transaction for MemoryTransaction {
    type Store = MemoryObjectStore;

    fn mode(&self) -> TransactionMode {
        self.mode
    }

    fn object_store(&self, name: &str) -> EngineResult<MemoryObjectStore> {
        if name != self.scope {
            return Err(EngineError::not_found(format!(
                "store '{}' is not in this transaction's scope",
                name
            )));
        }
        Ok(MemoryObjectStore {
            state: self.state.clone(),
            name: self.scope.clone(),
            mode: self.mode,
        })
    }
}

/// A store inside a [`MemoryTransaction`].
#[derive(Debug)]
pub struct MemoryObjectStore {
    state: SharedState,
    name: String,
    mode: TransactionMode,
}

impl MemoryObjectStore {
    fn read<R>(&self, f: impl FnOnce(&StoreState) -> EngineResult<R>) -> EngineResult<R> {
        let state = self.state.borrow();
        let store = state.stores.get(&self.name).ok_or_else(|| {
            EngineError::invalid_state(format!("store '{}' has been deleted", self.name))
        })?;
        f(store)
    }

    fn write<R>(&self, f: impl FnOnce(&mut StoreState) -> EngineResult<R>) -> EngineResult<R> {
        if self.mode == TransactionMode::ReadOnly {
            return Err(EngineError::read_only(format!(
                "transaction on '{}' is read-only",
                self.name
            )));
        }
        let mut state = self.state.borrow_mut();
        let store = state.stores.get_mut(&self.name).ok_or_else(|| {
            EngineError::invalid_state(format!("store '{}' has been deleted", self.name))
        })?;
        f(store)
    }

    fn store_record(
        &self,
        value: &Value,
        key: Option<&Key>,
        no_overwrite: bool,
    ) -> EngineResult<MemoryRequest<Key>> {
        self.write(|store| {
            let mut record = value.clone();
            let key = store.resolve_key(&mut record, key)?;
            Ok(MemoryRequest::ready(store.insert(key, record, no_overwrite)))
        })
    }
}

impl ObjectStore for MemoryObjectStore {
    type Request<T: 'static> = MemoryRequest<T>;
    type CursorRequest = MemoryCursorRequest;

    fn name(&self) -> String {
        self.name.clone()
    }

    fn get(&self, key: &Key) -> EngineResult<MemoryRequest<Option<Value>>> {
        self.read(|store| Ok(MemoryRequest::ready(Ok(store.records.get(key).cloned()))))
    }

    fn get_all(&self) -> EngineResult<MemoryRequest<Vec<Value>>> {
        self.read(|store| {
            Ok(MemoryRequest::ready(Ok(store
                .records
                .values()
                .cloned()
                .collect())))
        })
    }

    fn add(&self, value: &Value, key: Option<&Key>) -> EngineResult<MemoryRequest<Key>> {
        self.store_record(value, key, true)
    }

    fn put(&self, value: &Value, key: Option<&Key>) -> EngineResult<MemoryRequest<Key>> {
        self.store_record(value, key, false)
    }

    fn delete(&self, key: &Key) -> EngineResult<MemoryRequest<()>> {
        self.write(|store| {
            store.records.remove(key);
            Ok(MemoryRequest::ready(Ok(())))
        })
    }

    fn clear(&self) -> EngineResult<MemoryRequest<()>> {
        self.write(|store| {
            store.records.clear();
            Ok(MemoryRequest::ready(Ok(())))
        })
    }

    fn index_get(&self, index: &str, key: &Key) -> EngineResult<MemoryRequest<Option<Value>>> {
        self.read(|store| {
            let index = store.index(index)?;
            Ok(MemoryRequest::ready(Ok(store
                .matching(index, key)
                .next()
                .cloned())))
        })
    }

    fn index_get_all(&self, index: &str, key: &Key) -> EngineResult<MemoryRequest<Vec<Value>>> {
        self.read(|store| {
            let index = store.index(index)?;
            Ok(MemoryRequest::ready(Ok(store
                .matching(index, key)
                .cloned()
                .collect())))
        })
    }

    fn open_key_cursor(&self, range: Option<&KeyRange>) -> EngineResult<MemoryCursorRequest> {
        self.read(|store| {
            let keys = store
                .records
                .keys()
                .filter(|key| range.map_or(true, |r| r.contains(key)))
                .cloned()
                .collect();
            Ok(MemoryCursorRequest { keys })
        })
    }
}

/// Key cursor request over a snapshot of the matching keys.
#[derive(Debug)]
pub struct MemoryCursorRequest {
    keys: Vec<Key>,
}

impl CursorRequest for MemoryCursorRequest {
    type Cursor = MemoryKeyCursor;

    fn on_each(self, on_success: CursorHandler<MemoryKeyCursor>, _on_error: ErrorHandler) {
        let walk = Rc::new(CursorWalk {
            keys: self.keys,
            position: Cell::new(0),
            next: Cell::new(Some(0)),
            finished: Cell::new(false),
            active: Cell::new(true),
            delivering: Cell::new(false),
            handler: RefCell::new(on_success),
        });
        CursorWalk::drive(&walk);
    }
}

struct CursorWalk {
    keys: Vec<Key>,
    position: Cell<usize>,
    /// Position requested by `continue_`/`advance` and not yet delivered.
    next: Cell<Option<usize>>,
    finished: Cell<bool>,
    /// Cleared once the walk stops with no step pending; the transaction is over.
    active: Cell<bool>,
    delivering: Cell<bool>,
    handler: RefCell<CursorHandler<MemoryKeyCursor>>,
}

impl CursorWalk {
    /// Deliver pending steps. Steps requested from inside the handler are picked up by
    /// the running loop instead of recursing.
    ///
    /// Only runs once: when the loop drains, the walk goes inactive.
    fn drive(walk: &Rc<CursorWalk>) {
        if walk.delivering.replace(true) {
            return;
        }
        while let Some(position) = walk.next.take() {
            let step = if position < walk.keys.len() {
                walk.position.set(position);
                Some(MemoryKeyCursor { walk: walk.clone() })
            } else {
                walk.finished.set(true);
                None
            };
            let mut handler = walk.handler.borrow_mut();
            (&mut *handler)(step);
        }
        walk.active.set(false);
        walk.delivering.set(false);
    }
}

/// Cursor handed to navigators by the memory engine.
#[derive(Clone)]
pub struct MemoryKeyCursor {
    walk: Rc<CursorWalk>,
}

impl std::fmt::Debug for MemoryKeyCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryKeyCursor")
            .field("key", &self.key())
            .finish()
    }
}

impl KeyCursor for MemoryKeyCursor {
    fn key(&self) -> Key {
        self.walk.keys[self.walk.position.get()].clone()
    }

    fn primary_key(&self) -> Key {
        self.key()
    }

    fn continue_(&self) -> EngineResult<()> {
        self.advance(1)
    }

    fn advance(&self, count: u32) -> EngineResult<()> {
        if count == 0 {
            return Err(EngineError::new(
                EngineErrorKind::Type,
                "advance count must be positive",
            ));
        }
        if !self.walk.active.get() {
            return Err(EngineError::new(
                EngineErrorKind::TransactionInactive,
                "cursor's transaction has finished",
            ));
        }
        if self.walk.finished.get() || self.walk.next.get().is_some() {
            return Err(EngineError::invalid_state(
                "cursor is already advancing or has finished",
            ));
        }
        self.walk
            .next
            .set(Some(self.walk.position.get() + count as usize));
        Ok(())
    }
}

/// Database handle passed to upgrade handlers.
#[derive(Debug, Clone)]
pub struct MemoryUpgrade {
    state: SharedState,
}

impl UpgradeDatabase for MemoryUpgrade {
    type Store = MemoryUpgradeStore;

    fn object_store_names(&self) -> Vec<String> {
        self.state.borrow().stores.keys().cloned().collect()
    }

    fn create_object_store(
        &self,
        name: &str,
        key: &KeyDescriptor,
    ) -> EngineResult<MemoryUpgradeStore> {
        let mut state = self.state.borrow_mut();
        if state.stores.contains_key(name) {
            return Err(EngineError::constraint(format!(
                "store '{}' already exists",
                name
            )));
        }
        let generator_path_invalid = match &key.key_path {
            Some(KeyPath::Compound(_)) => true,
            Some(KeyPath::Single(path)) => path.is_empty(),
            None => false,
        };
        if key.auto_increment && generator_path_invalid {
            return Err(EngineError::invalid_state(format!(
                "store '{}' cannot use a key generator with key path {:?}",
                name, key.key_path
            )));
        }
        state
            .stores
            .insert(name.to_string(), StoreState::new(key.clone()));
        Ok(MemoryUpgradeStore {
            state: self.state.clone(),
            name: name.to_string(),
        })
    }

    fn delete_object_store(&self, name: &str) -> EngineResult<()> {
        self.state
            .borrow_mut()
            .stores
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| EngineError::not_found(format!("no store named '{}'", name)))
    }

    fn object_store(&self, name: &str) -> EngineResult<MemoryUpgradeStore> {
        if !self.state.borrow().stores.contains_key(name) {
            return Err(EngineError::not_found(format!("no store named '{}'", name)));
        }
        Ok(MemoryUpgradeStore {
            state: self.state.clone(),
            name: name.to_string(),
        })
    }
}

/// Store handle passed to upgrade handlers.
#[derive(Debug)]
pub struct MemoryUpgradeStore {
    state: SharedState,
    name: String,
}

impl UpgradeStore for MemoryUpgradeStore {
    fn index_names(&self) -> Vec<String> {
        self.state
            .borrow()
            .stores
            .get(&self.name)
            .map(|store| store.indices.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn create_index(&self, index: &IndexDescriptor) -> EngineResult<()> {
        let mut state = self.state.borrow_mut();
        let store = state.stores.get_mut(&self.name).ok_or_else(|| {
            EngineError::invalid_state(format!("store '{}' has been deleted", self.name))
        })?;
        if store.indices.contains_key(&index.name) {
            return Err(EngineError::constraint(format!(
                "index '{}' already exists on store '{}'",
                index.name, self.name
            )));
        }
        if index.multi_entry && matches!(index.key_path, KeyPath::Compound(_)) {
            return Err(EngineError::invalid_state(format!(
                "multiEntry index '{}' cannot use a compound key path",
                index.name
            )));
        }
        if index.unique {
            let mut seen: Vec<Key> = Vec::new();
            for record in store.records.values() {
                for key in index_keys(index, record) {
                    if seen.contains(&key) {
                        return Err(EngineError::constraint(format!(
                            "existing records violate unique index '{}' at {}",
                            index.name, key
                        )));
                    }
                    seen.push(key);
                }
            }
        }
        store.indices.insert(index.name.clone(), index.clone());
        Ok(())
    }
}
