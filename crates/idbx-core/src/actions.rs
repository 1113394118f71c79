//! Typed store actions
//!
//! [`get_actions`] binds a database handle and a store name into [`Actions`], one
//! method per operation. Every call opens its own single-store transaction, issues
//! exactly one native request and awaits it through the request bridge.
//!
//! ```ignore
//! let users: Actions<_, User> = connection.actions("users");
//! let key = users.add(&User { id: 1, name: "Ann".into() }).await?;
//! assert_eq!(users.get_by_id(key).await?.map(|u| u.name), Some("Ann".into()));
//! assert!(users.delete_all().await?);
//! ```

use std::fmt;
use std::marker::PhantomData;
use std::rc::Rc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::bridge::{promisify, promisify_cursor};
use crate::engine::{CursorOf, Database, ObjectStore, RequestOf, StoreOf, TransactionMode};
use crate::error::{EngineResult, Result};
use crate::key::{Key, KeyRange};
use crate::logging::prefix;
use crate::transaction::acquire_store;

/// A database handle plus the store every action of one [`Actions`] targets.
#[derive(Debug, Clone)]
pub struct ActionBinding<D> {
    pub handle: D,
    pub store_name: String,
}

impl<D> ActionBinding<D> {
    pub fn new(handle: D, store_name: impl Into<String>) -> Self {
        Self {
            handle,
            store_name: store_name.into(),
        }
    }
}

/// How an action turns the native result into its own.
#[derive(Debug, Clone)]
pub enum ResultPolicy<N, R> {
    /// Hand the native result on (through a conversion).
    PassThrough(fn(N) -> R),
    /// Ignore the native result and resolve with a fixed value.
    Literal(R),
}

impl<N, R: Clone> ResultPolicy<N, R> {
    pub fn apply(&self, native: N) -> R {
        match self {
            ResultPolicy::PassThrough(convert) => convert(native),
            ResultPolicy::Literal(value) => value.clone(),
        }
    }
}

type Requester<D, I, N> = fn(&StoreOf<D>, I) -> EngineResult<RequestOf<D, N>>;

/// One named operation: store mode, the native call it issues, and its result policy.
pub struct DbAction<D: Database, I, N: 'static, R> {
    binding: Rc<ActionBinding<D>>,
    name: &'static str,
    mode: TransactionMode,
    requester: Requester<D, I, N>,
    policy: ResultPolicy<N, R>,
}

impl<D: Database, I, N: 'static, R: Clone> DbAction<D, I, N, R> {
    pub fn new(
        binding: Rc<ActionBinding<D>>,
        name: &'static str,
        mode: TransactionMode,
        requester: Requester<D, I, N>,
        policy: ResultPolicy<N, R>,
    ) -> Self {
        Self {
            binding,
            name,
            mode,
            requester,
            policy,
        }
    }

    pub fn mode(&self) -> TransactionMode {
        self.mode
    }

    pub async fn call(&self, input: I) -> Result<R> {
        debug!(
            "{} {} on '{}' ({:?})",
            prefix::DB,
            self.name,
            self.binding.store_name,
            self.mode
        );
        let store = acquire_store(&self.binding.handle, &self.binding.store_name, self.mode).await?;
        let request = (self.requester)(&store, input)?;
        let native = promisify(request).await?;
        Ok(self.policy.apply(native))
    }
}

impl<D: Database, I, N: 'static, R> fmt::Debug for DbAction<D, I, N, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbAction")
            .field("name", &self.name)
            .field("store", &self.binding.store_name)
            .field("mode", &self.mode)
            .finish()
    }
}

/// Key cursor walk. Resolves as soon as the cursor opens; the navigator keeps
/// receiving entries afterwards.
pub struct CursorAction<D: Database> {
    binding: Rc<ActionBinding<D>>,
    mode: TransactionMode,
    policy: ResultPolicy<(), bool>,
}

impl<D: Database> CursorAction<D> {
    pub fn mode(&self) -> TransactionMode {
        self.mode
    }

    pub async fn call<F>(&self, key_range: Option<KeyRange>, navigator: F) -> Result<bool>
    where
        F: FnMut(&CursorOf<D>) + 'static,
    {
        debug!(
            "{} open_cursor on '{}' ({:?})",
            prefix::DB,
            self.binding.store_name,
            self.mode
        );
        let store = acquire_store(&self.binding.handle, &self.binding.store_name, self.mode).await?;
        let request = store.open_key_cursor(key_range.as_ref())?;
        promisify_cursor(request, navigator).await?;
        Ok(self.policy.apply(()))
    }
}

impl<D: Database> fmt::Debug for CursorAction<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CursorAction")
            .field("store", &self.binding.store_name)
            .field("mode", &self.mode)
            .finish()
    }
}

/// Index name and the index key to look up.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexQuery {
    pub index: String,
    pub value: Key,
}

/// A record on its way into a store, with an optional out-of-line key.
#[derive(Debug, Clone, PartialEq)]
pub struct Write {
    pub value: Value,
    pub key: Option<Key>,
}

/// The fixed operation set for one store, typed over the record type `T`.
pub struct Actions<D: Database, T> {
    pub get_by_id: DbAction<D, Key, Option<Value>, Option<Value>>,
    pub get_one_by_index: DbAction<D, IndexQuery, Option<Value>, Option<Value>>,
    pub get_many_by_index: DbAction<D, IndexQuery, Vec<Value>, Vec<Value>>,
    pub get_all: DbAction<D, (), Vec<Value>, Vec<Value>>,
    pub add: DbAction<D, Write, Key, Key>,
    pub update: DbAction<D, Write, Key, Key>,
    pub delete_by_id: DbAction<D, Key, (), bool>,
    pub delete_all: DbAction<D, (), (), bool>,
    pub open_cursor: CursorAction<D>,
    record: PhantomData<fn() -> T>,
}

fn identity<N>(native: N) -> N {
    native
}

fn get_by_id<S: ObjectStore>(store: &S, id: Key) -> EngineResult<S::Request<Option<Value>>> {
    store.get(&id)
}

fn get_one_by_index<S: ObjectStore>(
    store: &S,
    query: IndexQuery,
) -> EngineResult<S::Request<Option<Value>>> {
    store.index_get(&query.index, &query.value)
}

fn get_many_by_index<S: ObjectStore>(
    store: &S,
    query: IndexQuery,
) -> EngineResult<S::Request<Vec<Value>>> {
    store.index_get_all(&query.index, &query.value)
}

fn get_all<S: ObjectStore>(store: &S, _: ()) -> EngineResult<S::Request<Vec<Value>>> {
    store.get_all()
}

fn add<S: ObjectStore>(store: &S, write: Write) -> EngineResult<S::Request<Key>> {
    store.add(&write.value, write.key.as_ref())
}

fn update<S: ObjectStore>(store: &S, write: Write) -> EngineResult<S::Request<Key>> {
    store.put(&write.value, write.key.as_ref())
}

fn delete_by_id<S: ObjectStore>(store: &S, id: Key) -> EngineResult<S::Request<()>> {
    store.delete(&id)
}

fn delete_all<S: ObjectStore>(store: &S, _: ()) -> EngineResult<S::Request<()>> {
    store.clear()
}

/// Build the operation set for `binding`.
pub fn get_actions<D, T>(binding: ActionBinding<D>) -> Actions<D, T>
where
    D: Database,
    T: Serialize + DeserializeOwned,
{
    use ResultPolicy::{Literal, PassThrough};
    use TransactionMode::{ReadOnly, ReadWrite};

    let b = Rc::new(binding);
    Actions {
        get_by_id: DbAction::new(
            b.clone(),
            "get_by_id",
            ReadOnly,
            get_by_id::<StoreOf<D>>,
            PassThrough(identity),
        ),
        get_one_by_index: DbAction::new(
            b.clone(),
            "get_one_by_index",
            ReadOnly,
            get_one_by_index::<StoreOf<D>>,
            PassThrough(identity),
        ),
        get_many_by_index: DbAction::new(
            b.clone(),
            "get_many_by_index",
            ReadOnly,
            get_many_by_index::<StoreOf<D>>,
            PassThrough(identity),
        ),
        get_all: DbAction::new(
            b.clone(),
            "get_all",
            ReadOnly,
            get_all::<StoreOf<D>>,
            PassThrough(identity),
        ),
        add: DbAction::new(
            b.clone(),
            "add",
            ReadWrite,
            add::<StoreOf<D>>,
            PassThrough(identity),
        ),
        update: DbAction::new(
            b.clone(),
            "update",
            ReadWrite,
            update::<StoreOf<D>>,
            PassThrough(identity),
        ),
        delete_by_id: DbAction::new(
            b.clone(),
            "delete_by_id",
            ReadWrite,
            delete_by_id::<StoreOf<D>>,
            Literal(true),
        ),
        delete_all: DbAction::new(
            b.clone(),
            "delete_all",
            ReadWrite,
            delete_all::<StoreOf<D>>,
            Literal(true),
        ),
        open_cursor: CursorAction {
            binding: b,
            mode: ReadOnly,
            policy: Literal(true),
        },
        record: PhantomData,
    }
}

fn decode<T: DeserializeOwned>(value: Value) -> Result<T> {
    Ok(serde_json::from_value(value)?)
}

impl<D, T> Actions<D, T>
where
    D: Database,
    T: Serialize + DeserializeOwned,
{
    pub fn store_name(&self) -> &str {
        &self.get_by_id.binding.store_name
    }

    /// Record with primary key `id`, if any.
    pub async fn get_by_id(&self, id: impl Into<Key>) -> Result<Option<T>> {
        self.get_by_id.call(id.into()).await?.map(decode).transpose()
    }

    /// First record (by primary key) whose `index` key equals `value`.
    pub async fn get_one_by_index(
        &self,
        index: &str,
        value: impl Into<Key>,
    ) -> Result<Option<T>> {
        let query = IndexQuery {
            index: index.to_string(),
            value: value.into(),
        };
        self.get_one_by_index.call(query).await?.map(decode).transpose()
    }

    /// Every record whose `index` key equals `value`.
    pub async fn get_many_by_index(&self, index: &str, value: impl Into<Key>) -> Result<Vec<T>> {
        let query = IndexQuery {
            index: index.to_string(),
            value: value.into(),
        };
        self.get_many_by_index
            .call(query)
            .await?
            .into_iter()
            .map(decode)
            .collect()
    }

    pub async fn get_all(&self) -> Result<Vec<T>> {
        self.get_all.call(()).await?.into_iter().map(decode).collect()
    }

    /// Insert `value`; fails with `ConstraintError` if its key is taken.
    pub async fn add(&self, value: &T) -> Result<Key> {
        self.add.call(encode(value, None)?).await
    }

    /// Insert `value` under an out-of-line key.
    pub async fn add_with_key(&self, value: &T, key: impl Into<Key>) -> Result<Key> {
        self.add.call(encode(value, Some(key.into()))?).await
    }

    /// Insert or overwrite `value`.
    pub async fn update(&self, value: &T) -> Result<Key> {
        self.update.call(encode(value, None)?).await
    }

    pub async fn update_with_key(&self, value: &T, key: impl Into<Key>) -> Result<Key> {
        self.update.call(encode(value, Some(key.into()))?).await
    }

    /// Resolves `true`; deleting a missing key is not an error.
    pub async fn delete_by_id(&self, id: impl Into<Key>) -> Result<bool> {
        self.delete_by_id.call(id.into()).await
    }

    pub async fn delete_all(&self) -> Result<bool> {
        self.delete_all.call(()).await
    }

    /// Walk the primary keys in `key_range`, calling `navigator` for each entry.
    ///
    /// Resolves `true` once the cursor opens. The navigator must call `continue_` or
    /// `advance` on the cursor to receive the next entry.
    pub async fn open_cursor<F>(&self, key_range: Option<KeyRange>, navigator: F) -> Result<bool>
    where
        F: FnMut(&CursorOf<D>) + 'static,
    {
        self.open_cursor.call(key_range, navigator).await
    }
}

fn encode<T: Serialize>(value: &T, key: Option<Key>) -> Result<Write> {
    Ok(Write {
        value: serde_json::to_value(value)?,
        key,
    })
}

impl<D: Database, T> fmt::Debug for Actions<D, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Actions")
            .field("store", &self.get_by_id.binding.store_name)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::open_db_connection;
    use crate::error::{EngineErrorKind, IdbxError};
    use crate::memory::{MemoryDatabase, MemoryEngine};
    use crate::schema::{DatabaseConfig, StoreSchema};
    use pretty_assertions::assert_eq;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Note {
        id: u32,
        text: String,
    }

    async fn notes() -> Actions<MemoryDatabase, Note> {
        let engine = MemoryEngine::new();
        let config = DatabaseConfig::new("app", 1).store(StoreSchema::new("notes").key_path("id"));
        open_db_connection(&engine, &config)
            .await
            .unwrap()
            .actions("notes")
    }

    #[test]
    fn test_result_policy() {
        let pass: ResultPolicy<u32, u32> = ResultPolicy::PassThrough(|n| n * 2);
        assert_eq!(pass.apply(21), 42);

        let literal: ResultPolicy<(), bool> = ResultPolicy::Literal(true);
        assert!(literal.apply(()));
    }

    #[tokio::test]
    async fn test_modes() {
        let actions = notes().await;
        assert_eq!(actions.store_name(), "notes");
        assert_eq!(actions.get_by_id.mode(), TransactionMode::ReadOnly);
        assert_eq!(actions.get_all.mode(), TransactionMode::ReadOnly);
        assert_eq!(actions.add.mode(), TransactionMode::ReadWrite);
        assert_eq!(actions.delete_all.mode(), TransactionMode::ReadWrite);
        assert_eq!(actions.open_cursor.mode(), TransactionMode::ReadOnly);
    }

    #[tokio::test]
    async fn test_update_overwrites() {
        let actions = notes().await;
        let note = Note {
            id: 3,
            text: "draft".into(),
        };
        actions.add(&note).await.unwrap();
        actions
            .update(&Note {
                text: "final".into(),
                ..note
            })
            .await
            .unwrap();

        let stored = actions.get_by_id(3).await.unwrap().unwrap();
        assert_eq!(stored.text, "final");
    }

    #[tokio::test]
    async fn test_engine_error_passes_through() {
        let actions = notes().await;
        let note = Note {
            id: 1,
            text: "a".into(),
        };
        actions.add(&note).await.unwrap();

        match actions.add(&note).await {
            Err(IdbxError::Request(e)) => assert_eq!(e.kind, EngineErrorKind::Constraint),
            other => panic!("expected constraint error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_decode_failure_is_serialization_error() {
        let actions = notes().await;
        actions
            .add(&Note {
                id: 1,
                text: "a".into(),
            })
            .await
            .unwrap();

        let wrong: Actions<MemoryDatabase, Vec<u8>> =
            get_actions(ActionBinding::new(actions.get_by_id.binding.handle.clone(), "notes"));
        assert!(matches!(
            wrong.get_by_id(1).await,
            Err(IdbxError::Serialization(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_store_fails_on_call() {
        let actions = notes().await;
        let missing: Actions<MemoryDatabase, Note> =
            get_actions(ActionBinding::new(actions.get_by_id.binding.handle.clone(), "ghosts"));

        let err = missing.get_all().await.unwrap_err();
        assert_eq!(
            err.engine_error().map(|e| e.kind),
            Some(EngineErrorKind::NotFound)
        );
    }
}
