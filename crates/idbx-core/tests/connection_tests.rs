//! Open, upgrade and refresh behaviour against the in-memory engine

use std::cell::Cell;
use std::rc::Rc;

use idbx_core::engine::UpgradeHandler;
use idbx_core::memory::{MemoryRequest, MemoryUpgrade, MemoryUpgradeStore};
use idbx_core::{
    delete_database, list_databases, logging, open_db_connection, Database, DatabaseConfig,
    DatabaseInfo, Engine, EngineError, EngineErrorKind, EngineResult, IdbxError,
    IndexDescriptor, KeyDescriptor, KeyPath, MemoryDatabase, MemoryEngine, StoreSchema,
    StoreSummary, UpgradeDatabase, VersionTransition,
};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};

fn app_config(version: u32) -> DatabaseConfig {
    DatabaseConfig::new("app", version)
        .store(
            StoreSchema::new("users")
                .key_path("id")
                .index(IndexDescriptor::new("by_email", "email").unique()),
        )
        .store(StoreSchema::new("settings"))
}

#[tokio::test]
async fn test_fresh_database_has_declared_schema() {
    let engine = MemoryEngine::new();
    let connection = open_db_connection(&engine, &app_config(1)).await.unwrap();

    assert_eq!(connection.handle.object_store_names(), vec!["settings", "users"]);
    assert_eq!(connection.handle.index_names("users").unwrap(), vec!["by_email"]);
    assert_eq!(
        connection.store_config,
        vec![
            StoreSummary {
                name: "users".into(),
                key_path: Some(KeyPath::from("id")),
            },
            StoreSummary {
                name: "settings".into(),
                key_path: None,
            },
        ]
    );
    assert_eq!(connection.upgrades, vec![VersionTransition { old: 0, new: 1 }]);
}

#[tokio::test]
async fn test_reopen_same_version_keeps_records() {
    let engine = MemoryEngine::new();
    let first = open_db_connection(&engine, &app_config(1)).await.unwrap();
    first
        .actions::<Value>("users")
        .add(&json!({"id": 1, "email": "ann@example.com"}))
        .await
        .unwrap();

    let second = open_db_connection(&engine, &app_config(1)).await.unwrap();
    assert!(second.upgrades.is_empty());

    let users = second.actions::<Value>("users").get_all().await.unwrap();
    assert_eq!(users, vec![json!({"id": 1, "email": "ann@example.com"})]);
}

#[tokio::test]
async fn test_higher_version_runs_one_pass() {
    let engine = MemoryEngine::new();
    open_db_connection(&engine, &app_config(1)).await.unwrap();

    let config = app_config(3).store(StoreSchema::new("audit").auto_increment());
    let connection = open_db_connection(&engine, &config).await.unwrap();

    assert_eq!(connection.upgrades, vec![VersionTransition { old: 1, new: 3 }]);
    assert_eq!(connection.handle.version(), 3);
    assert!(connection.handle.contains_store("audit"));
}

#[tokio::test]
async fn test_version_change_installs_missing_index() {
    let engine = MemoryEngine::new();
    open_db_connection(&engine, &app_config(1)).await.unwrap();

    let config = DatabaseConfig::new("app", 2)
        .store(
            StoreSchema::new("users")
                .key_path("id")
                .index(IndexDescriptor::new("by_email", "email").unique())
                .index(IndexDescriptor::new("by_name", "name")),
        )
        .store(StoreSchema::new("settings"));
    let connection = open_db_connection(&engine, &config).await.unwrap();

    assert_eq!(
        connection.handle.index_names("users").unwrap(),
        vec!["by_email", "by_name"]
    );
}

#[tokio::test]
async fn test_stale_indices_stay_stale_without_version_bump() {
    let engine = MemoryEngine::new();
    open_db_connection(&engine, &app_config(1)).await.unwrap();

    // Same version, different index declaration: no upgrade pass, nothing changes.
    let config = DatabaseConfig::new("app", 1)
        .store(
            StoreSchema::new("users")
                .key_path("id")
                .index(IndexDescriptor::new("by_name", "name")),
        )
        .store(StoreSchema::new("settings"));
    let connection = open_db_connection(&engine, &config).await.unwrap();

    assert!(connection.upgrades.is_empty());
    assert_eq!(connection.handle.index_names("users").unwrap(), vec!["by_email"]);
}

#[tokio::test]
async fn test_force_refresh_spares_whitelisted_store() {
    let engine = MemoryEngine::new();
    let first = open_db_connection(&engine, &app_config(1)).await.unwrap();
    first
        .actions::<Value>("users")
        .add(&json!({"id": 1, "email": "ann@example.com"}))
        .await
        .unwrap();
    first
        .actions::<Value>("settings")
        .add_with_key(&json!({"theme": "dark"}), "ui")
        .await
        .unwrap();

    let config = app_config(1).force_refresh(["settings"]);
    let connection = open_db_connection(&engine, &config).await.unwrap();

    assert!(connection.handle.contains_store("users"));
    assert_eq!(connection.handle.index_names("users").unwrap(), vec!["by_email"]);
    assert!(connection
        .actions::<Value>("users")
        .get_all()
        .await
        .unwrap()
        .is_empty());
    assert_eq!(
        connection
            .actions::<Value>("settings")
            .get_by_id("ui")
            .await
            .unwrap(),
        Some(json!({"theme": "dark"}))
    );

    // The auxiliary pass raised the stored version by one; the real open reuses it.
    assert_eq!(connection.upgrades, vec![VersionTransition { old: 1, new: 2 }]);
    assert_eq!(connection.handle.version(), 2);
    assert_eq!(engine.version("app"), Some(2));
}

#[tokio::test]
async fn test_force_refresh_on_new_database() {
    let engine = MemoryEngine::new();
    let config = app_config(1).force_refresh(Vec::<String>::new());
    let connection = open_db_connection(&engine, &config).await.unwrap();

    assert_eq!(connection.upgrades, vec![VersionTransition { old: 0, new: 2 }]);
    assert_eq!(connection.handle.object_store_names(), vec!["settings", "users"]);
}

#[tokio::test]
async fn test_open_below_stored_version_fails() {
    let engine = MemoryEngine::new();
    open_db_connection(&engine, &app_config(4)).await.unwrap();

    let err = open_db_connection(&engine, &app_config(2)).await.unwrap_err();
    match err {
        IdbxError::Connection { database, source } => {
            assert_eq!(database, "app");
            assert_eq!(source.kind, EngineErrorKind::Version);
        }
        other => panic!("expected connection error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_invalid_config_rejected_before_open() {
    let engine = MemoryEngine::new();
    let err = open_db_connection(&engine, &DatabaseConfig::new("app", 0))
        .await
        .unwrap_err();

    assert!(matches!(err, IdbxError::Config(_)));
    assert_eq!(engine.version("app"), None);
}

#[tokio::test]
async fn test_failed_creation_rejects_open() {
    let engine = MemoryEngine::new();
    // A key generator cannot use an empty key path; the upgrade aborts.
    let config = DatabaseConfig::new("app", 1).store(StoreSchema::new("bad").key_path("").auto_increment());

    let err = open_db_connection(&engine, &config).await.unwrap_err();
    assert_eq!(
        err.engine_error().map(|e| e.kind),
        Some(EngineErrorKind::Abort)
    );
    assert_eq!(engine.version("app"), None);
}

#[tokio::test]
async fn test_list_and_delete_databases() {
    let engine = MemoryEngine::new();
    open_db_connection(&engine, &app_config(1)).await.unwrap();
    open_db_connection(&engine, &DatabaseConfig::new("cache", 5))
        .await
        .unwrap();

    assert_eq!(
        list_databases(&engine).await.unwrap(),
        vec![
            DatabaseInfo {
                name: "app".into(),
                version: 1
            },
            DatabaseInfo {
                name: "cache".into(),
                version: 5
            },
        ]
    );

    delete_database(&engine, "app").await.unwrap();
    delete_database(&engine, "never-existed").await.unwrap();
    assert_eq!(list_databases(&engine).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_config_from_json_opens() {
    let engine = MemoryEngine::new();
    let config = DatabaseConfig::from_json(
        r#"{
            "databaseName": "app",
            "version": 1,
            "stores": [
                { "name": "users", "id": { "keyPath": "id" },
                  "indices": [{ "name": "by_email", "keyPath": "email", "unique": true }] }
            ]
        }"#,
    )
    .unwrap();

    let connection = open_db_connection(&engine, &config).await.unwrap();
    assert_eq!(connection.handle.index_names("users").unwrap(), vec!["by_email"]);
}

/// Memory engine whose upgrade handles refuse a number of store deletions or
/// creations before behaving normally.
#[derive(Default)]
struct FlakyEngine {
    inner: MemoryEngine,
    failing_deletes: Rc<Cell<u32>>,
    failing_creates: Rc<Cell<u32>>,
}

struct FlakyUpgrade {
    inner: MemoryUpgrade,
    failing_deletes: Rc<Cell<u32>>,
    failing_creates: Rc<Cell<u32>>,
}

fn take_failure(budget: &Cell<u32>) -> bool {
    let left = budget.get();
    budget.set(left.saturating_sub(1));
    left > 0
}

impl UpgradeDatabase for FlakyUpgrade {
    type Store = MemoryUpgradeStore;

    fn object_store_names(&self) -> Vec<String> {
        self.inner.object_store_names()
    }

    fn create_object_store(&self, name: &str, key: &KeyDescriptor) -> EngineResult<MemoryUpgradeStore> {
        if take_failure(&self.failing_creates) {
            return Err(EngineError::new(EngineErrorKind::QuotaExceeded, "disk full"));
        }
        self.inner.create_object_store(name, key)
    }

    fn delete_object_store(&self, name: &str) -> EngineResult<()> {
        if take_failure(&self.failing_deletes) {
            return Err(EngineError::invalid_state("deletion refused"));
        }
        self.inner.delete_object_store(name)
    }

    fn object_store(&self, name: &str) -> EngineResult<MemoryUpgradeStore> {
        self.inner.object_store(name)
    }
}

impl Engine for FlakyEngine {
    type Database = MemoryDatabase;
    type Upgrade = FlakyUpgrade;
    type Request<T: 'static> = MemoryRequest<T>;

    fn open(
        &self,
        name: &str,
        version: u32,
        on_upgrade: UpgradeHandler<FlakyUpgrade>,
    ) -> EngineResult<MemoryRequest<MemoryDatabase>> {
        let failing_deletes = self.failing_deletes.clone();
        let failing_creates = self.failing_creates.clone();
        self.inner.open(
            name,
            version,
            Box::new(move |db: &MemoryUpgrade, transition| {
                let flaky = FlakyUpgrade {
                    inner: db.clone(),
                    failing_deletes,
                    failing_creates,
                };
                on_upgrade(&flaky, transition)
            }),
        )
    }

    fn delete_database(&self, name: &str) -> EngineResult<MemoryRequest<()>> {
        self.inner.delete_database(name)
    }

    fn databases(&self) -> EngineResult<MemoryRequest<Vec<DatabaseInfo>>> {
        self.inner.databases()
    }
}

async fn seeded(engine: &FlakyEngine) {
    let connection = open_db_connection(engine, &app_config(1)).await.unwrap();
    connection
        .actions::<Value>("users")
        .add(&json!({"id": 1, "email": "ann@example.com"}))
        .await
        .unwrap();
    connection.handle.close();
}

#[tokio::test]
async fn test_force_refresh_retries_failed_deletion() {
    logging::init_with_filter("debug");
    let engine = FlakyEngine::default();
    seeded(&engine).await;

    engine.failing_deletes.set(1);
    let config = app_config(1).force_refresh(Vec::<String>::new());
    let connection = open_db_connection(&engine, &config).await.unwrap();

    assert_eq!(
        connection.upgrades,
        vec![
            VersionTransition { old: 1, new: 2 },
            VersionTransition { old: 2, new: 3 },
        ]
    );
    assert_eq!(connection.handle.version(), 3);
    assert!(connection
        .actions::<Value>("users")
        .get_all()
        .await
        .unwrap()
        .is_empty());
    assert_eq!(connection.handle.index_names("users").unwrap(), vec!["by_email"]);
}

#[tokio::test]
async fn test_force_refresh_after_failed_auxiliary_open() {
    logging::init();
    let engine = FlakyEngine::default();
    seeded(&engine).await;

    // The auxiliary pass drops "users" and then cannot recreate it: the pass aborts
    // and the real open at the same version refreshes again.
    engine.failing_creates.set(1);
    let config = app_config(1).force_refresh(Vec::<String>::new());
    let connection = open_db_connection(&engine, &config).await.unwrap();

    assert_eq!(connection.upgrades, vec![VersionTransition { old: 1, new: 2 }]);
    assert_eq!(connection.handle.version(), 2);
    assert_eq!(connection.handle.object_store_names(), vec!["settings", "users"]);
    assert!(connection
        .actions::<Value>("users")
        .get_all()
        .await
        .unwrap()
        .is_empty());
}
