//! Declared database schema and connection configuration
//!
//! A [`DatabaseConfig`] is built once by the caller (in code or from a JSON file)
//! and passed to [`crate::open_db_connection`]. Field names serialize in camelCase
//! so configs can be shared with JavaScript callers:
//!
//! ```json
//! {
//!   "databaseName": "app",
//!   "version": 1,
//!   "stores": [
//!     { "name": "users", "id": { "keyPath": "id" }, "indices": [] }
//!   ]
//! }
//! ```

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{IdbxError, Result};
use crate::key::KeyPath;

/// Primary key declaration of a store. Fixed once the store exists.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyDescriptor {
    /// In-line key path; `None` means keys are supplied out of line.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_path: Option<KeyPath>,
    #[serde(default)]
    pub auto_increment: bool,
}

impl KeyDescriptor {
    pub fn key_path(path: impl Into<KeyPath>) -> Self {
        Self {
            key_path: Some(path.into()),
            auto_increment: false,
        }
    }

    pub fn auto_increment(mut self) -> Self {
        self.auto_increment = true;
        self
    }
}

/// Secondary index declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexDescriptor {
    pub name: String,
    pub key_path: KeyPath,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub multi_entry: bool,
}

impl IndexDescriptor {
    pub fn new(name: impl Into<String>, key_path: impl Into<KeyPath>) -> Self {
        Self {
            name: name.into(),
            key_path: key_path.into(),
            unique: false,
            multi_entry: false,
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn multi_entry(mut self) -> Self {
        self.multi_entry = true;
        self
    }
}

/// A named store with its key declaration and indices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreSchema {
    pub name: String,
    #[serde(rename = "id", default)]
    pub key: KeyDescriptor,
    #[serde(default)]
    pub indices: Vec<IndexDescriptor>,
}

impl StoreSchema {
    /// Store with out-of-line keys and no indices.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key: KeyDescriptor::default(),
            indices: Vec::new(),
        }
    }

    pub fn key_path(mut self, path: impl Into<KeyPath>) -> Self {
        self.key.key_path = Some(path.into());
        self
    }

    pub fn auto_increment(mut self) -> Self {
        self.key.auto_increment = true;
        self
    }

    pub fn index(mut self, index: IndexDescriptor) -> Self {
        self.indices.push(index);
        self
    }
}

/// Everything needed to open (and migrate) one logical database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseConfig {
    pub database_name: String,
    pub version: u32,
    pub stores: Vec<StoreSchema>,
    /// Drop and recreate every non-whitelisted store on this open.
    #[serde(default)]
    pub force_store_refresh: bool,
    /// Stores that a forced refresh must leave untouched.
    #[serde(default)]
    pub store_refresh_whitelist: Vec<String>,
}

impl DatabaseConfig {
    pub fn new(database_name: impl Into<String>, version: u32) -> Self {
        Self {
            database_name: database_name.into(),
            version,
            stores: Vec::new(),
            force_store_refresh: false,
            store_refresh_whitelist: Vec::new(),
        }
    }

    pub fn store(mut self, store: StoreSchema) -> Self {
        self.stores.push(store);
        self
    }

    /// Request a forced refresh, sparing the listed stores.
    pub fn force_refresh<I, S>(mut self, whitelist: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.force_store_refresh = true;
        self.store_refresh_whitelist = whitelist.into_iter().map(Into::into).collect();
        self
    }

    /// Parse and validate a JSON config.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: DatabaseConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON config file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| IdbxError::Config(format!("reading {}: {}", path.display(), e)))?;
        Self::from_json(&json)
    }

    /// Check the config before it reaches an engine.
    pub fn validate(&self) -> Result<()> {
        if self.database_name.is_empty() {
            return Err(IdbxError::Config("databaseName must not be empty".into()));
        }
        if self.version < 1 {
            return Err(IdbxError::Config(format!(
                "version must be at least 1, got {}",
                self.version
            )));
        }

        let mut names = HashSet::new();
        for store in &self.stores {
            if store.name.is_empty() {
                return Err(IdbxError::Config("store name must not be empty".into()));
            }
            if !names.insert(store.name.as_str()) {
                return Err(IdbxError::Config(format!(
                    "store '{}' is declared more than once",
                    store.name
                )));
            }

            let mut index_names = HashSet::new();
            for index in &store.indices {
                if !index_names.insert(index.name.as_str()) {
                    return Err(IdbxError::Config(format!(
                        "index '{}' is declared more than once on store '{}'",
                        index.name, store.name
                    )));
                }
                if index.multi_entry && matches!(index.key_path, KeyPath::Compound(_)) {
                    return Err(IdbxError::Config(format!(
                        "multiEntry index '{}' on store '{}' cannot use a compound key path",
                        index.name, store.name
                    )));
                }
            }

            if store.key.auto_increment
                && matches!(store.key.key_path, Some(KeyPath::Compound(_)))
            {
                return Err(IdbxError::Config(format!(
                    "store '{}' cannot combine autoIncrement with a compound key path",
                    store.name
                )));
            }
        }

        for name in &self.store_refresh_whitelist {
            if !names.contains(name.as_str()) {
                warn!(
                    database = %self.database_name,
                    store = %name,
                    "refresh whitelist names an undeclared store"
                );
            }
        }

        Ok(())
    }

    pub fn is_whitelisted(&self, store_name: &str) -> bool {
        self.store_refresh_whitelist.iter().any(|s| s == store_name)
    }

    /// Read-only summary of the declared stores and their key paths.
    pub fn store_summary(&self) -> Vec<StoreSummary> {
        self.stores
            .iter()
            .map(|store| StoreSummary {
                name: store.name.clone(),
                key_path: store.key.key_path.clone(),
            })
            .collect()
    }
}

/// One entry of the store summary returned alongside a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreSummary {
    pub name: String,
    pub key_path: Option<KeyPath>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_from_json_camel_case() {
        let config = DatabaseConfig::from_json(
            r#"{
                "databaseName": "app",
                "version": 2,
                "stores": [
                    {
                        "name": "users",
                        "id": { "keyPath": "id", "autoIncrement": true },
                        "indices": [
                            { "name": "by_email", "keyPath": "email", "unique": true },
                            { "name": "by_tag", "keyPath": "tags", "multiEntry": true }
                        ]
                    },
                    { "name": "pairs", "id": { "keyPath": ["a", "b"] } }
                ],
                "forceStoreRefresh": true,
                "storeRefreshWhitelist": ["pairs"]
            }"#,
        )
        .unwrap();

        let expected = DatabaseConfig::new("app", 2)
            .store(
                StoreSchema::new("users")
                    .key_path("id")
                    .auto_increment()
                    .index(IndexDescriptor::new("by_email", "email").unique())
                    .index(IndexDescriptor::new("by_tag", "tags").multi_entry()),
            )
            .store(StoreSchema::new("pairs").key_path(vec!["a", "b"]))
            .force_refresh(["pairs"]);

        assert_eq!(config, expected);
        assert!(config.is_whitelisted("pairs"));
        assert!(!config.is_whitelisted("users"));
    }

    #[test]
    fn test_store_summary() {
        let config = DatabaseConfig::new("app", 1)
            .store(StoreSchema::new("users").key_path("id"))
            .store(StoreSchema::new("blobs"));

        assert_eq!(
            config.store_summary(),
            vec![
                StoreSummary {
                    name: "users".into(),
                    key_path: Some(KeyPath::from("id")),
                },
                StoreSummary {
                    name: "blobs".into(),
                    key_path: None,
                },
            ]
        );
    }

    #[test]
    fn test_validate_rejects_bad_configs() {
        let zero = DatabaseConfig::new("app", 0);
        assert!(matches!(zero.validate(), Err(IdbxError::Config(_))));

        let duplicate = DatabaseConfig::new("app", 1)
            .store(StoreSchema::new("users"))
            .store(StoreSchema::new("users"));
        assert!(matches!(duplicate.validate(), Err(IdbxError::Config(_))));

        let duplicate_index = DatabaseConfig::new("app", 1).store(
            StoreSchema::new("users")
                .index(IndexDescriptor::new("a", "a"))
                .index(IndexDescriptor::new("a", "b")),
        );
        assert!(matches!(duplicate_index.validate(), Err(IdbxError::Config(_))));

        let compound_generator = DatabaseConfig::new("app", 1)
            .store(StoreSchema::new("pairs").key_path(vec!["a", "b"]).auto_increment());
        assert!(matches!(
            compound_generator.validate(),
            Err(IdbxError::Config(_))
        ));
    }

    #[test]
    fn test_from_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.json");
        std::fs::write(
            &path,
            r#"{"databaseName":"app","version":1,"stores":[{"name":"users","id":{"keyPath":"id"},"indices":[]}]}"#,
        )
        .unwrap();

        let config = DatabaseConfig::from_path(&path).unwrap();
        assert_eq!(config.stores[0].name, "users");
        assert!(!config.force_store_refresh);

        let missing = DatabaseConfig::from_path(dir.path().join("nope.json"));
        assert!(matches!(missing, Err(IdbxError::Config(_))));
    }
}
