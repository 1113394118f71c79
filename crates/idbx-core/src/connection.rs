//! Connection and migration manager
//!
//! Opens a versioned database from a [`DatabaseConfig`] and reconciles the declared
//! stores inside every upgrade pass the engine runs:
//!
//! - missing stores are created with their key declaration and all indices
//! - stores that survive a version change get their missing indices (by name)
//! - a forced refresh drops and recreates every non-whitelisted store
//!
//! A forced refresh needs an upgrade pass even when the requested version is already
//! stored, so the manager first opens an auxiliary connection one version above the
//! persisted one, closes it, and then opens the real connection at that version.
//! The persisted version therefore grows by one on every forced open.

use std::cell::RefCell;
use std::rc::Rc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::actions::{get_actions, ActionBinding, Actions};
use crate::bridge::promisify;
use crate::engine::{
    Database, DatabaseInfo, Engine, UpgradeDatabase, UpgradeHandler, UpgradeStore,
    VersionTransition,
};
use crate::error::{EngineResult, IdbxError, Result};
use crate::logging::prefix;
use crate::schema::{DatabaseConfig, StoreSchema, StoreSummary};

/// An open database plus what the open call observed.
#[derive(Debug, Clone)]
pub struct Connection<D> {
    pub handle: D,
    /// One entry per declared store, in declaration order.
    pub store_config: Vec<StoreSummary>,
    /// Upgrade passes this open call completed, auxiliary pass included.
    pub upgrades: Vec<VersionTransition>,
}

impl<D: Database> Connection<D> {
    /// Typed actions bound to one store of this connection.
    pub fn actions<T>(&self, store_name: &str) -> Actions<D, T>
    where
        T: Serialize + DeserializeOwned,
    {
        get_actions(ActionBinding::new(self.handle.clone(), store_name))
    }
}

/// Refresh bookkeeping for one open call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshState {
    /// An eligible pass attempted at least one deletion.
    pub performed: bool,
    /// A deletion in the latest eligible pass failed.
    pub failed: bool,
}

impl RefreshState {
    /// Whether a pass should drop non-whitelisted stores.
    pub fn is_eligible(&self, forced: bool) -> bool {
        forced && (!self.performed || self.failed)
    }
}

/// Open (and migrate) the database described by `config`.
pub async fn open_db_connection<E: Engine>(
    engine: &E,
    config: &DatabaseConfig,
) -> Result<Connection<E::Database>> {
    config.validate()?;

    let name = config.database_name.as_str();
    let shared = Rc::new(config.clone());
    let refresh = Rc::new(RefCell::new(RefreshState::default()));
    let upgrades = Rc::new(RefCell::new(Vec::new()));

    let mut version = config.version;
    if config.force_store_refresh {
        let persisted = match persisted_version(engine, name).await {
            Ok(v) => v,
            Err(e) => {
                warn!(
                    "{} could not enumerate databases, assuming '{}' is new: {}",
                    prefix::DB,
                    name,
                    e
                );
                0
            }
        };
        let auxiliary = bump(name, persisted.max(config.version))?;
        warn!(
            "{} forced refresh of '{}' raises its version {} -> {}",
            prefix::DB,
            name,
            persisted,
            auxiliary
        );

        version = match open_at(engine, &shared, auxiliary, &refresh, &upgrades).await {
            Ok(db) => {
                db.close();
                if refresh.borrow().failed {
                    warn!(
                        "{} refresh of '{}' left stores behind, retrying at version {}",
                        prefix::DB,
                        name,
                        auxiliary.saturating_add(1)
                    );
                    bump(name, auxiliary)?
                } else {
                    auxiliary
                }
            }
            Err(e) => {
                warn!(
                    "{} auxiliary open of '{}' at version {} failed: {}",
                    prefix::DB,
                    name,
                    auxiliary,
                    e
                );
                auxiliary
            }
        };
    }

    let handle = open_at(engine, &shared, version, &refresh, &upgrades)
        .await
        .map_err(|e| IdbxError::connection(name, e))?;

    info!(
        "{} opened '{}' at version {}",
        prefix::DB,
        name,
        handle.version()
    );

    let upgrades = upgrades.borrow().clone();
    Ok(Connection {
        handle,
        store_config: config.store_summary(),
        upgrades,
    })
}

fn bump(name: &str, version: u32) -> Result<u32> {
    version.checked_add(1).ok_or_else(|| {
        IdbxError::Config(format!(
            "cannot refresh '{}': version {} is already at the maximum",
            name, version
        ))
    })
}

async fn open_at<E: Engine>(
    engine: &E,
    config: &Rc<DatabaseConfig>,
    version: u32,
    refresh: &Rc<RefCell<RefreshState>>,
    upgrades: &Rc<RefCell<Vec<VersionTransition>>>,
) -> EngineResult<E::Database> {
    debug!(database = %config.database_name, version, "opening");
    let handler = upgrade_handler(config.clone(), refresh.clone(), upgrades.clone());
    let request = engine.open(&config.database_name, version, handler)?;
    promisify(request).await
}

fn upgrade_handler<U: UpgradeDatabase>(
    config: Rc<DatabaseConfig>,
    refresh: Rc<RefCell<RefreshState>>,
    upgrades: Rc<RefCell<Vec<VersionTransition>>>,
) -> UpgradeHandler<U> {
    Box::new(move |db, transition| {
        info!(
            "{} upgrading '{}' {} -> {}",
            prefix::DB,
            config.database_name,
            transition.old,
            transition.new
        );
        let mut refresh = refresh.borrow_mut();
        let before = *refresh;
        if let Err(e) = reconcile_stores(db, transition, &config, &mut refresh) {
            // The engine rolls the pass back, so its refresh bookkeeping goes too.
            *refresh = before;
            return Err(e);
        }
        upgrades.borrow_mut().push(transition);
        Ok(())
    })
}

/// Reconcile the declared stores inside one upgrade pass.
///
/// Deletion failures during a refresh are logged and recorded in `refresh`; any
/// creation failure is returned and aborts the pass.
pub fn reconcile_stores<U: UpgradeDatabase>(
    db: &U,
    transition: VersionTransition,
    config: &DatabaseConfig,
    refresh: &mut RefreshState,
) -> EngineResult<()> {
    let eligible = refresh.is_eligible(config.force_store_refresh);
    if eligible {
        refresh.failed = false;
    }

    let mut attempted = false;
    for store in &config.stores {
        let mut deleted = false;
        if eligible && !config.is_whitelisted(&store.name) && db.contains_store(&store.name) {
            attempted = true;
            match db.delete_object_store(&store.name) {
                Ok(()) => {
                    debug!(store = %store.name, "dropped for refresh");
                    deleted = true;
                }
                Err(e) => {
                    warn!(
                        "{} could not drop store '{}' for refresh: {}",
                        prefix::DB,
                        store.name,
                        e
                    );
                    refresh.failed = true;
                }
            }
        }

        if deleted || transition.old != transition.new || !db.contains_store(&store.name) {
            install_store(db, store)?;
        }
    }

    if attempted {
        refresh.performed = true;
    }
    Ok(())
}

fn install_store<U: UpgradeDatabase>(db: &U, store: &StoreSchema) -> EngineResult<()> {
    if db.contains_store(&store.name) {
        let existing = db.object_store(&store.name)?;
        let present = existing.index_names();
        for index in store.indices.iter().filter(|i| !present.contains(&i.name)) {
            debug!(store = %store.name, index = %index.name, "adding index");
            existing.create_index(index)?;
        }
        return Ok(());
    }

    debug!(store = %store.name, "creating store");
    let created = db.create_object_store(&store.name, &store.key)?;
    for index in &store.indices {
        created.create_index(index)?;
    }
    Ok(())
}

async fn persisted_version<E: Engine>(engine: &E, name: &str) -> EngineResult<u32> {
    let databases = promisify(engine.databases()?).await?;
    Ok(databases
        .into_iter()
        .find(|info| info.name == name)
        .map_or(0, |info| info.version))
}

/// Delete a database by name. Deleting a missing database succeeds.
pub async fn delete_database<E: Engine>(engine: &E, name: &str) -> Result<()> {
    info!("{} deleting '{}'", prefix::DB, name);
    Ok(promisify(engine.delete_database(name)?).await?)
}

/// Names and versions of the databases the engine knows about.
pub async fn list_databases<E: Engine>(engine: &E) -> Result<Vec<DatabaseInfo>> {
    Ok(promisify(engine.databases()?).await?)
}
