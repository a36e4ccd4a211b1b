//! The data manager: one entry point for loading and saving entities.
//!
//! A [`DataManager`] wires a [`CommitCoordinator`], a shared
//! [`QueryResultCache`] and a [`DataLoader`] together so that committed
//! changes invalidate cached query results.
//!
//! # Example
//!
//! ```ignore
//! use entsync::prelude::*;
//!
//! let manager = DataManager::builder()
//!     .with_config(PersistenceConfig::new().with_max_batch_size(500))
//!     .with_store(StoreConfig::new(MAIN_STORE), Arc::new(database))
//!     .build_with(metadata)?;
//!
//! let customer = manager.transaction(|tx| {
//!     let customer = manager.create("Customer")?;
//!     customer.set("name", "Ada")?;
//!     manager.save(tx, SaveRequest::new().save(&customer))?;
//!     Ok(customer)
//! })?;
//! ```

use crate::config::PersistenceConfig;
use entsync_core::{Entity, EntityRef, Error, MetadataRegistry, Result, Value};
use entsync_query::{
    AccessConstraint, DataLoader, LoadSpec, QueryParser, QueryResultCache, QueryTransformer,
};
use entsync_session::{
    CommitCoordinator, EntityChangedListener, EntityListener, FlushSummary, PreCommitListener,
    SaveRequest, SessionFactory, StoreConfig, TransactionContext, TransactionOptions, TypeInvalidation,
};
use std::sync::Arc;

/// Loads and saves entities across transactions.
///
/// Cheap to share behind an `Arc`; all per-transaction state lives in the
/// [`TransactionContext`] passed to each call.
#[derive(Debug)]
pub struct DataManager {
    config: PersistenceConfig,
    loader: DataLoader,
}

impl DataManager {
    /// Create a data manager builder.
    #[must_use]
    pub fn builder() -> DataManagerBuilder {
        DataManagerBuilder::new()
    }

    pub fn config(&self) -> &PersistenceConfig {
        &self.config
    }

    pub fn metadata(&self) -> &Arc<MetadataRegistry> {
        self.coordinator().metadata()
    }

    pub fn coordinator(&self) -> &Arc<CommitCoordinator> {
        self.loader.coordinator()
    }

    pub fn loader(&self) -> &DataLoader {
        &self.loader
    }

    pub fn cache(&self) -> &Arc<QueryResultCache> {
        self.loader.cache()
    }

    /// New, unmanaged instance of a registered entity type.
    pub fn create(&self, entity: &str) -> Result<EntityRef> {
        Ok(Entity::new(self.metadata().require(entity)?))
    }

    // ========================================================================
    // Transactions
    // ========================================================================

    pub fn begin(&self) -> TransactionContext {
        self.begin_with(TransactionOptions::new())
    }

    pub fn begin_with(&self, options: TransactionOptions) -> TransactionContext {
        self.coordinator().begin(options)
    }

    pub fn commit(&self, tx: &mut TransactionContext) -> Result<()> {
        self.coordinator().commit(tx)
    }

    pub fn rollback(&self, tx: &mut TransactionContext) {
        self.coordinator().rollback(tx);
    }

    /// Run `f` in a new transaction.
    ///
    /// Commits when `f` returns `Ok` and rolls back when it returns `Err`.
    pub fn transaction<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut TransactionContext) -> Result<T>,
    {
        self.transaction_with(TransactionOptions::new(), f)
    }

    pub fn transaction_with<F, T>(&self, options: TransactionOptions, f: F) -> Result<T>
    where
        F: FnOnce(&mut TransactionContext) -> Result<T>,
    {
        let mut tx = self.begin_with(options);
        match f(&mut tx) {
            Ok(value) => {
                self.commit(&mut tx)?;
                Ok(value)
            }
            Err(err) => {
                if tx.is_active() {
                    tracing::warn!(transaction = tx.id(), error = %err, "Rolling back transaction");
                    self.rollback(&mut tx);
                }
                Err(err)
            }
        }
    }

    // ========================================================================
    // Writes
    // ========================================================================

    pub fn save(&self, tx: &mut TransactionContext, request: SaveRequest) -> Result<()> {
        self.coordinator().save(tx, request)
    }

    pub fn persist(&self, tx: &mut TransactionContext, entity: &EntityRef) -> Result<()> {
        self.save(tx, SaveRequest::new().save(entity))
    }

    pub fn remove(&self, tx: &mut TransactionContext, entity: &EntityRef) -> Result<()> {
        self.save(tx, SaveRequest::new().remove(entity))
    }

    /// Write pending changes without committing.
    pub fn flush(&self, tx: &mut TransactionContext) -> Result<FlushSummary> {
        self.coordinator().flush(tx)
    }

    // ========================================================================
    // Reads
    // ========================================================================

    pub fn load(&self, tx: &mut TransactionContext, spec: &LoadSpec) -> Result<Option<EntityRef>> {
        self.loader.load(tx, spec)
    }

    pub fn load_all(&self, tx: &mut TransactionContext, spec: &LoadSpec) -> Result<Vec<EntityRef>> {
        self.loader.load_all(tx, spec)
    }

    pub fn count(&self, tx: &mut TransactionContext, spec: &LoadSpec) -> Result<u64> {
        self.loader.count(tx, spec)
    }

    pub fn execute_update(&self, tx: &mut TransactionContext, spec: &LoadSpec) -> Result<u64> {
        self.loader.execute_update(tx, spec)
    }

    pub fn load_values(
        &self,
        tx: &mut TransactionContext,
        spec: &LoadSpec,
    ) -> Result<Vec<Vec<Value>>> {
        self.loader.load_values(tx, spec)
    }
}

/// Builder for [`DataManager`] instances.
///
/// Stores, listeners and query extensions registered here are installed
/// before the manager is handed out.
#[derive(Default)]
pub struct DataManagerBuilder {
    config: PersistenceConfig,
    stores: Vec<(StoreConfig, Arc<dyn SessionFactory>)>,
    entity_listeners: Vec<(Option<String>, i32, Arc<dyn EntityListener>)>,
    pre_commit_listeners: Vec<(Option<String>, i32, Arc<dyn PreCommitListener>)>,
    changed_listeners: Vec<(Option<String>, i32, Arc<dyn EntityChangedListener>)>,
    transformers: Vec<Arc<dyn QueryTransformer>>,
    constraints: Vec<Arc<dyn AccessConstraint>>,
    parser: Option<Arc<dyn QueryParser>>,
}

impl DataManagerBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_config(mut self, config: PersistenceConfig) -> Self {
        self.config = config;
        self
    }

    /// Serve `store` with sessions from `factory`.
    #[must_use]
    pub fn with_store(mut self, store: StoreConfig, factory: Arc<dyn SessionFactory>) -> Self {
        self.stores.push((store, factory));
        self
    }

    /// Register a lifecycle listener for `entity`, or for every type when `None`.
    #[must_use]
    pub fn with_entity_listener(
        mut self,
        entity: Option<&str>,
        priority: i32,
        listener: Arc<dyn EntityListener>,
    ) -> Self {
        self.entity_listeners
            .push((entity.map(str::to_string), priority, listener));
        self
    }

    #[must_use]
    pub fn with_pre_commit_listener(
        mut self,
        entity: Option<&str>,
        priority: i32,
        listener: Arc<dyn PreCommitListener>,
    ) -> Self {
        self.pre_commit_listeners
            .push((entity.map(str::to_string), priority, listener));
        self
    }

    #[must_use]
    pub fn with_changed_listener(
        mut self,
        entity: Option<&str>,
        priority: i32,
        listener: Arc<dyn EntityChangedListener>,
    ) -> Self {
        self.changed_listeners
            .push((entity.map(str::to_string), priority, listener));
        self
    }

    #[must_use]
    pub fn with_transformer(mut self, transformer: Arc<dyn QueryTransformer>) -> Self {
        self.transformers.push(transformer);
        self
    }

    #[must_use]
    pub fn with_constraint(mut self, constraint: Arc<dyn AccessConstraint>) -> Self {
        self.constraints.push(constraint);
        self
    }

    /// Replace the default regex query parser.
    #[must_use]
    pub fn with_parser(mut self, parser: Arc<dyn QueryParser>) -> Self {
        self.parser = Some(parser);
        self
    }

    /// Build the manager over `metadata`.
    ///
    /// Fails when the configuration or the metadata is invalid, or when no
    /// store was registered.
    #[tracing::instrument(level = "debug", skip_all, fields(stores = self.stores.len()))]
    pub fn build_with(self, metadata: Arc<MetadataRegistry>) -> Result<DataManager> {
        self.config.validate()?;
        if self.stores.is_empty() {
            return Err(Error::Config("no store registered".to_string()));
        }
        metadata.validate()?;

        let coordinator = Arc::new(CommitCoordinator::new(
            metadata,
            self.config.coordinator_config(),
        )?);
        for (store, factory) in self.stores {
            coordinator.add_store(store, factory);
        }
        for (entity, priority, listener) in self.entity_listeners {
            coordinator.add_entity_listener(entity.as_deref(), priority, listener);
        }
        for (entity, priority, listener) in self.pre_commit_listeners {
            coordinator.add_pre_commit_listener(entity.as_deref(), priority, listener);
        }
        for (entity, priority, listener) in self.changed_listeners {
            coordinator.add_changed_listener(entity.as_deref(), priority, listener);
        }

        let cache = Arc::new(QueryResultCache::new(self.config.cache_capacity));
        coordinator.add_invalidation(Arc::clone(&cache) as Arc<dyn TypeInvalidation>);

        let mut loader = DataLoader::new(coordinator, cache, self.config.loader_config())?;
        if let Some(parser) = self.parser {
            loader = loader.with_parser(parser);
        }
        for transformer in self.transformers {
            loader.add_transformer(transformer);
        }
        for constraint in self.constraints {
            loader.add_constraint(constraint);
        }

        tracing::debug!(
            cache_enabled = self.config.cache_enabled,
            max_batch_size = self.config.max_batch_size,
            "Built data manager"
        );
        Ok(DataManager {
            config: self.config,
            loader,
        })
    }
}

impl std::fmt::Debug for DataManagerBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataManagerBuilder")
            .field("config", &self.config)
            .field("stores", &self.stores.len())
            .field(
                "listeners",
                &(self.entity_listeners.len()
                    + self.pre_commit_listeners.len()
                    + self.changed_listeners.len()),
            )
            .field("transformers", &self.transformers.len())
            .field("constraints", &self.constraints.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use entsync_core::{AttributeDescriptor, EntityDescriptor, MAIN_STORE};
    use entsync_session::MemoryDatabase;

    fn metadata() -> Arc<MetadataRegistry> {
        let mut reg = MetadataRegistry::new();
        reg.register(EntityDescriptor::new("Tag").attribute(AttributeDescriptor::scalar("label")));
        Arc::new(reg)
    }

    #[test]
    fn test_build_requires_a_store() {
        let err = DataManager::builder().build_with(metadata()).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let metadata = metadata();
        let db = MemoryDatabase::new(Arc::clone(&metadata));
        let err = DataManager::builder()
            .with_config(PersistenceConfig::new().with_max_flush_iterations(0))
            .with_store(StoreConfig::new(MAIN_STORE), Arc::new(db))
            .build_with(metadata)
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_build_rejects_entity_without_primary_key() {
        let mut reg = MetadataRegistry::new();
        reg.register(EntityDescriptor::new("Tag").primary_key(Vec::<String>::new()));
        let metadata = Arc::new(reg);
        let db = MemoryDatabase::new(Arc::clone(&metadata));
        let err = DataManager::builder()
            .with_store(StoreConfig::new(MAIN_STORE), Arc::new(db))
            .build_with(metadata)
            .unwrap_err();
        assert!(matches!(err, Error::Metadata(_)));
    }

    #[test]
    fn test_transaction_commits_on_ok() {
        let metadata = metadata();
        let db = MemoryDatabase::new(Arc::clone(&metadata));
        let manager = DataManager::builder()
            .with_store(StoreConfig::new(MAIN_STORE), Arc::new(db.clone()))
            .build_with(metadata)
            .unwrap();

        let tag = manager
            .transaction(|tx| {
                let tag = manager.create("Tag")?;
                tag.set("label", "red")?;
                manager.persist(tx, &tag)?;
                Ok(tag)
            })
            .unwrap();

        assert!(tag.is_detached());
        assert_eq!(db.row_count("Tag"), 1);
    }

    #[test]
    fn test_transaction_rolls_back_on_err() {
        let metadata = metadata();
        let db = MemoryDatabase::new(Arc::clone(&metadata));
        let manager = DataManager::builder()
            .with_store(StoreConfig::new(MAIN_STORE), Arc::new(db.clone()))
            .build_with(metadata)
            .unwrap();

        let result: Result<()> = manager.transaction(|tx| {
            let tag = manager.create("Tag")?;
            manager.persist(tx, &tag)?;
            manager.flush(tx)?;
            Err(Error::Custom("abort".to_string()))
        });

        assert!(matches!(result, Err(Error::Custom(_))));
        assert_eq!(db.row_count("Tag"), 0);
    }

    #[test]
    fn test_create_unknown_type() {
        let metadata = metadata();
        let db = MemoryDatabase::new(Arc::clone(&metadata));
        let manager = DataManager::builder()
            .with_store(StoreConfig::new(MAIN_STORE), Arc::new(db))
            .build_with(metadata)
            .unwrap();
        assert!(matches!(manager.create("Ghost"), Err(Error::Metadata(_))));
    }
}
