//! Executes [`LoadSpec`]s inside a transaction.
//!
//! Every load follows the same path:
//!
//! 1. under AUTO flush mode, pending changes are flushed first so the query
//!    sees them (the resulting events wait for the commit);
//! 2. the spec becomes a [`SessionQuery`]: soft-deletion filter, access
//!    constraints and query transformers are applied, or skipped for native
//!    queries;
//! 3. identifier loads go out in batches of `max_batch_size`, composite keys
//!    one at a time;
//! 4. cacheable queries consult the shared [`QueryResultCache`];
//! 5. loaded instances join the transaction and are completed to the plan.

use crate::cache::{CacheKeyParts, CachedResult, QueryResultCache};
use crate::constraints::{AccessConstraint, QueryContext};
use crate::load_spec::{LoadSpec, append_condition, render_criterion};
use crate::transform::{QueryParser, QueryTransformer, RegexQueryParser};
use entsync_core::{
    EntityDescriptor, EntityKey, EntityRef, Error, FetchPlan, MetadataRegistry, PersistenceError,
    PersistenceErrorKind, Result, Value,
};
use entsync_session::{
    CommitCoordinator, Criterion, FlushMode, OrmSession, SessionQuery, TransactionContext,
    TransactionStatus, TransactionSynchronization, is_soft_deleted,
};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

/// Default upper bound on identifiers per batched query.
pub const DEFAULT_MAX_BATCH_SIZE: usize = 1000;

/// Loader settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoaderConfig {
    /// Global switch for the query result cache.
    pub cache_enabled: bool,
    pub max_batch_size: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            cache_enabled: true,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
        }
    }
}

impl LoaderConfig {
    #[must_use]
    pub fn with_cache_enabled(mut self, enabled: bool) -> Self {
        self.cache_enabled = enabled;
        self
    }

    #[must_use]
    pub fn with_max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size.max(1);
        self
    }
}

/// A spec turned into a session query.
struct PreparedQuery {
    query: SessionQuery,
    security: BTreeMap<String, Value>,
    /// Entity types the result depends on.
    types: BTreeSet<String>,
}

/// What one load works with.
struct LoadScope<'a> {
    spec: &'a LoadSpec,
    descriptor: Arc<EntityDescriptor>,
    session: Arc<dyn OrmSession>,
    plan: Option<FetchPlan>,
    soft_deletion: bool,
}

/// Loads entities and values for a [`CommitCoordinator`].
pub struct DataLoader {
    coordinator: Arc<CommitCoordinator>,
    cache: Arc<QueryResultCache>,
    config: LoaderConfig,
    parser: Arc<dyn QueryParser>,
    transformers: RwLock<Vec<Arc<dyn QueryTransformer>>>,
    constraints: RwLock<Vec<Arc<dyn AccessConstraint>>>,
}

impl DataLoader {
    pub fn new(
        coordinator: Arc<CommitCoordinator>,
        cache: Arc<QueryResultCache>,
        config: LoaderConfig,
    ) -> Result<Self> {
        Ok(Self {
            coordinator,
            cache,
            config,
            parser: Arc::new(RegexQueryParser::new()?),
            transformers: RwLock::new(Vec::new()),
            constraints: RwLock::new(Vec::new()),
        })
    }

    #[must_use]
    pub fn with_parser(mut self, parser: Arc<dyn QueryParser>) -> Self {
        self.parser = parser;
        self
    }

    /// Transformers run in registration order.
    pub fn add_transformer(&self, transformer: Arc<dyn QueryTransformer>) {
        self.transformers.write().push(transformer);
    }

    pub fn add_constraint(&self, constraint: Arc<dyn AccessConstraint>) {
        self.constraints.write().push(constraint);
    }

    pub fn coordinator(&self) -> &Arc<CommitCoordinator> {
        &self.coordinator
    }

    pub fn cache(&self) -> &Arc<QueryResultCache> {
        &self.cache
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    // ========================================================================
    // Operations
    // ========================================================================

    /// Load at most one instance.
    ///
    /// Fails with [`Error::NonUniqueResult`] when the spec matches several.
    #[tracing::instrument(level = "debug", skip_all, fields(transaction = tx.id(), entity = %spec.entity))]
    pub fn load(&self, tx: &mut TransactionContext, spec: &LoadSpec) -> Result<Option<EntityRef>> {
        let scope = self.scope(tx, spec)?;
        let mut found = match &spec.ids {
            Some(ids) => self.load_by_ids(tx, &scope, ids.clone().into_keys())?,
            None => self.load_by_query(tx, &scope, true)?,
        };
        if found.len() > 1 {
            return Err(Error::NonUniqueResult {
                entity: spec.entity.clone(),
                count: found.len(),
            });
        }
        Ok(found.pop())
    }

    #[tracing::instrument(level = "debug", skip_all, fields(transaction = tx.id(), entity = %spec.entity))]
    pub fn load_all(&self, tx: &mut TransactionContext, spec: &LoadSpec) -> Result<Vec<EntityRef>> {
        let scope = self.scope(tx, spec)?;
        match &spec.ids {
            Some(ids) => self.load_by_ids(tx, &scope, ids.clone().into_keys()),
            None => self.load_by_query(tx, &scope, false),
        }
    }

    #[tracing::instrument(level = "debug", skip_all, fields(transaction = tx.id(), entity = %spec.entity))]
    pub fn count(&self, tx: &mut TransactionContext, spec: &LoadSpec) -> Result<u64> {
        let scope = self.scope(tx, spec)?;
        let prepared = self.prepare(&scope)?;
        let count = scope
            .session
            .count(&prepared.query)
            .map_err(|e| self.coordinator.map_session_error(e))?;
        tracing::debug!(count, "Counted");
        Ok(count)
    }

    /// Run a bulk update or delete. Bypasses change tracking: no events are
    /// published, and cached results for the entity are dropped now and again
    /// when the transaction completes.
    #[tracing::instrument(level = "debug", skip_all, fields(transaction = tx.id(), entity = %spec.entity))]
    pub fn execute_update(&self, tx: &mut TransactionContext, spec: &LoadSpec) -> Result<u64> {
        if spec.update.is_none() {
            return Err(PersistenceError::new(
                PersistenceErrorKind::Query,
                format!("load spec for {} carries no update action", spec.entity),
            )
            .into());
        }
        if tx.is_read_only() {
            return Err(Error::ReadOnlyViolation {
                entity: spec.entity.clone(),
            });
        }
        let scope = self.scope(tx, spec)?;
        let prepared = self.prepare(&scope)?;
        let affected = scope
            .session
            .execute_update(&prepared.query)
            .map_err(|e| self.coordinator.map_session_error(e))?;
        tx.mark_uncommitted_writes();

        self.cache.invalidate(&prepared.types);
        tx.register_synchronization(Arc::new(InvalidateOnCompletion {
            cache: Arc::clone(&self.cache),
            types: prepared.types,
        }))?;
        tracing::debug!(affected, "Bulk update executed");
        Ok(affected)
    }

    /// Load the spec's `properties` as value rows.
    #[tracing::instrument(level = "debug", skip_all, fields(transaction = tx.id(), entity = %spec.entity))]
    pub fn load_values(&self, tx: &mut TransactionContext, spec: &LoadSpec) -> Result<Vec<Vec<Value>>> {
        if spec.properties.is_empty() {
            return Err(Error::metadata(&spec.entity, None, "value load without properties"));
        }
        let scope = self.scope(tx, spec)?;
        for property in &spec.properties {
            scope.descriptor.require_attribute(property)?;
        }
        let prepared = self.prepare(&scope)?;
        let rows = scope
            .session
            .project(&prepared.query)
            .map_err(|e| self.coordinator.map_session_error(e))?;
        tracing::debug!(count = rows.len(), "Loaded values");
        Ok(rows)
    }

    // ========================================================================
    // Preparation
    // ========================================================================

    fn scope<'a>(&self, tx: &mut TransactionContext, spec: &'a LoadSpec) -> Result<LoadScope<'a>> {
        tx.ensure_active()?;
        let descriptor = self.coordinator.metadata().require(&spec.entity)?;
        if descriptor.embeddable {
            return Err(Error::metadata(
                &spec.entity,
                None,
                "embeddable types cannot be loaded on their own",
            ));
        }
        self.flush_if_needed(tx)?;
        let session = self.coordinator.session(tx, &descriptor.store)?;
        let soft_deletion = descriptor.is_soft_deletable()
            && spec
                .hints
                .soft_deletion
                .unwrap_or(self.coordinator.config().soft_deletion);
        Ok(LoadScope {
            spec,
            descriptor,
            session,
            plan: spec.merged_plan(),
            soft_deletion,
        })
    }

    /// Implicit flush: queries must see the transaction's own changes.
    fn flush_if_needed(&self, tx: &mut TransactionContext) -> Result<()> {
        if tx.flush_mode() != FlushMode::Auto || tx.is_flushing() {
            return Ok(());
        }
        if !self.coordinator.has_pending_changes(tx)? {
            return Ok(());
        }
        tracing::debug!(transaction = tx.id(), "Flushing before query");
        self.coordinator.flush(tx)?;
        Ok(())
    }

    fn soft_deletion_filter(scope: &LoadScope<'_>) -> Option<Criterion> {
        if !scope.soft_deletion {
            return None;
        }
        scope
            .descriptor
            .soft_delete
            .as_ref()
            .map(|info| Criterion::IsNull(info.deleted_at.clone()))
    }

    fn prepare(&self, scope: &LoadScope<'_>) -> Result<PreparedQuery> {
        let spec = scope.spec;
        let mut security = BTreeMap::new();
        let (text, parameters, filter) = match &spec.query {
            Some(query) if query.native => {
                (query.text.clone(), query.parameters.clone(), spec.condition.clone())
            }
            _ => {
                let mut extra: Vec<Criterion> = Self::soft_deletion_filter(scope).into_iter().collect();
                let mut context = QueryContext::new(&spec.entity);
                for constraint in self.constraints.read().iter() {
                    constraint.apply(&mut context)?;
                }
                extra.extend(context.criteria().iter().cloned());
                security.clone_from(context.security_parameters());
                self.render(scope, extra)?
            }
        };

        let mut query = SessionQuery::new(&spec.entity)
            .with_text(text)
            .with_page(spec.first, spec.max)
            .with_projection(spec.properties.iter().cloned());
        query.parameters = parameters;
        query.sort.clone_from(&spec.sort);
        query.filter = filter;
        query.lock_mode = spec.hints.lock_mode;
        query.plan.clone_from(&scope.plan);
        query.update.clone_from(&spec.update);
        if let Some(ids) = &spec.ids {
            query = restrict_to_keys(query, &scope.descriptor, ids.clone().into_keys())?;
        }

        let mut types = self.parser.entity_names(&query.text);
        types.insert(spec.entity.clone());
        if let Some(plan) = &scope.plan {
            plan_types(self.coordinator.metadata(), plan, &mut types);
        }
        Ok(PreparedQuery {
            query,
            security,
            types,
        })
    }

    /// Query text, parameters and structured filter for a non-native spec.
    fn render(
        &self,
        scope: &LoadScope<'_>,
        extra: Vec<Criterion>,
    ) -> Result<(String, Vec<(String, Value)>, Option<Criterion>)> {
        let spec = scope.spec;
        let extra = conjoin(extra);
        match &spec.query {
            Some(query) => {
                let mut text = query.text.clone();
                for transformer in self.transformers.read().iter() {
                    text = transformer.transform(&text)?;
                }
                let mut parameters = query.parameters.clone();
                let base = spec.condition.clone().or_else(|| {
                    self.parser.where_clause(&text).map(Criterion::Raw)
                });
                if let Some(extra) = &extra {
                    let rendered = render_criterion(extra, &mut parameters);
                    text = append_condition(&text, &rendered);
                }
                let filter = match (base, extra) {
                    (Some(base), Some(extra)) => Some(base.and(extra)),
                    (base, extra) => base.or(extra),
                };
                Ok((text, parameters, filter))
            }
            None => {
                let filter = match (spec.condition.clone(), extra) {
                    (Some(base), Some(extra)) => Some(base.and(extra)),
                    (base, extra) => base.or(extra),
                };
                let rendered = spec.build(filter.as_ref());
                let mut text = rendered.text;
                for transformer in self.transformers.read().iter() {
                    text = transformer.transform(&text)?;
                }
                Ok((text, rendered.parameters, filter))
            }
        }
    }

    // ========================================================================
    // Execution
    // ========================================================================

    fn load_by_ids(
        &self,
        tx: &mut TransactionContext,
        scope: &LoadScope<'_>,
        keys: Vec<Vec<Value>>,
    ) -> Result<Vec<EntityRef>> {
        let entity = &scope.descriptor.name;
        let width = scope.descriptor.primary_key.len();
        if width == 0 {
            return Err(Error::metadata(entity, None, "entity has no primary key"));
        }
        let mut seen = HashSet::new();
        let mut unique = Vec::with_capacity(keys.len());
        for key in keys {
            if key.len() != width {
                return Err(Error::metadata(
                    entity,
                    None,
                    format!("expected {width} key value(s), got {}", key.len()),
                ));
            }
            if seen.insert(EntityKey::new(entity.clone(), key.clone())) {
                unique.push(key);
            }
        }

        let id_filter = conjoin(
            scope
                .spec
                .condition
                .iter()
                .cloned()
                .chain(Self::soft_deletion_filter(scope))
                .collect(),
        );
        let mut found: HashMap<EntityKey, EntityRef> = HashMap::new();
        if scope.descriptor.has_composite_key() {
            tracing::debug!(count = unique.len(), "Loading composite keys one by one");
            for key in &unique {
                let loaded = scope
                    .session
                    .find(entity, key, scope.plan.as_ref())
                    .map_err(|e| self.coordinator.map_session_error(e))?;
                let Some(instance) = loaded else {
                    continue;
                };
                if scope.soft_deletion && is_soft_deleted(&instance) {
                    continue;
                }
                let matches = scope.spec.condition.as_ref().is_none_or(|c| {
                    c.evaluate(&|attr: &str| instance.get(attr).unwrap_or(Value::Null))
                        .unwrap_or(true)
                });
                if matches {
                    found.insert(instance.key(), instance);
                }
            }
        } else {
            let batch_size = self.config.max_batch_size.max(1);
            let pk = &scope.descriptor.primary_key[0];
            for chunk in unique.chunks(batch_size) {
                let ids: Vec<Value> = chunk.iter().map(|k| k[0].clone()).collect();
                tracing::trace!(batch = ids.len(), "Loading identifier batch");
                let mut text = format!("select e from {entity} e where e.{pk} in :ids");
                let mut query = SessionQuery::new(entity.clone()).with_ids(ids.clone());
                if let Some(filter) = id_filter.clone() {
                    let mut params = Vec::new();
                    text = append_condition(&text, &render_criterion(&filter, &mut params));
                    query.parameters = params;
                    query.filter = Some(filter);
                }
                query.text = text;
                query.parameters.push(("ids".to_string(), Value::Array(ids)));
                query.lock_mode = scope.spec.hints.lock_mode;
                query.plan.clone_from(&scope.plan);
                let batch = scope
                    .session
                    .query(&query)
                    .map_err(|e| self.coordinator.map_session_error(e))?;
                for instance in batch {
                    found.insert(instance.key(), instance);
                }
            }
        }

        let ordered: Vec<EntityRef> = unique
            .into_iter()
            .filter_map(|key| found.remove(&EntityKey::new(entity.clone(), key)))
            .collect();
        self.finish(tx, scope, &ordered)?;
        tracing::debug!(count = ordered.len(), "Loaded by identifiers");
        Ok(ordered)
    }

    fn load_by_query(
        &self,
        tx: &mut TransactionContext,
        scope: &LoadScope<'_>,
        single: bool,
    ) -> Result<Vec<EntityRef>> {
        let prepared = self.prepare(scope)?;
        let key = if self.cache_allowed(tx, scope.spec) {
            let parts = CacheKeyParts {
                query: &prepared.query.text,
                parameters: &prepared.query.parameters,
                soft_deletion: scope.soft_deletion,
                single,
                security_parameters: Some(&prepared.security),
                plan: scope.plan.as_ref().map(FetchPlan::fingerprint),
                first: scope.spec.first,
                max: scope.spec.max,
            };
            Some(parts.key()?)
        } else {
            None
        };

        if let Some(key) = &key {
            if let Some(hit) = self.cache.get(key) {
                tracing::debug!("Query cache hit");
                return self.reconstitute(tx, scope, hit);
            }
        }

        let found = scope
            .session
            .query(&prepared.query)
            .map_err(|e| self.coordinator.map_session_error(e))?;
        self.finish(tx, scope, &found)?;

        if let Some(key) = key {
            let outcome = if found.is_empty() {
                CachedResult::NoResult
            } else if single && found.len() > 1 {
                CachedResult::NonUnique(found.len())
            } else {
                CachedResult::Ids(found.iter().map(|e| e.key_values()).collect())
            };
            self.cache.put(key, outcome, prepared.types, tx.started_at());
        }
        tracing::debug!(count = found.len(), "Query executed");
        Ok(found)
    }

    /// Turn a cached outcome back into instances of this transaction.
    fn reconstitute(
        &self,
        tx: &mut TransactionContext,
        scope: &LoadScope<'_>,
        hit: CachedResult,
    ) -> Result<Vec<EntityRef>> {
        let ids = match hit {
            CachedResult::NoResult => return Ok(Vec::new()),
            CachedResult::NonUnique(count) => {
                return Err(Error::NonUniqueResult {
                    entity: scope.spec.entity.clone(),
                    count,
                });
            }
            CachedResult::Ids(ids) => ids,
        };
        let mut found = Vec::with_capacity(ids.len());
        for id in &ids {
            let loaded = scope
                .session
                .find(&scope.descriptor.name, id, scope.plan.as_ref())
                .map_err(|e| self.coordinator.map_session_error(e))?;
            match loaded {
                Some(instance) => found.push(instance),
                None => tracing::warn!(id = ?id, "Cached identifier no longer resolves"),
            }
        }
        self.finish(tx, scope, &found)?;
        Ok(found)
    }

    fn cache_allowed(&self, tx: &TransactionContext, spec: &LoadSpec) -> bool {
        spec.hints.cacheable
            && !spec.is_native()
            && self.config.cache_enabled
            && spec.hints.lock_mode.is_none()
            // Flushed or bulk-updated rows must not leak to other transactions.
            && !tx.has_uncommitted_writes()
    }

    /// Register loaded instances and complete them to the plan.
    fn finish(&self, tx: &mut TransactionContext, scope: &LoadScope<'_>, loaded: &[EntityRef]) -> Result<()> {
        self.coordinator.attach_loaded(tx, &scope.session)?;
        if let Some(plan) = &scope.plan {
            for instance in loaded {
                self.complete_plan(tx, instance, plan)?;
            }
        }
        Ok(())
    }

    /// Load whatever `plan` names that `entity` does not have yet.
    fn complete_plan(&self, tx: &mut TransactionContext, entity: &EntityRef, plan: &FetchPlan) -> Result<()> {
        for node in plan.nodes() {
            let Some(attribute) = entity.descriptor().find_attribute(&node.attribute).cloned() else {
                continue;
            };
            self.coordinator.load_attribute(tx, entity, &attribute.name)?;
            if node.nested.is_empty() {
                continue;
            }
            let Some(sub) = attribute
                .kind
                .target()
                .and_then(|target| plan.sub_plan(&attribute.name, target))
            else {
                continue;
            };
            let related = entity
                .attr_value(&attribute.name)
                .map(|v| v.entities())
                .unwrap_or_default();
            for child in related.iter().filter(|c| !c.is_embeddable()) {
                self.complete_plan(tx, child, &sub)?;
            }
        }
        entity.apply_fetch_plan(plan);
        Ok(())
    }
}

impl std::fmt::Debug for DataLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataLoader")
            .field("config", &self.config)
            .field("cache", &self.cache)
            .field("transformers", &self.transformers.read().len())
            .field("constraints", &self.constraints.read().len())
            .finish_non_exhaustive()
    }
}

/// Drops cached results for types touched by a bulk update once the
/// transaction ends, whichever way it ends.
struct InvalidateOnCompletion {
    cache: Arc<QueryResultCache>,
    types: BTreeSet<String>,
}

impl TransactionSynchronization for InvalidateOnCompletion {
    fn after_completion(&self, _status: TransactionStatus) {
        self.cache.invalidate(&self.types);
    }
}

fn conjoin(criteria: Vec<Criterion>) -> Option<Criterion> {
    criteria.into_iter().reduce(Criterion::and)
}

/// Restrict a query to the given keys.
fn restrict_to_keys(
    query: SessionQuery,
    descriptor: &EntityDescriptor,
    keys: Vec<Vec<Value>>,
) -> Result<SessionQuery> {
    if !descriptor.has_composite_key() {
        let ids = keys.into_iter().filter_map(|k| k.into_iter().next()).collect();
        return Ok(query.with_ids(ids));
    }
    let mut alternatives = Vec::with_capacity(keys.len());
    for key in keys {
        if key.len() != descriptor.primary_key.len() {
            return Err(Error::metadata(&descriptor.name, None, "incomplete composite key"));
        }
        let parts = descriptor
            .primary_key
            .iter()
            .zip(key)
            .map(|(column, value)| Criterion::eq(column.clone(), value))
            .collect();
        alternatives.push(Criterion::And(parts));
    }
    Ok(query.with_filter(Criterion::Or(alternatives)))
}

/// Entity types reachable through `plan`.
fn plan_types(metadata: &MetadataRegistry, plan: &FetchPlan, types: &mut BTreeSet<String>) {
    let Some(descriptor) = metadata.get(plan.entity()) else {
        return;
    };
    for node in plan.nodes() {
        let Some(target) = descriptor
            .find_attribute(&node.attribute)
            .and_then(|a| a.kind.target())
        else {
            continue;
        };
        types.insert(target.to_string());
        if let Some(sub) = plan.sub_plan(&node.attribute, target) {
            plan_types(metadata, &sub, types);
        }
    }
}
