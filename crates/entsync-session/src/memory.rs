//! In-memory session backend.
//!
//! [`MemoryDatabase`] keeps committed rows per entity type. Every
//! [`MemorySession`] works on a private copy of the tables taken on first use
//! and writes its recorded row changes back on commit, so uncommitted work is
//! invisible to other sessions.
//!
//! Row layout:
//!
//! - scalars are stored under the attribute name;
//! - references store the target's key (a single value, or an array for
//!   composite keys);
//! - collections without `mapped_by` store an array of target keys, mapped
//!   collections are derived from the back-reference column of the target;
//! - embedded values store a presence flag under the attribute name and one
//!   `attribute.field` column per field.
//!
//! Every statement that reaches the tables is appended to a query log, which
//! tests use to count round trips.

use crate::session::{OrmSession, SessionFactory, SessionId, SessionQuery, UpdateAction};
use entsync_core::{
    AttrValue, AttributeDescriptor, AttributeKind, Entity, EntityDescriptor, EntityKey,
    EntityRef, FetchPlan, IdentitySet, InstanceId, LazyRef, MetadataRegistry, PersistenceError,
    PersistenceErrorKind, Result, Value,
};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64};

/// A stored row: column name to value.
pub type Row = BTreeMap<String, Value>;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);
static NULL: Value = Value::Null;

// ============================================================================
// Tables
// ============================================================================

#[derive(Debug, Clone, Default)]
struct Table {
    rows: HashMap<EntityKey, Row>,
    /// Insertion order, used for unsorted scans.
    order: Vec<EntityKey>,
}

impl Table {
    fn upsert(&mut self, key: EntityKey, row: Row) {
        if self.rows.insert(key.clone(), row).is_none() {
            self.order.push(key);
        }
    }

    fn delete(&mut self, key: &EntityKey) -> bool {
        if self.rows.remove(key).is_some() {
            self.order.retain(|k| k != key);
            true
        } else {
            false
        }
    }

    fn scan(&self) -> impl Iterator<Item = (&EntityKey, &Row)> {
        self.order
            .iter()
            .filter_map(|k| self.rows.get(k).map(|r| (k, r)))
    }
}

type Tables = HashMap<String, Table>;

#[derive(Debug, Clone)]
enum RowChange {
    Upsert(EntityKey, Row),
    Delete(EntityKey),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct UniqueConstraint {
    name: String,
    entity: String,
    columns: Vec<String>,
}

/// Kind of statement recorded in the query log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum QueryKind {
    Find,
    Select,
    Count,
    Update,
    Project,
    LoadAttribute,
}

/// One statement executed against the tables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueryLogEntry {
    pub session: SessionId,
    pub kind: QueryKind,
    pub entity: String,
    pub text: String,
    /// Number of ids bound by an id-restricted statement.
    pub id_count: Option<usize>,
}

// ============================================================================
// Database
// ============================================================================

struct DatabaseInner {
    metadata: Arc<MetadataRegistry>,
    tables: RwLock<Tables>,
    unique: RwLock<Vec<UniqueConstraint>>,
    /// Last identity handed out.
    sequence: AtomicI64,
    log: Mutex<Vec<QueryLogEntry>>,
}

/// Shared committed state. Cloning yields another handle to the same data.
#[derive(Clone)]
pub struct MemoryDatabase {
    inner: Arc<DatabaseInner>,
}

impl MemoryDatabase {
    pub fn new(metadata: Arc<MetadataRegistry>) -> Self {
        Self {
            inner: Arc::new(DatabaseInner {
                metadata,
                tables: RwLock::new(Tables::new()),
                unique: RwLock::new(Vec::new()),
                sequence: AtomicI64::new(0),
                log: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn metadata(&self) -> &Arc<MetadataRegistry> {
        &self.inner.metadata
    }

    /// Declare a unique constraint over `columns` of `entity`.
    ///
    /// Violations surface from flush as constraint errors naming `name`.
    pub fn add_unique_constraint<I, S>(&self, name: impl Into<String>, entity: impl Into<String>, columns: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inner.unique.write().push(UniqueConstraint {
            name: name.into(),
            entity: entity.into(),
            columns: columns.into_iter().map(Into::into).collect(),
        });
    }

    /// Store a committed row directly, bypassing sessions.
    pub fn insert_row<I, S>(&self, entity: &str, values: I) -> Result<EntityKey>
    where
        I: IntoIterator<Item = (S, Value)>,
        S: Into<String>,
    {
        let desc = self.inner.metadata.require(entity)?;
        let row: Row = values.into_iter().map(|(c, v)| (c.into(), v)).collect();
        let key = EntityKey::new(
            entity,
            desc.primary_key
                .iter()
                .map(|c| row.get(c).cloned().unwrap_or(Value::Null))
                .collect(),
        );
        if key.is_incomplete() {
            return Err(constraint_error(format!(
                "null value in primary key of \"{entity}\""
            )));
        }
        for v in &key.id {
            let seen = match v {
                Value::Int(n) => i64::from(*n),
                Value::BigInt(n) => *n,
                _ => continue,
            };
            self.inner
                .sequence
                .fetch_max(seen, std::sync::atomic::Ordering::SeqCst);
        }
        self.inner
            .tables
            .write()
            .entry(entity.to_string())
            .or_default()
            .upsert(key.clone(), row);
        Ok(key)
    }

    /// Committed row for `key`.
    pub fn row(&self, key: &EntityKey) -> Option<Row> {
        self.inner
            .tables
            .read()
            .get(&key.entity)
            .and_then(|t| t.rows.get(key))
            .cloned()
    }

    /// Committed rows of `entity` in insertion order.
    pub fn rows(&self, entity: &str) -> Vec<Row> {
        self.inner
            .tables
            .read()
            .get(entity)
            .map(|t| t.scan().map(|(_, r)| r.clone()).collect())
            .unwrap_or_default()
    }

    pub fn row_count(&self, entity: &str) -> usize {
        self.inner
            .tables
            .read()
            .get(entity)
            .map_or(0, |t| t.rows.len())
    }

    pub fn query_log(&self) -> Vec<QueryLogEntry> {
        self.inner.log.lock().clone()
    }

    pub fn clear_query_log(&self) {
        self.inner.log.lock().clear();
    }

    fn next_id(&self) -> i64 {
        self.inner
            .sequence
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst)
            + 1
    }

    fn log(&self, entry: QueryLogEntry) {
        tracing::trace!(
            session = entry.session,
            kind = ?entry.kind,
            entity = %entry.entity,
            text = %entry.text,
            "Executing statement"
        );
        self.inner.log.lock().push(entry);
    }

    fn snapshot(&self) -> Tables {
        self.inner.tables.read().clone()
    }

    fn apply(&self, changes: Vec<RowChange>) {
        let mut tables = self.inner.tables.write();
        for change in changes {
            match change {
                RowChange::Upsert(key, row) => {
                    tables.entry(key.entity.clone()).or_default().upsert(key, row);
                }
                RowChange::Delete(key) => {
                    if let Some(table) = tables.get_mut(&key.entity) {
                        table.delete(&key);
                    }
                }
            }
        }
    }
}

impl SessionFactory for MemoryDatabase {
    fn open_session(&self, store: &str) -> Result<Arc<dyn OrmSession>> {
        Ok(Arc::new(MemorySession::new(self.clone(), store)))
    }
}

impl std::fmt::Debug for MemoryDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tables = self.inner.tables.read();
        let counts: BTreeMap<&str, usize> = tables
            .iter()
            .map(|(name, t)| (name.as_str(), t.rows.len()))
            .collect();
        f.debug_struct("MemoryDatabase")
            .field("tables", &counts)
            .field("unique_constraints", &self.inner.unique.read().len())
            .finish()
    }
}

// ============================================================================
// Session
// ============================================================================

#[derive(Default)]
struct SessionState {
    /// Private copy of the tables, taken on first use.
    working: Option<Tables>,
    /// Row changes to replay on commit.
    changes: Vec<RowChange>,
    /// First-level cache: one instance per stored row.
    cache: HashMap<EntityKey, EntityRef>,
    /// Instances written on flush.
    managed: IdentitySet,
    /// Persisted instances whose row has not been written yet.
    inserted: HashSet<InstanceId>,
    /// Materialized since the last `take_loaded`.
    loaded: Vec<EntityRef>,
}

impl SessionState {
    fn tables(&mut self, db: &MemoryDatabase) -> &mut Tables {
        self.working.get_or_insert_with(|| db.snapshot())
    }

    fn row(&mut self, db: &MemoryDatabase, key: &EntityKey) -> Option<Row> {
        self.tables(db)
            .get(&key.entity)
            .and_then(|t| t.rows.get(key))
            .cloned()
    }
}

/// Session over a [`MemoryDatabase`].
pub struct MemorySession {
    id: SessionId,
    store: String,
    db: MemoryDatabase,
    state: Mutex<SessionState>,
}

impl MemorySession {
    pub fn new(db: MemoryDatabase, store: impl Into<String>) -> Self {
        Self {
            id: NEXT_SESSION_ID.fetch_add(1, std::sync::atomic::Ordering::Relaxed),
            store: store.into(),
            db,
            state: Mutex::new(SessionState::default()),
        }
    }

    fn log(&self, kind: QueryKind, entity: &str, text: String, id_count: Option<usize>) {
        self.db.log(QueryLogEntry {
            session: self.id,
            kind,
            entity: entity.to_string(),
            text,
            id_count,
        });
    }

    /// Attribute values of a stored row, relations left lazy.
    fn row_values(&self, desc: &EntityDescriptor, row: &Row) -> Result<Vec<(String, AttrValue)>> {
        let mut values = Vec::with_capacity(desc.attributes.len());
        for attr in &desc.attributes {
            let value = match &attr.kind {
                AttributeKind::Scalar => {
                    AttrValue::Scalar(row.get(&attr.name).cloned().unwrap_or(Value::Null))
                }
                AttributeKind::Reference { .. } => {
                    AttrValue::Lazy(LazyRef::ToOne(row.get(&attr.name).and_then(fk_ids)))
                }
                AttributeKind::Collection { .. } => AttrValue::Lazy(LazyRef::ToMany),
                AttributeKind::Embedded { target } => {
                    AttrValue::Embedded(self.embedded_from_row(target, &attr.name, row)?)
                }
            };
            values.push((attr.name.clone(), value));
        }
        Ok(values)
    }

    fn embedded_from_row(&self, target: &str, attribute: &str, row: &Row) -> Result<Option<EntityRef>> {
        if row.get(attribute) != Some(&Value::Bool(true)) {
            return Ok(None);
        }
        let desc = self.db.metadata().require(target)?;
        let values: Vec<(String, AttrValue)> = desc
            .attributes
            .iter()
            .filter(|a| a.kind == AttributeKind::Scalar)
            .map(|a| {
                let column = format!("{attribute}.{}", a.name);
                (
                    a.name.clone(),
                    AttrValue::Scalar(row.get(&column).cloned().unwrap_or(Value::Null)),
                )
            })
            .collect();
        Ok(Some(Entity::loaded(desc, values)))
    }

    /// Instance for a stored row, reusing the cached one when present.
    ///
    /// The new instance is cached before its eager relations are resolved so
    /// that cycles end at the cache.
    fn materialize(
        &self,
        st: &mut SessionState,
        desc: &Arc<EntityDescriptor>,
        key: EntityKey,
        row: &Row,
        plan: Option<&FetchPlan>,
    ) -> Result<EntityRef> {
        if let Some(existing) = st.cache.get(&key).cloned() {
            if let Some(plan) = plan {
                self.complete_plan(st, &existing, plan)?;
            }
            return Ok(existing);
        }
        let entity = Entity::loaded(Arc::clone(desc), self.row_values(desc, row)?);
        st.cache.insert(key, Arc::clone(&entity));
        st.managed.insert(Arc::clone(&entity));
        st.loaded.push(Arc::clone(&entity));

        for attr in desc.relations() {
            let planned = plan.is_some_and(|p| p.get(&attr.name).is_some());
            if attr.lazy && !planned {
                continue;
            }
            let sub = plan.and_then(|p| sub_plan(p, attr));
            let value = self.resolve(st, &entity, attr, sub.as_ref())?;
            entity.hydrate(&attr.name, value);
        }
        if let Some(plan) = plan {
            entity.apply_fetch_plan(plan);
        }
        Ok(entity)
    }

    /// Load whatever `plan` names that `entity` does not have yet.
    fn complete_plan(&self, st: &mut SessionState, entity: &EntityRef, plan: &FetchPlan) -> Result<()> {
        for node in plan.nodes() {
            let Some(attr) = entity.descriptor().find_attribute(&node.attribute) else {
                continue;
            };
            let sub = sub_plan(plan, attr);
            if !entity.is_loaded(&attr.name) {
                let value = self.resolve(st, entity, attr, sub.as_ref())?;
                entity.hydrate(&attr.name, value);
            } else if let Some(sub) = &sub {
                let related = entity
                    .attr_value(&attr.name)
                    .map(|v| v.entities())
                    .unwrap_or_default();
                for child in related.iter().filter(|c| !c.is_embeddable()) {
                    self.complete_plan(st, child, sub)?;
                }
            }
        }
        entity.apply_fetch_plan(plan);
        Ok(())
    }

    fn resolve(
        &self,
        st: &mut SessionState,
        owner: &EntityRef,
        attr: &AttributeDescriptor,
        plan: Option<&FetchPlan>,
    ) -> Result<AttrValue> {
        match &attr.kind {
            AttributeKind::Reference { target } => {
                let fk = match owner.attr_value(&attr.name) {
                    Some(AttrValue::Lazy(LazyRef::ToOne(fk))) => fk,
                    Some(loaded @ AttrValue::Reference(_)) => return Ok(loaded),
                    _ => None,
                };
                let Some(ids) = fk else {
                    return Ok(AttrValue::Reference(None));
                };
                let desc = self.db.metadata().require(target)?;
                let key = EntityKey::new(target.clone(), ids);
                let found = match st.cache.get(&key).cloned() {
                    Some(cached) => {
                        if let Some(plan) = plan {
                            self.complete_plan(st, &cached, plan)?;
                        }
                        Some(cached)
                    }
                    None => match st.row(&self.db, &key) {
                        Some(row) => Some(self.materialize(st, &desc, key, &row, plan)?),
                        None => None,
                    },
                };
                Ok(AttrValue::Reference(found))
            }
            AttributeKind::Collection {
                target, mapped_by, ..
            } => {
                if let Some(loaded @ AttrValue::Collection(_)) = owner.attr_value(&attr.name) {
                    return Ok(loaded);
                }
                let desc = self.db.metadata().require(target)?;
                let rows: Vec<(EntityKey, Row)> = match mapped_by {
                    Some(back) => {
                        let fk = fk_value(&owner.key_values());
                        st.tables(&self.db)
                            .get(target)
                            .map(|t| {
                                t.scan()
                                    .filter(|(_, r)| r.get(back).is_some_and(|v| !v.is_null() && *v == fk))
                                    .map(|(k, r)| (k.clone(), r.clone()))
                                    .collect()
                            })
                            .unwrap_or_default()
                    }
                    None => {
                        let stored = st
                            .row(&self.db, &owner.key())
                            .and_then(|r| r.get(&attr.name).cloned());
                        let keys = match stored {
                            Some(Value::Array(items)) => items,
                            _ => Vec::new(),
                        };
                        keys.iter()
                            .filter_map(|fk| {
                                let key = EntityKey::new(target.clone(), fk_ids(fk)?);
                                let row = st.row(&self.db, &key)?;
                                Some((key, row))
                            })
                            .collect()
                    }
                };
                let mut items = Vec::with_capacity(rows.len());
                for (key, row) in rows {
                    items.push(self.materialize(st, &desc, key, &row, plan)?);
                }
                Ok(AttrValue::Collection(items))
            }
            AttributeKind::Scalar | AttributeKind::Embedded { .. } => owner.attr_value_or_empty(&attr.name),
        }
    }

    /// Rows matching the query's ids and filter, sorted but not paged.
    fn select_rows(&self, st: &mut SessionState, query: &SessionQuery) -> Result<Vec<(EntityKey, Row)>> {
        self.db.metadata().require(&query.entity)?;
        let Some(table) = st.tables(&self.db).get(&query.entity) else {
            return Ok(Vec::new());
        };
        let candidates: Vec<(EntityKey, Row)> = match &query.ids {
            Some(ids) => {
                let mut seen = HashSet::new();
                ids.iter()
                    .filter_map(|id| fk_ids(id).map(|parts| EntityKey::new(query.entity.clone(), parts)))
                    .filter(|k| seen.insert(k.clone()))
                    .filter_map(|k| table.rows.get(&k).cloned().map(|r| (k, r)))
                    .collect()
            }
            None => table.scan().map(|(k, r)| (k.clone(), r.clone())).collect(),
        };

        let mut rows = Vec::with_capacity(candidates.len());
        for (key, row) in candidates {
            if let Some(filter) = &query.filter {
                let lookup = |column: &str| row.get(column).cloned().unwrap_or(Value::Null);
                match filter.evaluate(&lookup) {
                    Some(true) => {}
                    Some(false) => continue,
                    None => {
                        return Err(PersistenceError::new(
                            PersistenceErrorKind::Query,
                            format!("cannot evaluate text-only condition of '{}'", query.text),
                        )
                        .into());
                    }
                }
            }
            rows.push((key, row));
        }

        if !query.sort.is_empty() {
            rows.sort_by(|(_, a), (_, b)| {
                for order in &query.sort {
                    let x = a.get(&order.attribute).unwrap_or(&NULL);
                    let y = b.get(&order.attribute).unwrap_or(&NULL);
                    let ord = x.compare(y).unwrap_or(Ordering::Equal);
                    let ord = if order.descending { ord.reverse() } else { ord };
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                Ordering::Equal
            });
        }
        Ok(rows)
    }

    fn to_row(&self, entity: &EntityRef, existing: Option<&Row>) -> Result<Row> {
        let mut row = Row::new();
        for attr in &entity.descriptor().attributes {
            let name = &attr.name;
            match &attr.kind {
                AttributeKind::Scalar => {
                    row.insert(name.clone(), entity.get(name).unwrap_or(Value::Null));
                }
                AttributeKind::Reference { .. } => {
                    let value = match entity.attr_value(name) {
                        Some(AttrValue::Reference(Some(target))) => fk_value(&target.key_values()),
                        Some(AttrValue::Lazy(LazyRef::ToOne(Some(ids)))) => fk_value(&ids),
                        _ => Value::Null,
                    };
                    row.insert(name.clone(), value);
                }
                AttributeKind::Collection {
                    mapped_by: Some(_), ..
                } => {}
                AttributeKind::Collection { mapped_by: None, .. } => {
                    let value = match entity.attr_value(name) {
                        Some(AttrValue::Collection(items)) => {
                            Value::Array(items.iter().map(|i| fk_value(&i.key_values())).collect())
                        }
                        Some(AttrValue::Lazy(_)) => existing
                            .and_then(|r| r.get(name).cloned())
                            .unwrap_or(Value::Array(Vec::new())),
                        _ => Value::Array(Vec::new()),
                    };
                    row.insert(name.clone(), value);
                }
                AttributeKind::Embedded { target } => match entity.embedded(name) {
                    Some(embedded) => {
                        row.insert(name.clone(), Value::Bool(true));
                        for (field, value) in embedded.scalar_values() {
                            row.insert(format!("{name}.{field}"), value);
                        }
                    }
                    None => {
                        row.insert(name.clone(), Value::Bool(false));
                        let desc = self.db.metadata().require(target)?;
                        for field in desc.attributes.iter().filter(|a| a.kind == AttributeKind::Scalar) {
                            row.insert(format!("{name}.{}", field.name), Value::Null);
                        }
                    }
                },
            }
        }
        Ok(row)
    }

    fn check_unique(&self, st: &mut SessionState, key: &EntityKey, row: &Row) -> Result<()> {
        let constraints: Vec<UniqueConstraint> = self
            .db
            .inner
            .unique
            .read()
            .iter()
            .filter(|c| c.entity == key.entity)
            .cloned()
            .collect();
        for constraint in constraints {
            let values: Vec<&Value> = constraint
                .columns
                .iter()
                .map(|c| row.get(c).unwrap_or(&NULL))
                .collect();
            if values.iter().any(|v| v.is_null()) {
                continue;
            }
            let clash = st.tables(&self.db).get(&key.entity).is_some_and(|t| {
                t.scan().any(|(k, r)| {
                    k != key
                        && constraint
                            .columns
                            .iter()
                            .zip(&values)
                            .all(|(c, v)| r.get(c) == Some(*v))
                })
            });
            if clash {
                return Err(unique_violation(&constraint.name));
            }
        }
        Ok(())
    }
}

impl OrmSession for MemorySession {
    fn id(&self) -> SessionId {
        self.id
    }

    fn store(&self) -> &str {
        &self.store
    }

    fn persist(&self, entity: &EntityRef) -> Result<()> {
        let mut st = self.state.lock();
        st.inserted.insert(entity.id());
        st.managed.insert(Arc::clone(entity));
        let key = entity.key();
        if !key.is_incomplete() {
            st.cache.insert(key, Arc::clone(entity));
        }
        tracing::trace!(
            session = self.id,
            entity = entity.entity_name(),
            instance = %entity.id(),
            "Insert scheduled"
        );
        Ok(())
    }

    fn merge(&self, entity: &EntityRef) -> Result<Option<HashMap<String, AttrValue>>> {
        let key = entity.key();
        if key.is_incomplete() {
            return Ok(None);
        }
        let mut st = self.state.lock();
        let Some(row) = st.row(&self.db, &key) else {
            return Ok(None);
        };
        let baseline: HashMap<String, AttrValue> =
            self.row_values(entity.descriptor(), &row)?.into_iter().collect();
        if let Some(previous) = st.cache.insert(key, Arc::clone(entity)) {
            if previous.id() != entity.id() {
                st.managed.remove(previous.id());
            }
        }
        st.inserted.remove(&entity.id());
        st.managed.insert(Arc::clone(entity));
        Ok(Some(baseline))
    }

    fn remove(&self, entity: &EntityRef) -> Result<()> {
        self.state.lock().managed.insert(Arc::clone(entity));
        Ok(())
    }

    fn find(&self, entity: &str, id: &[Value], plan: Option<&FetchPlan>) -> Result<Option<EntityRef>> {
        let desc = self.db.metadata().require(entity)?;
        let key = EntityKey::new(entity, id.to_vec());
        let mut st = self.state.lock();
        if let Some(cached) = st.cache.get(&key).cloned() {
            if cached.is_removed() {
                return Ok(None);
            }
            if let Some(plan) = plan {
                self.complete_plan(&mut st, &cached, plan)?;
            }
            return Ok(Some(cached));
        }
        self.log(QueryKind::Find, entity, format!("find {entity} {id:?}"), Some(1));
        let Some(row) = st.row(&self.db, &key) else {
            return Ok(None);
        };
        self.materialize(&mut st, &desc, key, &row, plan).map(Some)
    }

    fn query(&self, query: &SessionQuery) -> Result<Vec<EntityRef>> {
        let desc = self.db.metadata().require(&query.entity)?;
        self.log(
            QueryKind::Select,
            &query.entity,
            query.text.clone(),
            query.ids.as_ref().map(Vec::len),
        );
        let mut st = self.state.lock();
        let rows = page(self.select_rows(&mut st, query)?, query.first, query.max);
        let mut found = Vec::with_capacity(rows.len());
        for (key, row) in rows {
            let entity = self.materialize(&mut st, &desc, key, &row, query.plan.as_ref())?;
            if !entity.is_removed() {
                found.push(entity);
            }
        }
        Ok(found)
    }

    fn count(&self, query: &SessionQuery) -> Result<u64> {
        self.log(
            QueryKind::Count,
            &query.entity,
            query.text.clone(),
            query.ids.as_ref().map(Vec::len),
        );
        let mut st = self.state.lock();
        Ok(self.select_rows(&mut st, query)?.len() as u64)
    }

    fn execute_update(&self, query: &SessionQuery) -> Result<u64> {
        let Some(action) = &query.update else {
            return Err(PersistenceError::new(
                PersistenceErrorKind::Query,
                format!("'{}' is not an update statement", query.text),
            )
            .into());
        };
        self.log(
            QueryKind::Update,
            &query.entity,
            query.text.clone(),
            query.ids.as_ref().map(Vec::len),
        );
        let mut st = self.state.lock();
        let rows = self.select_rows(&mut st, query)?;
        let affected = rows.len() as u64;
        for (key, mut row) in rows {
            match action {
                UpdateAction::Set(assignments) => {
                    for (column, value) in assignments {
                        row.insert(column.clone(), value.clone());
                    }
                    st.tables(&self.db)
                        .entry(query.entity.clone())
                        .or_default()
                        .upsert(key.clone(), row.clone());
                    st.changes.push(RowChange::Upsert(key, row));
                }
                UpdateAction::Delete => {
                    if let Some(table) = st.tables(&self.db).get_mut(&query.entity) {
                        table.delete(&key);
                    }
                    st.changes.push(RowChange::Delete(key));
                }
            }
        }
        tracing::debug!(session = self.id, entity = %query.entity, affected, "Bulk update executed");
        Ok(affected)
    }

    fn project(&self, query: &SessionQuery) -> Result<Vec<Vec<Value>>> {
        self.log(
            QueryKind::Project,
            &query.entity,
            query.text.clone(),
            query.ids.as_ref().map(Vec::len),
        );
        let mut st = self.state.lock();
        let rows = page(self.select_rows(&mut st, query)?, query.first, query.max);
        Ok(rows
            .into_iter()
            .map(|(_, row)| {
                query
                    .projection
                    .iter()
                    .map(|c| row.get(c).cloned().unwrap_or(Value::Null))
                    .collect()
            })
            .collect())
    }

    fn load_attribute(&self, entity: &EntityRef, attribute: &str) -> Result<AttrValue> {
        let attr = entity.descriptor().require_attribute(attribute)?.clone();
        if attr.kind.is_reference() || attr.kind.is_collection() {
            self.log(
                QueryKind::LoadAttribute,
                entity.entity_name(),
                format!("load {}.{attribute}", entity.entity_name()),
                None,
            );
        }
        let plan = entity.fetch_plan();
        let sub = plan.as_ref().and_then(|p| sub_plan(p, &attr));
        let mut st = self.state.lock();
        self.resolve(&mut st, entity, &attr, sub.as_ref())
    }

    fn take_loaded(&self) -> Vec<EntityRef> {
        std::mem::take(&mut self.state.lock().loaded)
    }

    fn flush(&self) -> Result<()> {
        let mut st = self.state.lock();
        let managed = st.managed.to_vec();
        let (removed, written): (Vec<EntityRef>, Vec<EntityRef>) =
            managed.into_iter().partition(|e| e.is_removed());

        for entity in &removed {
            let key = entity.key();
            if let Some(table) = st.tables(&self.db).get_mut(&key.entity) {
                table.delete(&key);
            }
            if st.cache.get(&key).is_some_and(|c| c.id() == entity.id()) {
                st.cache.remove(&key);
            }
            st.managed.remove(entity.id());
            st.inserted.remove(&entity.id());
            st.changes.push(RowChange::Delete(key));
        }

        // Identities first, so references written below see final keys.
        for entity in &written {
            let desc = entity.descriptor();
            if let ([column], [Value::Null]) = (desc.primary_key.as_slice(), entity.key_values().as_slice()) {
                let id = self.db.next_id();
                entity.hydrate(column, AttrValue::Scalar(Value::BigInt(id)));
                tracing::trace!(entity = entity.entity_name(), instance = %entity.id(), id, "Assigned identity");
            }
        }

        for entity in &written {
            let key = entity.key();
            if key.is_incomplete() {
                return Err(constraint_error(format!(
                    "null value in primary key of \"{}\"",
                    entity.entity_name()
                )));
            }
            let existing = st.row(&self.db, &key);
            if st.inserted.contains(&entity.id()) && existing.is_some() {
                return Err(unique_violation(&format!(
                    "{}_pkey",
                    entity.entity_name().to_lowercase()
                )));
            }
            let row = self.to_row(entity, existing.as_ref())?;
            if existing.as_ref() == Some(&row) {
                continue;
            }
            self.check_unique(&mut st, &key, &row)?;
            st.tables(&self.db)
                .entry(key.entity.clone())
                .or_default()
                .upsert(key.clone(), row.clone());
            st.inserted.remove(&entity.id());
            st.cache.insert(key.clone(), Arc::clone(entity));
            st.changes.push(RowChange::Upsert(key, row));
        }
        tracing::debug!(
            session = self.id,
            deleted = removed.len(),
            pending = st.changes.len(),
            "Session flushed"
        );
        Ok(())
    }

    fn clear(&self) {
        let mut st = self.state.lock();
        st.cache.clear();
        st.managed.clear();
        st.inserted.clear();
        st.loaded.clear();
    }

    fn detach(&self, entity: &EntityRef) {
        let mut st = self.state.lock();
        st.managed.remove(entity.id());
        st.inserted.remove(&entity.id());
        let key = entity.key();
        if st.cache.get(&key).is_some_and(|c| c.id() == entity.id()) {
            st.cache.remove(&key);
        }
    }

    fn commit(&self) -> Result<()> {
        let changes = {
            let mut st = self.state.lock();
            st.working = None;
            std::mem::take(&mut st.changes)
        };
        tracing::debug!(session = self.id, changes = changes.len(), "Session committed");
        self.db.apply(changes);
        Ok(())
    }

    fn rollback(&self) {
        let mut st = self.state.lock();
        let discarded = st.changes.len();
        *st = SessionState::default();
        tracing::debug!(session = self.id, discarded, "Session rolled back");
    }
}

impl std::fmt::Debug for MemorySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.state.lock();
        f.debug_struct("MemorySession")
            .field("id", &self.id)
            .field("store", &self.store)
            .field("cached", &st.cache.len())
            .field("managed", &st.managed.len())
            .field("pending_changes", &st.changes.len())
            .finish()
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn sub_plan(plan: &FetchPlan, attr: &AttributeDescriptor) -> Option<FetchPlan> {
    attr.kind
        .target()
        .and_then(|target| plan.sub_plan(&attr.name, target))
}

fn page(rows: Vec<(EntityKey, Row)>, first: usize, max: Option<usize>) -> Vec<(EntityKey, Row)> {
    rows.into_iter()
        .skip(first)
        .take(max.unwrap_or(usize::MAX))
        .collect()
}

/// Column value of a foreign key: the single key value, or an array.
fn fk_value(ids: &[Value]) -> Value {
    match ids {
        [single] => single.clone(),
        _ => Value::Array(ids.to_vec()),
    }
}

/// Key components of a stored foreign key; `None` for NULL.
fn fk_ids(value: &Value) -> Option<Vec<Value>> {
    match value {
        Value::Null => None,
        Value::Array(parts) => Some(parts.clone()),
        other => Some(vec![other.clone()]),
    }
}

fn constraint_error(message: String) -> entsync_core::Error {
    PersistenceError::new(PersistenceErrorKind::Constraint, message).into()
}

fn unique_violation(name: &str) -> entsync_core::Error {
    constraint_error(format!(
        "duplicate key value violates unique constraint \"{name}\""
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Criterion, SortOrder};
    use entsync_core::Error;

    fn metadata() -> Arc<MetadataRegistry> {
        let mut reg = MetadataRegistry::new();
        reg.register(
            EntityDescriptor::new("Customer")
                .attribute(AttributeDescriptor::scalar("name"))
                .attribute(AttributeDescriptor::list("orders", "Order").mapped_by("customer")),
        );
        reg.register(
            EntityDescriptor::new("Order")
                .attribute(AttributeDescriptor::scalar("total"))
                .attribute(AttributeDescriptor::reference("customer", "Customer"))
                .attribute(AttributeDescriptor::embedded("shipping", "Address")),
        );
        reg.register(EntityDescriptor::embeddable("Address").attribute(AttributeDescriptor::scalar("city")));
        Arc::new(reg)
    }

    fn seeded() -> MemoryDatabase {
        let db = MemoryDatabase::new(metadata());
        db.insert_row("Customer", [("id", Value::BigInt(1)), ("name", Value::from("Ada"))])
            .unwrap();
        for (id, total) in [(10_i64, 5_i64), (11, 7)] {
            db.insert_row(
                "Order",
                [
                    ("id", Value::BigInt(id)),
                    ("total", Value::BigInt(total)),
                    ("customer", Value::BigInt(1)),
                    ("shipping", Value::Bool(true)),
                    ("shipping.city", Value::from("Oslo")),
                ],
            )
            .unwrap();
        }
        db
    }

    fn session(db: &MemoryDatabase) -> MemorySession {
        MemorySession::new(db.clone(), "main")
    }

    #[test]
    fn test_find_uses_first_level_cache() {
        let db = seeded();
        let s = session(&db);
        let a = s.find("Order", &[Value::BigInt(10)], None).unwrap().unwrap();
        let b = s.find("Order", &[Value::BigInt(10)], None).unwrap().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(db.query_log().len(), 1);
        assert_eq!(s.take_loaded().len(), 1);
        assert!(s.take_loaded().is_empty());
    }

    #[test]
    fn test_relations_load_lazily() {
        let db = seeded();
        let s = session(&db);
        let order = s.find("Order", &[Value::BigInt(10)], None).unwrap().unwrap();
        assert!(!order.is_loaded("customer"));
        assert_eq!(order.embedded("shipping").unwrap().get("city"), Some(Value::from("Oslo")));

        let customer = s.load_attribute(&order, "customer").unwrap();
        let AttrValue::Reference(Some(customer)) = customer else {
            panic!("expected a loaded reference");
        };
        let orders = s.load_attribute(&customer, "orders").unwrap();
        let ids: Vec<Value> = orders.entities().iter().map(|o| o.key_values()[0].clone()).collect();
        assert_eq!(ids, vec![Value::BigInt(10), Value::BigInt(11)]);
        // The same row always maps to the same instance.
        assert!(orders.entities().iter().any(|o| Arc::ptr_eq(o, &order)));
    }

    #[test]
    fn test_plan_loads_relations_eagerly() {
        let db = seeded();
        let s = session(&db);
        let plan = FetchPlan::new("Order").add_path("customer.orders");
        let order = s.find("Order", &[Value::BigInt(11)], Some(&plan)).unwrap().unwrap();
        let customer = order.reference("customer").unwrap();
        assert!(customer.is_loaded("orders"));
        assert_eq!(customer.collection("orders").len(), 2);
        assert!(order.fetch_plan().is_some());
    }

    #[test]
    fn test_query_filter_sort_page() {
        let db = seeded();
        let s = session(&db);
        let q = SessionQuery::new("Order")
            .with_filter(Criterion::eq("customer", 1_i64))
            .with_sort(SortOrder::desc("total"))
            .with_page(0, Some(1));
        let found = s.query(&q).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].get("total"), Some(Value::BigInt(7)));
        assert_eq!(s.count(&q).unwrap(), 2);

        let raw = SessionQuery::new("Order").with_filter(Criterion::Raw("e.total > 1".into()));
        assert!(matches!(s.query(&raw), Err(Error::Persistence(_))));
    }

    #[test]
    fn test_id_restricted_query_logs_id_count() {
        let db = seeded();
        let s = session(&db);
        let q = SessionQuery::new("Order").with_ids(vec![
            Value::BigInt(10),
            Value::BigInt(11),
            Value::BigInt(99),
        ]);
        assert_eq!(s.query(&q).unwrap().len(), 2);
        let log = db.query_log();
        assert_eq!(log.last().unwrap().id_count, Some(3));
        assert_eq!(log.last().unwrap().kind, QueryKind::Select);
    }

    #[test]
    fn test_flush_assigns_ids_and_commit_publishes_rows() {
        let db = seeded();
        let s = session(&db);
        let desc = db.metadata().require("Customer").unwrap();
        let grace = Entity::new(desc);
        grace.set("name", "Grace").unwrap();
        s.persist(&grace).unwrap();
        s.flush().unwrap();
        // Seeded rows advanced the sequence past 11.
        assert_eq!(grace.key_values(), vec![Value::BigInt(12)]);
        // Not visible outside the session before commit.
        assert_eq!(db.row_count("Customer"), 1);
        s.commit().unwrap();
        assert_eq!(db.row_count("Customer"), 2);
        let row = db.row(&EntityKey::single("Customer", 12_i64)).unwrap();
        assert_eq!(row.get("name"), Some(&Value::from("Grace")));
    }

    #[test]
    fn test_rollback_discards_changes() {
        let db = seeded();
        let s = session(&db);
        let delete = SessionQuery::new("Order").with_update(UpdateAction::Delete);
        assert_eq!(s.execute_update(&delete).unwrap(), 2);
        assert_eq!(s.count(&SessionQuery::new("Order")).unwrap(), 0);
        s.rollback();
        assert_eq!(s.count(&SessionQuery::new("Order")).unwrap(), 2);
        assert_eq!(db.row_count("Order"), 2);
    }

    #[test]
    fn test_unique_constraint_violation_message() {
        let db = seeded();
        db.add_unique_constraint("customer_name_key", "Customer", ["name"]);
        let s = session(&db);
        let dup = Entity::new(db.metadata().require("Customer").unwrap());
        dup.set("name", "Ada").unwrap();
        s.persist(&dup).unwrap();
        let err = s.flush().unwrap_err();
        assert!(err.to_string().contains("unique constraint \"customer_name_key\""));
    }

    #[test]
    fn test_duplicate_primary_key() {
        let db = seeded();
        let s = session(&db);
        let dup = Entity::new(db.metadata().require("Customer").unwrap());
        dup.set("id", 1_i64).unwrap();
        s.persist(&dup).unwrap();
        let err = s.flush().unwrap_err();
        assert!(err.to_string().contains("customer_pkey"));
    }

    #[test]
    fn test_merge_returns_stored_baseline() {
        let db = seeded();
        let s = session(&db);
        let detached = Entity::new(db.metadata().require("Customer").unwrap());
        detached.set("id", 1_i64).unwrap();
        let baseline = s.merge(&detached).unwrap().unwrap();
        assert!(matches!(
            baseline.get("name"),
            Some(AttrValue::Scalar(Value::Text(name))) if name == "Ada"
        ));

        let missing = Entity::new(db.metadata().require("Customer").unwrap());
        missing.set("id", 42_i64).unwrap();
        assert!(s.merge(&missing).unwrap().is_none());
    }

    #[test]
    fn test_bulk_update_and_projection() {
        let db = seeded();
        let s = session(&db);
        let update = SessionQuery::new("Order")
            .with_filter(Criterion::eq("id", 10_i64))
            .with_update(UpdateAction::Set(vec![("total".into(), Value::BigInt(50))]));
        assert_eq!(s.execute_update(&update).unwrap(), 1);
        let totals = s
            .project(
                &SessionQuery::new("Order")
                    .with_sort(SortOrder::asc("id"))
                    .with_projection(["total"]),
            )
            .unwrap();
        assert_eq!(totals, vec![vec![Value::BigInt(50)], vec![Value::BigInt(7)]]);
        s.commit().unwrap();
        let row = db.row(&EntityKey::single("Order", 10_i64)).unwrap();
        assert_eq!(row.get("total"), Some(&Value::BigInt(50)));
    }

    #[test]
    fn test_fk_round_trip() {
        assert_eq!(fk_ids(&fk_value(&[Value::BigInt(3)])), Some(vec![Value::BigInt(3)]));
        let composite = vec![Value::BigInt(1), Value::from("a")];
        assert_eq!(fk_ids(&fk_value(&composite)), Some(composite));
        assert_eq!(fk_ids(&Value::Null), None);
    }
}
