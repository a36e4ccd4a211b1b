use entsync::prelude::*;
use entsync::{
    AttributeChanges, ChangeValue, EntityKey, ListenerScope, QueryKind, TransactionStatus,
};
use parking_lot::Mutex;
use proptest::prelude::*;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn metadata() -> Arc<MetadataRegistry> {
    let mut reg = MetadataRegistry::new();
    reg.register(
        EntityDescriptor::new("Customer")
            .attribute(AttributeDescriptor::scalar("name"))
            .attribute(
                AttributeDescriptor::list("orders", "Order")
                    .mapped_by("customer")
                    .cascade(CascadePolicy::ALL),
            ),
    );
    reg.register(
        EntityDescriptor::new("Order")
            .attribute(AttributeDescriptor::scalar("total"))
            .attribute(AttributeDescriptor::reference("customer", "Customer")),
    );
    reg.register(
        EntityDescriptor::new("Document")
            .attribute(AttributeDescriptor::scalar("title"))
            .soft_delete("deleted_at", Some("deleted_by")),
    );
    reg.register(EntityDescriptor::new("Tag").attribute(AttributeDescriptor::scalar("label")));
    Arc::new(reg)
}

type Recorded = Arc<Mutex<Vec<(ChangeType, String, Option<AttributeChanges>)>>>;

struct Recorder(Recorded);

impl EntityChangedListener for Recorder {
    fn entity_changed(
        &self,
        _scope: &mut ListenerScope<'_>,
        event: &EntityChangedEventInfo,
    ) -> Result<()> {
        self.0
            .lock()
            .push((event.change_type, event.entity_name.clone(), event.changes.clone()));
        Ok(())
    }
}

struct Fixture {
    manager: DataManager,
    db: MemoryDatabase,
    events: Recorded,
}

impl Fixture {
    fn new() -> Self {
        Self::with_config(PersistenceConfig::default())
    }

    fn with_config(config: PersistenceConfig) -> Self {
        init_tracing();
        let metadata = metadata();
        let db = MemoryDatabase::new(Arc::clone(&metadata));
        let events: Recorded = Arc::new(Mutex::new(Vec::new()));
        let manager = DataManager::builder()
            .with_config(config)
            .with_store(StoreConfig::new(MAIN_STORE), Arc::new(db.clone()))
            .with_changed_listener(None, 0, Arc::new(Recorder(Arc::clone(&events))))
            .build_with(metadata)
            .unwrap();
        Self {
            manager,
            db,
            events,
        }
    }

    fn seed(&self, entity: &str, id: i64, attribute: &str, value: &str) {
        self.db
            .insert_row(entity, [("id", Value::BigInt(id)), (attribute, Value::from(value))])
            .unwrap();
    }

    fn events(&self) -> Vec<(ChangeType, String)> {
        self.events
            .lock()
            .iter()
            .map(|(t, name, _)| (*t, name.clone()))
            .collect()
    }

    fn logged(&self, kind: QueryKind) -> Vec<Option<usize>> {
        self.db
            .query_log()
            .into_iter()
            .filter(|e| e.kind == kind)
            .map(|e| e.id_count)
            .collect()
    }
}

fn old_scalar(changes: &AttributeChanges, attribute: &str) -> Option<Value> {
    match changes.old_value(attribute) {
        Some(ChangeValue::Scalar(v)) => Some(v.clone()),
        _ => None,
    }
}

fn customer_named(name: &str) -> LoadSpec {
    LoadSpec::new("Customer").condition(Criterion::eq("name", name))
}

#[test]
fn created_once_across_implicit_flushes() {
    let fx = Fixture::new();
    let mut tx = fx.manager.begin();
    let ada = fx.manager.create("Customer").unwrap();
    ada.set("name", "Ada").unwrap();
    fx.manager.persist(&mut tx, &ada).unwrap();

    let found = fx.manager.load(&mut tx, &customer_named("Ada")).unwrap().unwrap();
    assert!(Arc::ptr_eq(&found, &ada));
    assert!(!ada.is_new());

    ada.set("name", "Bea").unwrap();
    assert_eq!(fx.manager.count(&mut tx, &customer_named("Bea")).unwrap(), 1);
    fx.manager.commit(&mut tx).unwrap();

    assert_eq!(fx.events(), vec![(ChangeType::Created, "Customer".to_string())]);
    assert_eq!(fx.db.row_count("Customer"), 1);
}

#[test]
fn implicit_flush_and_commit_publish_one_update() {
    let fx = Fixture::new();
    fx.seed("Customer", 1, "name", "Ada");
    let mut tx = fx.manager.begin();
    let ada = fx
        .manager
        .load(&mut tx, &LoadSpec::new("Customer").id(1_i64))
        .unwrap()
        .unwrap();

    ada.set("name", "Bea").unwrap();
    let found = fx.manager.load_all(&mut tx, &customer_named("Bea")).unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(tx.pending_events().len(), 1);

    ada.set("name", "Cy").unwrap();
    fx.manager.commit(&mut tx).unwrap();

    let events = fx.events.lock();
    assert_eq!(events.len(), 1);
    let (change, entity, changes) = &events[0];
    assert_eq!(*change, ChangeType::Updated);
    assert_eq!(entity, "Customer");
    assert_eq!(old_scalar(changes.as_ref().unwrap(), "name"), Some(Value::from("Ada")));
}

#[test]
fn commit_mode_defers_flush_to_commit() {
    let fx = Fixture::with_config(PersistenceConfig::new().with_flush_mode(FlushMode::Commit));
    let mut tx = fx.manager.begin();
    let ada = fx.manager.create("Customer").unwrap();
    ada.set("name", "Ada").unwrap();
    fx.manager.persist(&mut tx, &ada).unwrap();

    assert!(fx.manager.load(&mut tx, &customer_named("Ada")).unwrap().is_none());
    assert!(tx.pending_events().is_empty());

    fx.manager.commit(&mut tx).unwrap();
    assert_eq!(fx.db.row_count("Customer"), 1);
    assert_eq!(fx.events().len(), 1);
}

#[test]
fn soft_delete_publishes_deleted_with_pre_delete_values() {
    let fx = Fixture::with_config(PersistenceConfig::new().with_deleted_by("auditor"));
    fx.seed("Document", 5, "title", "Plan");
    let by_id = LoadSpec::new("Document").id(5_i64);

    let mut tx = fx.manager.begin();
    let doc = fx.manager.load(&mut tx, &by_id).unwrap().unwrap();
    fx.manager.remove(&mut tx, &doc).unwrap();
    fx.manager.commit(&mut tx).unwrap();

    {
        let events = fx.events.lock();
        assert_eq!(events.len(), 1);
        let (change, _, changes) = &events[0];
        assert_eq!(*change, ChangeType::Deleted);
        let changes = changes.as_ref().unwrap();
        assert_eq!(old_scalar(changes, "deleted_at"), Some(Value::Null));
        assert_eq!(old_scalar(changes, "title"), Some(Value::from("Plan")));
    }

    let row = fx.db.row(&EntityKey::single("Document", 5_i64)).unwrap();
    assert!(matches!(row.get("deleted_at"), Some(Value::Timestamp(_))));
    assert_eq!(row.get("deleted_by"), Some(&Value::from("auditor")));

    let mut tx = fx.manager.begin();
    assert!(fx.manager.load(&mut tx, &by_id).unwrap().is_none());
    let including_deleted = by_id.soft_deletion(false);
    assert!(fx.manager.load(&mut tx, &including_deleted).unwrap().is_some());
    fx.manager.commit(&mut tx).unwrap();
}

#[test]
fn identifier_batches_follow_configured_size() {
    let fx = Fixture::with_config(PersistenceConfig::new().with_max_batch_size(1000));
    for id in 1..=2500 {
        fx.seed("Tag", id, "label", &format!("t{id}"));
    }
    let mut tx = fx.manager.begin();
    let tags = fx
        .manager
        .load_all(&mut tx, &LoadSpec::new("Tag").ids((1..=2500_i64).rev()))
        .unwrap();
    fx.manager.commit(&mut tx).unwrap();

    assert_eq!(tags.len(), 2500);
    assert_eq!(tags[0].get("label"), Some(Value::from("t2500")));
    assert_eq!(
        fx.logged(QueryKind::Select),
        vec![Some(1000), Some(1000), Some(500)]
    );
}

#[test]
fn cached_results_are_shared_between_transactions() {
    let fx = Fixture::new();
    fx.seed("Customer", 1, "name", "Ada");
    let spec = customer_named("Ada").cacheable(true);

    for _ in 0..3 {
        let mut tx = fx.manager.begin();
        assert_eq!(fx.manager.load_all(&mut tx, &spec).unwrap().len(), 1);
        fx.manager.commit(&mut tx).unwrap();
    }
    assert_eq!(fx.logged(QueryKind::Select).len(), 1);
    assert_eq!(fx.manager.cache().stats().hits, 2);

    let locked = spec.lock_mode(LockMode::Write);
    for _ in 0..2 {
        let mut tx = fx.manager.begin();
        fx.manager.load_all(&mut tx, &locked).unwrap();
        fx.manager.commit(&mut tx).unwrap();
    }
    assert_eq!(fx.logged(QueryKind::Select).len(), 3);
    assert_eq!(fx.manager.cache().stats().hits, 2);
}

#[test]
fn committed_changes_invalidate_cached_results() {
    let fx = Fixture::new();
    fx.seed("Customer", 1, "name", "Ada");
    let spec = customer_named("Ada").cacheable(true);

    let mut tx = fx.manager.begin();
    let ada = fx.manager.load(&mut tx, &spec).unwrap().unwrap();
    fx.manager.commit(&mut tx).unwrap();
    assert_eq!(fx.manager.cache().len(), 1);

    fx.manager
        .transaction(|tx| {
            ada.set("name", "Bea")?;
            fx.manager.persist(tx, &ada)
        })
        .unwrap();
    assert!(fx.manager.cache().is_empty());

    let mut tx = fx.manager.begin();
    assert!(fx.manager.load(&mut tx, &spec).unwrap().is_none());
    fx.manager.commit(&mut tx).unwrap();
}

#[test]
fn unloaded_cascade_is_not_followed_on_save() {
    let fx = Fixture::new();
    fx.seed("Customer", 1, "name", "Ada");
    fx.db
        .insert_row(
            "Order",
            [
                ("id", Value::BigInt(10)),
                ("total", Value::BigInt(30)),
                ("customer", Value::BigInt(1)),
            ],
        )
        .unwrap();

    let mut tx = fx.manager.begin();
    let ada = fx
        .manager
        .load(&mut tx, &LoadSpec::new("Customer").id(1_i64))
        .unwrap()
        .unwrap();
    ada.set("name", "Bea").unwrap();
    fx.manager.persist(&mut tx, &ada).unwrap();
    fx.manager.commit(&mut tx).unwrap();

    assert!(fx.logged(QueryKind::LoadAttribute).is_empty());
    assert!(!ada.is_loaded("orders"));
    assert_eq!(fx.events(), vec![(ChangeType::Updated, "Customer".to_string())]);
}

#[test]
fn loaded_cascade_saves_new_children() {
    let fx = Fixture::new();
    fx.seed("Customer", 1, "name", "Ada");

    let mut tx = fx.manager.begin();
    let spec = LoadSpec::new("Customer")
        .id(1_i64)
        .plan(FetchPlan::new("Customer").add("orders"));
    let ada = fx.manager.load(&mut tx, &spec).unwrap().unwrap();
    assert!(ada.is_loaded("orders"));

    let order = fx.manager.create("Order").unwrap();
    order.set("total", 12_i64).unwrap();
    order.set_reference("customer", Some(Arc::clone(&ada))).unwrap();
    ada.add_to_collection("orders", Arc::clone(&order)).unwrap();
    fx.manager.persist(&mut tx, &ada).unwrap();
    assert!(order.is_managed());
    fx.manager.commit(&mut tx).unwrap();

    assert_eq!(fx.db.row_count("Order"), 1);
    assert!(fx
        .events()
        .contains(&(ChangeType::Created, "Order".to_string())));
}

#[test]
fn failed_transaction_leaves_store_untouched() {
    let fx = Fixture::new();
    fx.seed("Tag", 1, "label", "red");

    let result: Result<()> = fx.manager.transaction(|tx| {
        let red = fx
            .manager
            .load(tx, &LoadSpec::new("Tag").id(1_i64))?
            .ok_or_else(|| Error::Custom("missing".to_string()))?;
        fx.manager.remove(tx, &red)?;
        fx.manager.flush(tx)?;
        Err(Error::Custom("abort".to_string()))
    });

    assert!(result.is_err());
    assert_eq!(fx.db.row_count("Tag"), 1);
    assert!(fx.events().is_empty());
}

#[test]
fn read_only_transaction_rejects_changes() {
    let fx = Fixture::new();
    fx.seed("Tag", 1, "label", "red");
    let mut tx = fx.manager.begin_with(TransactionOptions::new().read_only(true));
    let red = fx
        .manager
        .load(&mut tx, &LoadSpec::new("Tag").id(1_i64))
        .unwrap()
        .unwrap();
    red.set("label", "blue").unwrap();

    let err = fx.manager.commit(&mut tx).unwrap_err();
    assert!(matches!(err, Error::ReadOnlyViolation { .. }));
    assert_eq!(tx.status(), TransactionStatus::RolledBack);
    let row = fx.db.row(&EntityKey::single("Tag", 1_i64)).unwrap();
    assert_eq!(row.get("label"), Some(&Value::from("red")));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_rollback_restores_lifecycle(new_count in 0usize..4, remove_mask in 0u8..16) {
        let fx = Fixture::new();
        for id in 1..=4 {
            fx.seed("Tag", id, "label", &format!("t{id}"));
        }

        let mut tx = fx.manager.begin();
        let created: Vec<EntityRef> = (0..new_count)
            .map(|i| {
                let tag = fx.manager.create("Tag").unwrap();
                tag.set("label", format!("n{i}")).unwrap();
                fx.manager.persist(&mut tx, &tag).unwrap();
                tag
            })
            .collect();
        let loaded = fx
            .manager
            .load_all(&mut tx, &LoadSpec::new("Tag").ids(1..=4_i64))
            .unwrap();
        for (i, tag) in loaded.iter().enumerate() {
            if remove_mask & (1 << i) != 0 {
                fx.manager.remove(&mut tx, tag).unwrap();
            }
        }
        fx.manager.flush(&mut tx).unwrap();

        fx.manager.rollback(&mut tx);

        prop_assert_eq!(tx.status(), TransactionStatus::RolledBack);
        for tag in &created {
            prop_assert!(tag.is_new());
            prop_assert!(!tag.is_managed());
        }
        for tag in &loaded {
            prop_assert!(tag.is_detached());
            prop_assert!(!tag.is_removed());
        }
        prop_assert_eq!(fx.db.row_count("Tag"), 4);
        prop_assert!(fx.events().is_empty());
    }
}
