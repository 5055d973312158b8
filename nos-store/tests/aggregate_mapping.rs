use anyhow::Result as AnyResult;
use nos_domain::adapter::{FieldValue, ObjectRef};
use nos_domain::error::StoreError;
use nos_domain::metamodel::SpecificationRegistry;
use nos_domain::value::ScalarValue;
use nos_macros::naked_object;
use nos_store::memory::{MemoryConnectionFactory, MemoryDatabase};
use nos_store::{Command, ObjectStore};
use std::sync::Arc;

#[allow(dead_code)]
#[naked_object(title = "number")]
struct Order {
    number: i64,
    #[naked(aggregated)]
    lines: Vec<OrderLine>,
    watchers: Vec<Customer>,
}

#[allow(dead_code)]
#[naked_object(title = "name")]
struct Customer {
    name: String,
}

#[allow(dead_code)]
#[naked_object(aggregated = true)]
struct OrderLine {
    product: String,
    quantity: i64,
}

fn store_on(db: &Arc<MemoryDatabase>) -> AnyResult<ObjectStore> {
    let specs = SpecificationRegistry::new();
    specs.register_type::<Order>();
    specs.register_type::<Customer>();
    specs.register_type::<OrderLine>();
    let store = ObjectStore::builder()
        .specifications(Arc::new(specs))
        .connections(Arc::new(MemoryConnectionFactory::new(db.clone())))
        .build()?;
    Ok(store)
}

fn customer(store: &ObjectStore, name: &str) -> AnyResult<ObjectRef> {
    let customer = store.create_transient_instance("Customer")?;
    customer.set_value("name", name)?;
    Ok(customer)
}

fn collection(value: FieldValue) -> Vec<ObjectRef> {
    match value {
        FieldValue::Collection(items) => items,
        other => panic!("expected a collection, got {other:?}"),
    }
}

#[test]
fn aggregated_and_referenced_collections_round_trip() -> AnyResult<()> {
    let db = MemoryDatabase::new();
    let writer = store_on(&db)?;

    let ann = customer(&writer, "Ann")?;
    let bob = customer(&writer, "Bob")?;
    let order = writer.create_transient_instance("Order")?;
    order.set_value("number", 42_i64)?;
    for (product, quantity) in [("bolt", 10_i64), ("nut", 20), ("washer", 30)] {
        let line = writer.create_aggregated_instance(&order, "lines")?;
        line.set_value("product", product)?;
        line.set_value("quantity", quantity)?;
    }
    order.add_to_collection("watchers", ann.clone())?;
    order.add_to_collection("watchers", bob.clone())?;

    // 被引用的客户在同一批次中先于订单创建
    writer.execute(
        "alice",
        vec![
            Command::Create(ann.clone()),
            Command::Create(bob.clone()),
            Command::Create(order.clone()),
        ],
    )?;

    let written = order.collection("lines")?;
    let mut local_ids: Vec<_> = written.iter().filter_map(|l| l.local_id()).collect();
    assert_eq!(local_ids.len(), 3);
    local_ids.dedup();
    assert_eq!(local_ids.len(), 3);

    // 另一个对象存储从存储中重新读取
    let reader = store_on(&db)?;
    let oid = order.oid().expect("root object");
    let loaded = reader.get_object(&oid, Some("Order"))?.expect("stored order");
    assert_eq!(loaded.value("number")?, Some(ScalarValue::Integer(42)));

    let lines = loaded.collection("lines")?;
    assert_eq!(lines.len(), 3);
    let products = lines
        .iter()
        .map(|l| l.value("product"))
        .collect::<Result<Vec<_>, _>>()?;
    assert_eq!(
        products,
        [
            Some(ScalarValue::from("bolt")),
            Some(ScalarValue::from("nut")),
            Some(ScalarValue::from("washer")),
        ]
    );
    assert!(lines.iter().all(|l| l.is_aggregated() && l.oid().is_none()));
    assert_eq!(lines[2].value("quantity")?, Some(ScalarValue::Integer(30)));
    assert_eq!(lines[0].root_oid(), Some(oid.clone()));

    // 引用集合的元素先以占位对象出现，按需解析
    let watchers = loaded.collection("watchers")?;
    assert_eq!(watchers.len(), 2);
    assert!(watchers.iter().all(|w| w.is_ghost()));
    assert_eq!(watchers[0].oid(), ann.oid());
    assert_eq!(watchers[1].oid(), bob.oid());

    let resolved = collection(reader.resolve_field(&loaded, "watchers")?);
    assert!(resolved.iter().all(|w| !w.is_ghost()));
    let names: Vec<_> = resolved.iter().map(|w| w.title()).collect();
    assert_eq!(names, ["Ann", "Bob"]);
    // 与直接读取得到的是同一个实例
    let direct = reader
        .get_object(&ann.oid().expect("root object"), None)?
        .expect("stored customer");
    assert!(Arc::ptr_eq(&direct, &resolved[0]));
    Ok(())
}

#[test]
fn saving_a_changed_aggregate_rewrites_the_root() -> AnyResult<()> {
    let db = MemoryDatabase::new();
    let store = store_on(&db)?;

    let order = store.create_transient_instance("Order")?;
    order.set_value("number", 7_i64)?;
    let line = store.create_aggregated_instance(&order, "lines")?;
    line.set_value("product", "bolt")?;
    line.set_value("quantity", 1_i64)?;
    store.execute("alice", vec![Command::Create(order.clone())])?;
    let first_id = line.local_id();

    line.set_value("quantity", 5_i64)?;
    let extra = store.create_aggregated_instance(&order, "lines")?;
    extra.set_value("product", "nut")?;
    extra.set_value("quantity", 2_i64)?;
    store.execute("alice", vec![Command::Save(order.clone())])?;

    assert_eq!(line.local_id(), first_id);
    assert!(extra.local_id().is_some());
    assert_ne!(extra.local_id(), first_id);

    let reader = store_on(&db)?;
    let loaded = reader
        .get_object(&order.oid().expect("root object"), None)?
        .expect("stored order");
    let quantities = loaded
        .collection("lines")?
        .iter()
        .map(|l| l.value("quantity"))
        .collect::<Result<Vec<_>, _>>()?;
    assert_eq!(
        quantities,
        [Some(ScalarValue::Integer(5)), Some(ScalarValue::Integer(2))]
    );
    assert_eq!(loaded.version().map(|v| v.sequence()), Some(2));
    Ok(())
}

#[test]
fn aggregated_parts_are_not_roots() -> AnyResult<()> {
    let db = MemoryDatabase::new();
    let store = store_on(&db)?;

    assert!(matches!(
        store.create_transient_instance("OrderLine"),
        Err(StoreError::NotIndependentlyPersistable { .. })
    ));

    let order = store.create_transient_instance("Order")?;
    let line = store.create_aggregated_instance(&order, "lines")?;
    assert!(matches!(
        store.execute("alice", vec![Command::Create(line)]),
        Err(StoreError::NotIndependentlyPersistable { .. })
    ));
    assert!(matches!(
        store.create_aggregated_instance(&order, "watchers"),
        Err(StoreError::InvalidValue { .. })
    ));
    Ok(())
}

#[test]
fn reference_to_unsaved_object_aborts_create() -> AnyResult<()> {
    let db = MemoryDatabase::new();
    let store = store_on(&db)?;

    let stranger = customer(&store, "Stranger")?;
    let order = store.create_transient_instance("Order")?;
    order.set_value("number", 1_i64)?;
    order.add_to_collection("watchers", stranger)?;

    match store.execute("alice", vec![Command::Create(order.clone())]) {
        Err(StoreError::DanglingReference { field, .. }) => assert_eq!(field, "watchers"),
        other => panic!("unexpected {other:?}"),
    }
    assert!(order.oid().expect("root object").is_transient());
    assert_eq!(db.committed_count("Order"), 0);
    Ok(())
}
