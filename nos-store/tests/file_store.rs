use anyhow::Result as AnyResult;
use nos_domain::error::StoreError;
use nos_domain::key::PrimaryKey;
use nos_domain::metamodel::SpecificationRegistry;
use nos_domain::value::ScalarValue;
use nos_macros::naked_object;
use nos_store::file::{FileConnectionFactory, FileServer};
use nos_store::{Command, ObjectStore, PersistenceQuery, StoreConfig};
use std::collections::HashSet;
use std::net::TcpListener;
use std::sync::Arc;
use std::thread;

#[allow(dead_code)]
#[naked_object(title = "name")]
struct Widget {
    name: String,
    size: Option<i64>,
}

fn specs() -> Arc<SpecificationRegistry> {
    let specs = SpecificationRegistry::new();
    specs.register_type::<Widget>();
    Arc::new(specs)
}

fn local_store(server: &Arc<FileServer>) -> AnyResult<ObjectStore> {
    let store = ObjectStore::builder()
        .specifications(specs())
        .connections(Arc::new(FileConnectionFactory::local(server.clone())))
        .build()?;
    Ok(store)
}

fn tcp_store(addr: std::net::SocketAddr) -> AnyResult<ObjectStore> {
    let config = StoreConfig::default();
    let store = ObjectStore::builder()
        .config(config.clone())
        .specifications(specs())
        .connections(Arc::new(FileConnectionFactory::tcp(addr, config)))
        .build()?;
    Ok(store)
}

#[test]
fn lifecycle_over_tcp() -> AnyResult<()> {
    let dir = tempfile::tempdir()?;
    let server = FileServer::open(dir.path(), &StoreConfig::default())?;
    let handle = server.serve(TcpListener::bind("127.0.0.1:0")?)?;
    let store = tcp_store(handle.local_addr())?;

    let widget = store.create_transient_instance("Widget")?;
    widget.set_value("name", "sprocket")?;
    store.execute("alice", vec![Command::Create(widget.clone())])?;
    let oid = widget.oid().expect("root object");
    assert_eq!(oid.key(), &PrimaryKey::Integer(1));

    widget.set_value("size", 3_i64)?;
    store.execute("alice", vec![Command::Save(widget.clone())])?;

    let reader = tcp_store(handle.local_addr())?;
    let loaded = reader.get_object(&oid, None)?.expect("stored");
    assert_eq!(loaded.version().map(|v| v.sequence()), Some(2));
    assert_eq!(loaded.value("size")?, Some(ScalarValue::Integer(3)));
    assert_eq!(loaded.title(), "sprocket");

    store.execute("alice", vec![Command::Destroy(widget)])?;
    assert!(reader.get_object(&oid, None)?.is_none());
    assert!(!reader.has_instances("Widget")?);

    store.shutdown()?;
    reader.shutdown()?;
    handle.stop()?;
    Ok(())
}

#[test]
fn stale_save_over_tcp_is_rejected() -> AnyResult<()> {
    let dir = tempfile::tempdir()?;
    let server = FileServer::open(dir.path(), &StoreConfig::default())?;
    let handle = server.serve(TcpListener::bind("127.0.0.1:0")?)?;
    let ours = tcp_store(handle.local_addr())?;
    let theirs = tcp_store(handle.local_addr())?;

    let widget = ours.create_transient_instance("Widget")?;
    widget.set_value("name", "shared")?;
    ours.execute("alice", vec![Command::Create(widget.clone())])?;
    let oid = widget.oid().expect("root object");

    let copy = theirs.get_object(&oid, None)?.expect("stored");
    copy.set_value("size", 1_i64)?;
    theirs.execute("bob", vec![Command::Save(copy)])?;

    widget.set_value("size", 2_i64)?;
    let err = ours
        .execute("alice", vec![Command::Save(widget.clone())])
        .unwrap_err();
    assert!(matches!(err, StoreError::OptimisticLock { expected: 1, actual: 2, .. }));
    assert_eq!(widget.version().map(|v| v.sequence()), Some(1));

    handle.stop()?;
    Ok(())
}

#[test]
fn data_survives_a_restart() -> AnyResult<()> {
    let dir = tempfile::tempdir()?;
    let oid = {
        let server = FileServer::open(dir.path(), &StoreConfig::default())?;
        let store = local_store(&server)?;
        let widget = store.create_transient_instance("Widget")?;
        widget.set_value("name", "durable")?;
        store.execute("alice", vec![Command::Create(widget.clone())])?;
        let oid = widget.oid().expect("root object");
        store.register_service("widgets", &oid)?;
        store.shutdown()?;
        server.shutdown()?;
        oid
    };

    let server = FileServer::open(dir.path(), &StoreConfig::default())?;
    let store = local_store(&server)?;
    let loaded = store.get_object(&oid, Some("Widget"))?.expect("stored");
    assert_eq!(loaded.title(), "durable");
    assert_eq!(store.get_oid_for_service("widgets")?, Some(oid.clone()));

    // 序列号从上次预取的批次之后继续
    let next = store.create_transient_instance("Widget")?;
    next.set_value("name", "after restart")?;
    store.execute("alice", vec![Command::Create(next.clone())])?;
    let key = next.oid().expect("root object").key().clone();
    assert_eq!(key, PrimaryKey::Integer(11));

    let titles = store.get_instances(&PersistenceQuery::find_by_title("Widget", "RESTART"))?;
    assert_eq!(titles.len(), 1);
    Ok(())
}

#[test]
fn concurrent_clients_get_distinct_keys() -> AnyResult<()> {
    let dir = tempfile::tempdir()?;
    let server = FileServer::open(dir.path(), &StoreConfig::default())?;
    let handle = server.serve(TcpListener::bind("127.0.0.1:0")?)?;
    let addr = handle.local_addr();

    let workers: Vec<_> = (0..4)
        .map(|worker| {
            thread::spawn(move || -> AnyResult<Vec<PrimaryKey>> {
                let store = tcp_store(addr)?;
                let mut keys = Vec::new();
                for n in 0..15 {
                    let widget = store.create_transient_instance("Widget")?;
                    widget.set_value("name", format!("w{worker}-{n}"))?;
                    store.execute("worker", vec![Command::Create(widget.clone())])?;
                    keys.push(widget.oid().expect("root object").key().clone());
                }
                store.shutdown()?;
                Ok(keys)
            })
        })
        .collect();

    let mut keys = HashSet::new();
    for worker in workers {
        for key in worker.join().expect("worker panicked")? {
            assert!(keys.insert(key), "duplicate key");
        }
    }
    assert_eq!(keys.len(), 60);

    let store = tcp_store(addr)?;
    assert_eq!(
        store.get_instances(&PersistenceQuery::find_all("Widget"))?.len(),
        60
    );
    handle.stop()?;
    Ok(())
}
