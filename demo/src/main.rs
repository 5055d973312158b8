use anyhow::{Context, Result};
use nos_domain::adapter::ObjectRef;
use nos_domain::metamodel::SpecificationRegistry;
use nos_macros::naked_object;
use nos_store::connection::ConnectionFactory;
use nos_store::file::{FileConnectionFactory, FileServer};
use nos_store::memory::{MemoryConnectionFactory, MemoryDatabase};
use nos_store::{Command, ObjectStore, PersistenceQuery, StoreConfig};
use std::net::TcpListener;
use std::sync::Arc;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

#[allow(dead_code)]
#[naked_object(title = "name")]
struct Customer {
    name: String,
    email: Option<String>,
}

#[allow(dead_code)]
#[naked_object(title = "number")]
struct Invoice {
    number: i64,
    customer: Customer,
    #[naked(aggregated)]
    lines: Vec<InvoiceLine>,
}

#[allow(dead_code)]
#[naked_object(aggregated = true)]
struct InvoiceLine {
    description: String,
    amount: f64,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(fmt::layer().compact().with_target(true).with_thread_names(true))
        .with(filter)
        .init();
}

fn open_store(connections: Arc<dyn ConnectionFactory>) -> Result<ObjectStore> {
    let specs = SpecificationRegistry::new();
    specs.register_type::<Customer>();
    specs.register_type::<Invoice>();
    specs.register_type::<InvoiceLine>();
    Ok(ObjectStore::builder()
        .specifications(Arc::new(specs))
        .connections(connections)
        .build()?)
}

fn invoice(store: &ObjectStore, customer: &ObjectRef, number: i64) -> Result<ObjectRef> {
    let invoice = store.create_transient_instance("Invoice")?;
    invoice.set_value("number", number)?;
    invoice.set_reference("customer", Some(customer.clone()))?;
    for (description, amount) in [("consulting", 1200.0), ("travel", 310.5)] {
        let line = store.create_aggregated_instance(&invoice, "lines")?;
        line.set_value("description", description)?;
        line.set_value("amount", amount)?;
    }
    Ok(invoice)
}

fn walkthrough(backend: &str, store: &ObjectStore) -> Result<()> {
    let span = tracing::info_span!("walkthrough", backend);
    let _entered = span.enter();

    let customer = store.create_transient_instance("Customer")?;
    customer.set_value("name", "Ada Lovelace")?;
    let invoice = invoice(store, &customer, 1001)?;
    store.execute(
        "demo",
        vec![
            Command::Create(customer.clone()),
            Command::Create(invoice.clone()),
        ],
    )?;
    let oid = invoice.oid().context("invoice has no identity")?;
    tracing::info!(%oid, "created invoice");

    customer.set_value("email", "ada@example.org")?;
    store.execute("demo", vec![Command::Save(customer.clone())])?;
    let version = customer.version().map(|v| v.sequence());
    tracing::info!(customer = %customer.title(), ?version, "saved customer");

    let found = store.get_instances(&PersistenceQuery::find_by_title("Customer", "ada"))?;
    tracing::info!(matches = found.len(), "title query");

    let loaded = store
        .get_object(&oid, Some("Invoice"))?
        .context("invoice disappeared")?;
    for line in loaded.collection("lines")? {
        let description = line.value("description")?;
        let amount = line.value("amount")?;
        tracing::info!(?description, ?amount, "invoice line");
    }

    store.execute("demo", vec![Command::Destroy(invoice)])?;
    anyhow::ensure!(store.get_object(&oid, None)?.is_none(), "{oid} still stored");
    tracing::info!(%oid, "destroyed invoice");
    Ok(())
}

fn main() -> Result<()> {
    init_tracing();

    let memory = open_store(Arc::new(MemoryConnectionFactory::new(MemoryDatabase::new())))?;
    walkthrough("memory", &memory)?;
    memory.shutdown()?;

    let dir = tempfile::tempdir()?;
    let config = StoreConfig::default();
    let server = FileServer::open(dir.path(), &config)?;
    let handle = server.serve(TcpListener::bind("127.0.0.1:0")?)?;
    let file = open_store(Arc::new(FileConnectionFactory::tcp(
        handle.local_addr(),
        config,
    )))?;
    walkthrough("file", &file)?;
    file.shutdown()?;
    handle.stop()?;
    Ok(())
}
