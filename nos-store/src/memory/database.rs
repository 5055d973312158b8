use crate::connection::Connection;
use nos_domain::error::{StoreError, StoreResult};
use nos_domain::generator::Sequence;
use nos_domain::key::PrimaryKey;
use nos_domain::mapping::StoredRecord;
use nos_domain::version::Version;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

type Table = BTreeMap<PrimaryKey, StoredRecord>;

#[derive(Default)]
struct MemoryState {
    tables: HashMap<String, Table>,
    sequences: HashMap<Sequence, u64>,
    /// 首次使用时创建
    services: Option<BTreeMap<String, String>>,
}

/// 进程内的关系型存储，可被多个连接（及多个对象存储）共享
pub struct MemoryDatabase {
    state: Mutex<MemoryState>,
    available: AtomicBool,
    reservations: AtomicU64,
}

impl MemoryDatabase {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(MemoryState::default()),
            available: AtomicBool::new(true),
            reservations: AtomicU64::new(0),
        })
    }

    /// 置为不可用后，打开新连接失败
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    pub fn connect(self: &Arc<Self>) -> StoreResult<MemoryConnection> {
        if !self.is_available() {
            return Err(StoreError::unavailable("memory database is offline"));
        }
        Ok(MemoryConnection {
            db: Arc::clone(self),
            pending: None,
            closed: false,
        })
    }

    /// 序列预取（往返）次数
    pub fn reservations(&self) -> u64 {
        self.reservations.load(Ordering::SeqCst)
    }

    pub fn has_committed_table(&self, type_name: &str) -> bool {
        self.state.lock().tables.contains_key(type_name)
    }

    /// 已提交的记录
    pub fn committed(&self, type_name: &str, key: &PrimaryKey) -> Option<StoredRecord> {
        self.state
            .lock()
            .tables
            .get(type_name)
            .and_then(|t| t.get(key))
            .cloned()
    }

    pub fn committed_count(&self, type_name: &str) -> usize {
        self.state
            .lock()
            .tables
            .get(type_name)
            .map_or(0, |t| t.len())
    }
}

#[derive(Debug, Clone)]
enum Write {
    CreateTable(String),
    Insert(StoredRecord),
    Update {
        record: StoredRecord,
        expected: Version,
    },
    Delete {
        type_name: String,
        key: PrimaryKey,
        expected: Option<Version>,
    },
}

impl Write {
    fn type_name(&self) -> &str {
        match self {
            Write::CreateTable(t) => t,
            Write::Insert(r) | Write::Update { record: r, .. } => r.type_name(),
            Write::Delete { type_name, .. } => type_name,
        }
    }
}

fn reference(type_name: &str, key: &PrimaryKey) -> String {
    format!("{type_name}@{key}")
}

fn check_version(current: &StoredRecord, expected: &Version) -> StoreResult<()> {
    let actual = current.version().map_or(0, Version::sequence);
    if actual != expected.sequence() {
        return Err(StoreError::OptimisticLock {
            reference: current.reference_string(),
            expected: expected.sequence(),
            actual,
        });
    }
    Ok(())
}

fn apply(tables: &mut HashMap<String, Table>, write: &Write) -> StoreResult<()> {
    if let Write::CreateTable(type_name) = write {
        tables.entry(type_name.clone()).or_default();
        return Ok(());
    }

    let type_name = write.type_name();
    let Some(table) = tables.get_mut(type_name) else {
        return Err(StoreError::illegal_state(format!("no table for {type_name}")));
    };
    match write {
        Write::CreateTable(_) => {}
        Write::Insert(record) => {
            if table.contains_key(record.key()) {
                return Err(StoreError::DuplicateKey {
                    reference: record.reference_string(),
                });
            }
            table.insert(record.key().clone(), record.clone());
        }
        Write::Update { record, expected } => {
            let current = table
                .get(record.key())
                .ok_or_else(|| StoreError::ObjectNotFound {
                    reference: record.reference_string(),
                })?;
            check_version(current, expected)?;
            table.insert(record.key().clone(), record.clone());
        }
        Write::Delete {
            type_name,
            key,
            expected,
        } => {
            let current = table.get(key).ok_or_else(|| StoreError::ObjectNotFound {
                reference: reference(type_name, key),
            })?;
            if let Some(expected) = expected {
                check_version(current, expected)?;
            }
            table.remove(key);
        }
    }
    Ok(())
}

/// 连接：事务内的写入先暂存，提交时在数据库锁内重新校验并一次性应用
pub struct MemoryConnection {
    db: Arc<MemoryDatabase>,
    pending: Option<Vec<Write>>,
    closed: bool,
}

impl MemoryConnection {
    fn ensure_open(&self) -> StoreResult<()> {
        if self.closed {
            return Err(StoreError::illegal_state("memory connection is closed"));
        }
        Ok(())
    }

    /// 已提交数据叠加本连接暂存写入后的单表视图
    fn view(&self, type_name: &str) -> HashMap<String, Table> {
        let mut view = HashMap::new();
        if let Some(table) = self.db.state.lock().tables.get(type_name) {
            view.insert(type_name.to_string(), table.clone());
        }
        for write in self.pending.iter().flatten() {
            if write.type_name() == type_name {
                // 暂存时已校验过
                let _ = apply(&mut view, write);
            }
        }
        view
    }

    fn write(&mut self, write: Write) -> StoreResult<()> {
        self.ensure_open()?;
        if self.pending.is_none() {
            return apply(&mut self.db.state.lock().tables, &write);
        }

        let mut view = self.view(write.type_name());
        apply(&mut view, &write)?;
        if let Some(pending) = self.pending.as_mut() {
            pending.push(write);
        }
        Ok(())
    }
}

impl Connection for MemoryConnection {
    fn begin(&mut self) -> StoreResult<()> {
        self.ensure_open()?;
        if self.pending.is_some() {
            return Err(StoreError::illegal_state("transaction already started"));
        }
        self.pending = Some(Vec::new());
        Ok(())
    }

    fn commit(&mut self) -> StoreResult<()> {
        self.ensure_open()?;
        let Some(pending) = self.pending.take() else {
            return Err(StoreError::illegal_state("no transaction to commit"));
        };

        let mut state = self.db.state.lock();
        let mut work: HashMap<String, Table> = HashMap::new();
        for write in &pending {
            let type_name = write.type_name();
            if !work.contains_key(type_name) {
                if let Some(table) = state.tables.get(type_name) {
                    work.insert(type_name.to_string(), table.clone());
                }
            }
        }
        for write in &pending {
            apply(&mut work, write)?;
        }
        state.tables.extend(work);
        Ok(())
    }

    fn rollback(&mut self) -> StoreResult<()> {
        self.pending = None;
        Ok(())
    }

    fn has_table(&mut self, type_name: &str) -> StoreResult<bool> {
        self.ensure_open()?;
        Ok(self.view(type_name).contains_key(type_name))
    }

    fn create_table(&mut self, type_name: &str) -> StoreResult<()> {
        self.write(Write::CreateTable(type_name.to_string()))
    }

    fn insert(&mut self, record: &StoredRecord) -> StoreResult<()> {
        self.write(Write::Insert(record.clone()))
    }

    fn update(&mut self, record: &StoredRecord, expected: &Version) -> StoreResult<()> {
        self.write(Write::Update {
            record: record.clone(),
            expected: expected.clone(),
        })
    }

    fn delete(
        &mut self,
        type_name: &str,
        key: &PrimaryKey,
        expected: Option<&Version>,
    ) -> StoreResult<()> {
        self.write(Write::Delete {
            type_name: type_name.to_string(),
            key: key.clone(),
            expected: expected.cloned(),
        })
    }

    fn select(&mut self, type_name: &str, key: &PrimaryKey) -> StoreResult<Option<StoredRecord>> {
        self.ensure_open()?;
        Ok(self
            .view(type_name)
            .get(type_name)
            .and_then(|t| t.get(key))
            .cloned())
    }

    fn select_all(&mut self, type_name: &str) -> StoreResult<Vec<StoredRecord>> {
        self.ensure_open()?;
        Ok(self
            .view(type_name)
            .remove(type_name)
            .map(|t| t.into_values().collect())
            .unwrap_or_default())
    }

    fn count(&mut self, type_name: &str) -> StoreResult<u64> {
        self.ensure_open()?;
        Ok(self
            .view(type_name)
            .get(type_name)
            .map_or(0, |t| t.len() as u64))
    }

    fn reserve_sequence(&mut self, sequence: Sequence, size: u64) -> StoreResult<u64> {
        self.ensure_open()?;
        self.db.reservations.fetch_add(1, Ordering::SeqCst);
        let mut state = self.db.state.lock();
        let counter = state.sequences.entry(sequence).or_default();
        let current = *counter;
        *counter = current
            .checked_add(size)
            .ok_or_else(|| StoreError::SequenceExhausted {
                sequence: sequence.name().to_string(),
                next: current,
                limit: u64::MAX,
            })?;
        Ok(*counter)
    }

    fn service(&mut self, name: &str) -> StoreResult<Option<String>> {
        self.ensure_open()?;
        let mut state = self.db.state.lock();
        let services = state.services.get_or_insert_with(|| {
            tracing::debug!(target: "nos::store", "created service table");
            BTreeMap::new()
        });
        Ok(services.get(name).cloned())
    }

    fn save_service(&mut self, name: &str, reference: &str) -> StoreResult<()> {
        self.ensure_open()?;
        let mut state = self.db.state.lock();
        state
            .services
            .get_or_insert_with(BTreeMap::new)
            .insert(name.to_string(), reference.to_string());
        Ok(())
    }

    fn close(&mut self) -> StoreResult<()> {
        self.pending = None;
        self.closed = true;
        Ok(())
    }
}
