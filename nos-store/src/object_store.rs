//! 对象存储门面（ObjectStore）
//!
//! 对外的唯一入口：按标识取对象、延迟解析属性、查询实例、服务表，以及提交命令批次。
//! 读取操作各自借出一个连接并在返回前归还；写入统一经过 `TransactionExecutor`。
//!
//! “对象不存在”以 `Ok(None)` 表示，与属性为空（`FieldValue::Scalar(None)` 等）区分。
//!
use crate::command::Command;
use crate::config::StoreConfig;
use crate::connection::ConnectionFactory;
use crate::pool::{ConnectionPool, PoolStats, PooledConnection};
use crate::query::{self, NamedQuery, PersistenceQuery};
use crate::runtime::{MappingSession, StoreRuntime};
use crate::transaction::{Transaction, TransactionExecutor};
use bon::bon;
use dashmap::DashMap;
use nos_domain::adapter::{FieldValue, ObjectAdapter, ObjectRef, ResolveState};
use nos_domain::error::{StoreError, StoreResult};
use nos_domain::metamodel::{FieldKind, SpecificationLoader};
use nos_domain::mapping::StoredRecord;
use nos_domain::oid::Oid;
use std::sync::Arc;

pub struct ObjectStore {
    runtime: Arc<StoreRuntime>,
    pool: Arc<ConnectionPool>,
    executor: TransactionExecutor,
    named_queries: DashMap<String, Arc<dyn NamedQuery>>,
}

#[bon]
impl ObjectStore {
    /// 配置在此处校验，非法配置不会拖到首次使用才暴露
    #[builder]
    pub fn new(
        #[builder(default)] config: StoreConfig,
        specifications: Arc<dyn SpecificationLoader>,
        connections: Arc<dyn ConnectionFactory>,
    ) -> StoreResult<Self> {
        let runtime = Arc::new(StoreRuntime::new(config, specifications)?);
        let pool = Arc::new(ConnectionPool::new(connections));
        let executor = TransactionExecutor::new(pool.clone(), runtime.clone());
        Ok(Self {
            runtime,
            pool,
            executor,
            named_queries: DashMap::new(),
        })
    }
}

impl ObjectStore {
    pub fn runtime(&self) -> &StoreRuntime {
        &self.runtime
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    fn with_connection<T>(
        &self,
        f: impl FnOnce(&mut PooledConnection) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let mut conn = self.pool.acquire()?;
        let result = f(&mut conn);
        self.pool.release(conn);
        result
    }

    // --- 实例创建 ---

    /// 新建临时根对象并登记到缓存
    pub fn create_transient_instance(&self, type_name: &str) -> StoreResult<ObjectRef> {
        let spec = self.runtime.specification(type_name)?;
        if spec.is_aggregated() {
            return Err(StoreError::NotIndependentlyPersistable {
                type_name: type_name.to_string(),
            });
        }
        let serial = self.runtime.generator().next_transient_identifier();
        let object = ObjectAdapter::new_transient(spec, Oid::create_transient(type_name, serial));
        self.runtime.cache().add(&object);
        Ok(object)
    }

    /// 新建内嵌于 `parent` 的聚合对象并挂到该属性上
    pub fn create_aggregated_instance(&self, parent: &ObjectRef, field: &str) -> StoreResult<ObjectRef> {
        let Some(field_spec) = parent.specification().field(field) else {
            return Err(StoreError::UnknownField {
                type_name: parent.type_name().to_string(),
                field: field.to_string(),
            });
        };
        let (target, collection) = match field_spec.kind() {
            FieldKind::Reference {
                target,
                aggregated: true,
            } => (target, false),
            FieldKind::Collection {
                element,
                aggregated: true,
            } => (element, true),
            _ => {
                return Err(StoreError::InvalidValue {
                    reason: format!("{}.{field} does not hold aggregated parts", parent.type_name()),
                });
            }
        };

        let child = ObjectAdapter::new_aggregated(self.runtime.specification(target)?, parent, field);
        if collection {
            parent.add_to_collection(field, child.clone())?;
        } else {
            parent.set_reference(field, Some(child.clone()))?;
        }
        Ok(child)
    }

    // --- 事务 ---

    pub fn start_transaction(&self, author: impl Into<String>) -> StoreResult<Transaction> {
        let mut txn = Transaction::new(author);
        txn.start()?;
        Ok(txn)
    }

    pub fn commit(&self, txn: &mut Transaction) -> StoreResult<()> {
        self.executor.commit(txn)
    }

    /// 以单个事务执行一批命令
    pub fn execute(&self, author: &str, commands: Vec<Command>) -> StoreResult<()> {
        let mut txn = self.start_transaction(author)?;
        for command in commands {
            txn.add_command(command)?;
        }
        self.commit(&mut txn)
    }

    // --- 读取 ---

    /// 按标识取对象；存储中不存在时返回 `None`
    pub fn get_object(&self, oid: &Oid, type_hint: Option<&str>) -> StoreResult<Option<ObjectRef>> {
        if let Some(hint) = type_hint {
            if hint != oid.type_name() {
                return Err(StoreError::Precondition {
                    reason: format!("type hint {hint} does not match {oid}"),
                });
            }
        }
        if oid.is_transient() {
            return Ok(self.runtime.cache().get(oid));
        }

        let record = self.with_connection(|conn| conn.select(oid.type_name(), oid.key()))?;
        let Some(record) = record else {
            tracing::debug!(target: "nos::store", %oid, "object not found");
            return Ok(None);
        };
        self.instance(&record).map(Some)
    }

    /// 立即加载占位对象的全部属性；存储中已不存在则为 `ObjectNotFound`
    pub fn resolve_immediately(&self, object: &ObjectRef) -> StoreResult<()> {
        if !object.is_ghost() {
            return Ok(());
        }
        let Some(oid) = object.oid() else {
            return Ok(());
        };
        let record = self.with_connection(|conn| conn.select(oid.type_name(), oid.key()))?;
        let Some(record) = record else {
            return Err(StoreError::ObjectNotFound {
                reference: oid.reference_string(),
            });
        };
        self.load(object, &record)
    }

    /// 解析一个属性：所属对象先解析，单值引用与引用集合的元素各自解析
    pub fn resolve_field(&self, object: &ObjectRef, field: &str) -> StoreResult<FieldValue> {
        self.resolve_immediately(object)?;
        let value = object.field(field)?;
        match &value {
            FieldValue::Reference(Some(target)) => self.resolve_immediately(target)?,
            FieldValue::Collection(elements) => {
                for element in elements.iter().filter(|e| e.is_ghost()) {
                    self.resolve_immediately(element)?;
                }
            }
            _ => {}
        }
        Ok(value)
    }

    pub fn get_instances(&self, query: &PersistenceQuery) -> StoreResult<Vec<ObjectRef>> {
        tracing::debug!(target: "nos::store", %query, "get instances");
        match query {
            PersistenceQuery::FindAll { type_name } => {
                self.runtime.specification(type_name)?;
                self.records(type_name)?
                    .iter()
                    .map(|r| self.instance(r))
                    .collect()
            }
            PersistenceQuery::FindByPattern { type_name, pattern } => {
                let spec = self.runtime.specification(type_name)?;
                query::validate_pattern(&spec, pattern)?;
                let mut found = Vec::new();
                for record in self.records(type_name)? {
                    let object = self.instance(&record)?;
                    if query::pattern_matches(&object, pattern)? {
                        found.push(object);
                    }
                }
                Ok(found)
            }
            PersistenceQuery::FindByTitle { type_name, title } => {
                self.runtime.specification(type_name)?;
                self.records(type_name)?
                    .iter()
                    .filter(|r| query::title_matches(r, title))
                    .map(|r| self.instance(r))
                    .collect()
            }
            PersistenceQuery::Named { name, parameters } => {
                let handler = self
                    .named_queries
                    .get(name)
                    .map(|h| Arc::clone(h.value()))
                    .ok_or_else(|| StoreError::UnsupportedQuery {
                        kind: format!("named query {name}"),
                    })?;
                handler.run(self, parameters)
            }
        }
    }

    pub fn has_instances(&self, type_name: &str) -> StoreResult<bool> {
        self.runtime.specification(type_name)?;
        Ok(self.with_connection(|conn| conn.count(type_name))? > 0)
    }

    pub fn register_named_query(&self, name: impl Into<String>, handler: impl NamedQuery + 'static) {
        self.named_queries.insert(name.into(), Arc::new(handler));
    }

    fn records(&self, type_name: &str) -> StoreResult<Vec<StoredRecord>> {
        self.with_connection(|conn| conn.select_all(type_name))
    }

    /// 记录对应的缓存实例，必要时以记录内容刷新
    fn instance(&self, record: &StoredRecord) -> StoreResult<ObjectRef> {
        let oid = Oid::create_persistent(record.type_name(), record.key().clone());
        let object = self.runtime.ghost(oid)?;
        self.load(&object, record)?;
        Ok(object)
    }

    fn load(&self, object: &ObjectRef, record: &StoredRecord) -> StoreResult<()> {
        let newer = match (object.version(), record.version()) {
            (Some(current), Some(stored)) => stored.is_later_than(&current),
            _ => true,
        };
        if !object.is_ghost() && !newer {
            return Ok(());
        }

        let mapping = self.runtime.mappings().get_mapping(record.type_name())?;
        let session = MappingSession::reading(&self.runtime);
        mapping.recompose(object, record.data(), &session)?;
        object.set_version(record.version().cloned());
        object.set_resolve_state(ResolveState::Resolved);
        tracing::debug!(target: "nos::store", reference = %record.reference_string(), "loaded object");
        Ok(())
    }

    // --- 服务表 ---

    pub fn register_service(&self, name: &str, oid: &Oid) -> StoreResult<()> {
        if !oid.is_persistent() {
            return Err(StoreError::Precondition {
                reason: format!("service {name} must refer to a persistent object, got {oid}"),
            });
        }
        let reference = oid.reference_string();
        self.with_connection(|conn| conn.save_service(name, &reference))?;
        tracing::info!(target: "nos::store", service = name, %reference, "registered service");
        Ok(())
    }

    pub fn get_oid_for_service(&self, name: &str) -> StoreResult<Option<Oid>> {
        let reference = self.with_connection(|conn| conn.service(name))?;
        reference
            .map(|r| Oid::parse_reference(&r, self.runtime.config().key_kind()))
            .transpose()
    }

    /// 关闭连接池；之后的读写均失败
    pub fn shutdown(&self) -> StoreResult<()> {
        self.pool.shutdown()
    }
}
