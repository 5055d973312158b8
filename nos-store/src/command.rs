//! 持久化命令
//!
//! 创建、保存、销毁三种命令，在同一连接、同一事务内按提交顺序执行，每个命令只能执行一次。
//! 执行过程中对内存对象所做的修改（标识提升、版本、解析状态）记入撤销日志，
//! 事务中止时按逆序恢复，使内存对象与存储重新一致。
//!
use crate::pool::PooledConnection;
use crate::runtime::{MappingSession, StoreRuntime};
use nos_domain::adapter::{ObjectRef, ResolveState};
use nos_domain::error::{StoreError, StoreResult};
use nos_domain::key::PrimaryKey;
use nos_domain::mapping::StoredRecord;
use nos_domain::version::Version;
use std::fmt;

/// 针对一个根对象的写命令
///
/// 命令在执行时被消费，同一条命令不能在两个事务中重复执行，因此不可复制：
///
/// ```compile_fail
/// fn duplicate<T: Clone>(command: &T) -> T {
///     command.clone()
/// }
/// fn check(command: &nos_store::Command) -> nos_store::Command {
///     duplicate(command)
/// }
/// ```
#[derive(Debug)]
pub enum Command {
    Create(ObjectRef),
    Save(ObjectRef),
    Destroy(ObjectRef),
}

impl Command {
    pub fn object(&self) -> &ObjectRef {
        match self {
            Command::Create(o) | Command::Save(o) | Command::Destroy(o) => o,
        }
    }

    pub fn execute(self, ctx: &mut ExecutionContext<'_>) -> StoreResult<()> {
        match self {
            Command::Create(object) => create(object, ctx),
            Command::Save(object) => save(object, ctx),
            Command::Destroy(object) => destroy(object, ctx),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (verb, object) = match self {
            Command::Create(o) => ("create", o),
            Command::Save(o) => ("save", o),
            Command::Destroy(o) => ("destroy", o),
        };
        match object.oid() {
            Some(oid) => write!(f, "{verb} {oid}"),
            None => write!(f, "{verb} {}(aggregated)", object.type_name()),
        }
    }
}

/// 撤销动作
#[derive(Debug)]
pub(crate) enum Undo {
    Promotion(ObjectRef),
    Version(ObjectRef, Option<Version>),
    State(ObjectRef, ResolveState),
}

impl Undo {
    fn apply(self) {
        match self {
            Undo::Promotion(object) => {
                object.revert_promotion();
            }
            Undo::Version(object, version) => object.set_version(version),
            Undo::State(object, state) => object.set_resolve_state(state),
        }
    }
}

/// 已执行命令的结果，供提交后对账或中止后撤销
#[derive(Debug, Default)]
pub(crate) struct Outcome {
    pub(crate) undo: Vec<Undo>,
    pub(crate) created: Vec<ObjectRef>,
    pub(crate) destroyed: Vec<ObjectRef>,
}

impl Outcome {
    pub(crate) fn rollback(self) {
        for action in self.undo.into_iter().rev() {
            action.apply();
        }
    }
}

/// 命令执行上下文：当前连接、作者与撤销日志
pub struct ExecutionContext<'a> {
    runtime: &'a StoreRuntime,
    conn: &'a mut PooledConnection,
    author: &'a str,
    outcome: Outcome,
}

impl<'a> ExecutionContext<'a> {
    pub fn new(runtime: &'a StoreRuntime, conn: &'a mut PooledConnection, author: &'a str) -> Self {
        Self {
            runtime,
            conn,
            author,
            outcome: Outcome::default(),
        }
    }

    pub(crate) fn into_outcome(self) -> Outcome {
        self.outcome
    }

    fn set_version(&mut self, object: &ObjectRef, version: Version) {
        self.outcome
            .undo
            .push(Undo::Version(object.clone(), object.version()));
        object.set_version(Some(version));
    }

    fn set_state(&mut self, object: &ObjectRef, state: ResolveState) {
        self.outcome
            .undo
            .push(Undo::State(object.clone(), object.resolve_state()));
        object.set_resolve_state(state);
    }

    fn record(&mut self, object: &ObjectRef, key: PrimaryKey, version: Version) -> StoreResult<StoredRecord> {
        let mapping = self.runtime.mappings().get_mapping(object.type_name())?;
        let data = {
            let mut session = MappingSession::writing(self.runtime, &mut *self.conn);
            mapping.decompose(object, &mut session)?
        };
        let title = object.title();
        Ok(StoredRecord::builder()
            .type_name(object.type_name())
            .key(key)
            .version(version)
            .maybe_title((!title.is_empty()).then_some(title))
            .data(data)
            .build())
    }
}

fn require_root(object: &ObjectRef) -> StoreResult<()> {
    if object.is_aggregated() {
        return Err(StoreError::NotIndependentlyPersistable {
            type_name: object.type_name().to_string(),
        });
    }
    Ok(())
}

fn create(object: ObjectRef, ctx: &mut ExecutionContext<'_>) -> StoreResult<()> {
    require_root(&object)?;
    let Some(oid) = object.oid().filter(|oid| oid.is_transient()) else {
        return Err(StoreError::illegal_state(format!(
            "cannot create {object:?}: already persistent"
        )));
    };
    let type_name = object.type_name().to_string();
    ctx.runtime.mappings().get_mapping(&type_name)?;

    let id = ctx
        .runtime
        .generator()
        .next_persistent_identifier(&mut *ctx.conn)?;
    let key = PrimaryKey::from_sequence(ctx.runtime.config().key_kind(), id)?;
    let persistent = object.promote(key.clone())?;
    ctx.outcome.undo.push(Undo::Promotion(object.clone()));
    tracing::debug!(target: "nos::store", from = %oid, to = %persistent, "promoted oid");

    if !ctx.conn.has_table(&type_name)? {
        ctx.conn.create_table(&type_name)?;
    }
    let version = Version::new(ctx.author);
    let record = ctx.record(&object, key, version.clone())?;
    ctx.conn.insert(&record)?;

    ctx.set_version(&object, version);
    ctx.set_state(&object, ResolveState::Resolved);
    ctx.outcome.created.push(object);
    Ok(())
}

fn save(object: ObjectRef, ctx: &mut ExecutionContext<'_>) -> StoreResult<()> {
    require_root(&object)?;
    let Some(oid) = object.oid().filter(|oid| oid.is_persistent()) else {
        return Err(StoreError::illegal_state(format!(
            "cannot save {object:?}: not persistent"
        )));
    };
    let Some(current) = object.version() else {
        return Err(StoreError::Precondition {
            reason: format!("{oid} has no version; it was never stored"),
        });
    };

    let next = current.next(ctx.author)?;
    let record = ctx.record(&object, oid.key().clone(), next.clone())?;
    // 版本检查与写入在同一个存储操作中完成
    ctx.conn.update(&record, &current)?;
    ctx.set_version(&object, next);
    Ok(())
}

fn destroy(object: ObjectRef, ctx: &mut ExecutionContext<'_>) -> StoreResult<()> {
    require_root(&object)?;
    let Some(oid) = object.oid().filter(|oid| oid.is_persistent()) else {
        return Err(StoreError::illegal_state(format!(
            "cannot destroy {object:?}: not persistent"
        )));
    };
    ctx.runtime.mappings().get_mapping(oid.type_name())?;

    ctx.conn
        .delete(oid.type_name(), oid.key(), object.version().as_ref())?;
    ctx.set_state(&object, ResolveState::Destroyed);
    ctx.outcome.destroyed.push(object);
    Ok(())
}
