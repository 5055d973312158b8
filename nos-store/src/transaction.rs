//! 事务与执行器
//!
//! 状态机：`Idle -> Started -> {Committed | Aborted}`，终态之后的 `abort`/`commit`
//! 返回 `TransactionAlreadyComplete`。
//!
//! 执行器从连接池借出一个连接，开启事务后按提交顺序执行命令；第一个失败即停止、
//! 回滚并撤销内存修改，连接无论成败恰好归还一次。本层不做任何重试。
//!
use crate::command::{Command, ExecutionContext};
use crate::pool::{ConnectionPool, PooledConnection};
use crate::runtime::StoreRuntime;
use nos_domain::error::{StoreError, StoreResult};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Idle,
    Started,
    Committed,
    Aborted,
}

impl TransactionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransactionState::Committed | TransactionState::Aborted)
    }
}

/// 一次工作单元：作者与待执行的命令
#[derive(Debug)]
pub struct Transaction {
    id: Uuid,
    author: String,
    state: TransactionState,
    commands: Vec<Command>,
}

impl Transaction {
    pub fn new(author: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            author: author.into(),
            state: TransactionState::Idle,
            commands: Vec::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn author(&self) -> &str {
        &self.author
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    fn ensure_open(&self) -> StoreResult<()> {
        if self.state.is_terminal() {
            return Err(StoreError::TransactionAlreadyComplete {
                id: self.id.to_string(),
            });
        }
        Ok(())
    }

    pub fn start(&mut self) -> StoreResult<()> {
        self.ensure_open()?;
        self.state = TransactionState::Started;
        Ok(())
    }

    pub fn add_command(&mut self, command: Command) -> StoreResult<()> {
        self.ensure_open()?;
        if self.state == TransactionState::Idle {
            self.state = TransactionState::Started;
        }
        self.commands.push(command);
        Ok(())
    }

    /// 放弃尚未提交的命令
    pub fn abort(&mut self) -> StoreResult<()> {
        self.ensure_open()?;
        self.commands.clear();
        self.state = TransactionState::Aborted;
        tracing::debug!(target: "nos::txn", id = %self.id, "transaction abandoned");
        Ok(())
    }

    fn take_commands(&mut self) -> Vec<Command> {
        std::mem::take(&mut self.commands)
    }
}

pub struct TransactionExecutor {
    pool: Arc<ConnectionPool>,
    runtime: Arc<StoreRuntime>,
}

impl TransactionExecutor {
    pub fn new(pool: Arc<ConnectionPool>, runtime: Arc<StoreRuntime>) -> Self {
        Self { pool, runtime }
    }

    /// 借出连接执行整个事务并归还
    pub fn commit(&self, txn: &mut Transaction) -> StoreResult<()> {
        txn.ensure_open()?;
        let mut conn = match self.pool.acquire() {
            Ok(conn) => conn,
            Err(e) => {
                txn.take_commands();
                txn.state = TransactionState::Aborted;
                tracing::warn!(target: "nos::txn", id = %txn.id, error = %e, "no connection; transaction aborted");
                return Err(e);
            }
        };
        let result = self.commit_on(&mut conn, txn);
        self.pool.release(conn);
        result
    }

    /// 在调用方持有的连接上执行
    ///
    /// 连接已处于外层事务中时返回 `IllegalState`，事务保持 `Started`、命令原样保留；
    /// 外层事务结束后可在同一连接上再次提交。
    pub fn commit_on(&self, conn: &mut PooledConnection, txn: &mut Transaction) -> StoreResult<()> {
        txn.ensure_open()?;
        if conn.in_transaction() {
            return Err(StoreError::illegal_state(format!(
                "connection {} is already inside a transaction (depth {}); transaction {} not run",
                conn.id(),
                conn.depth(),
                txn.id
            )));
        }
        let commands = txn.take_commands();
        let count = commands.len();
        tracing::debug!(target: "nos::txn", id = %txn.id, author = %txn.author, commands = count, "executing transaction");

        if let Err(e) = conn.start_transaction() {
            txn.state = TransactionState::Aborted;
            return Err(e);
        }

        let mut ctx = ExecutionContext::new(&self.runtime, conn, &txn.author);
        let mut failure = None;
        for (index, command) in commands.into_iter().enumerate() {
            let description = command.to_string();
            if let Err(e) = command.execute(&mut ctx) {
                failure = Some((index, description, e));
                break;
            }
        }
        let outcome = ctx.into_outcome();

        if let Some((index, command, e)) = failure {
            if let Err(rollback) = conn.abort_transaction() {
                tracing::warn!(target: "nos::txn", id = %txn.id, error = %rollback, "rollback failed");
            }
            outcome.rollback();
            txn.state = TransactionState::Aborted;
            tracing::warn!(target: "nos::txn", id = %txn.id, index, %command, error = %e, "transaction aborted");
            return Err(e);
        }

        if let Err(e) = conn.end_transaction() {
            outcome.rollback();
            txn.state = TransactionState::Aborted;
            tracing::warn!(target: "nos::txn", id = %txn.id, error = %e, "commit failed; transaction aborted");
            return Err(e);
        }

        let cache = self.runtime.cache();
        for object in &outcome.created {
            cache.reconcile(object);
        }
        for object in &outcome.destroyed {
            if let Some(oid) = object.oid() {
                cache.remove(&oid);
            }
        }
        txn.state = TransactionState::Committed;
        tracing::info!(target: "nos::txn", id = %txn.id, commands = count, "transaction committed");
        Ok(())
    }
}
