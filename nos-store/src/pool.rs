//! 连接池（ConnectionPool）
//!
//! - 有空闲连接则复用，否则打开新连接加入池中；池只增长，关闭时整体释放；
//! - 连接按值借出，归还时若仍在事务中则回滚；
//! - 每个连接记录事务嵌套深度，只有最外层的开始/结束真正落到存储。
//!
use crate::connection::{Connection, ConnectionFactory};
use nos_domain::error::{StoreError, StoreResult};
use nos_domain::generator::{Sequence, SequenceSource};
use parking_lot::Mutex;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

/// 借出的连接
pub struct PooledConnection {
    id: u64,
    conn: Box<dyn Connection>,
    depth: u32,
}

impl PooledConnection {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn in_transaction(&self) -> bool {
        self.depth > 0
    }

    pub fn start_transaction(&mut self) -> StoreResult<()> {
        if self.depth == 0 {
            self.conn.begin()?;
        }
        self.depth += 1;
        Ok(())
    }

    /// 最外层结束时提交；提交失败则回滚后返回原错误
    pub fn end_transaction(&mut self) -> StoreResult<()> {
        if self.depth == 0 {
            return Err(StoreError::illegal_state(format!(
                "connection {} has no open transaction",
                self.id
            )));
        }
        self.depth -= 1;
        if self.depth > 0 {
            return Ok(());
        }
        if let Err(e) = self.conn.commit() {
            if let Err(rollback) = self.conn.rollback() {
                tracing::warn!(target: "nos::pool", id = self.id, error = %rollback, "rollback after failed commit also failed");
            }
            return Err(e);
        }
        Ok(())
    }

    /// 放弃整个（含外层）事务
    pub fn abort_transaction(&mut self) -> StoreResult<()> {
        if self.depth == 0 {
            return Ok(());
        }
        self.depth = 0;
        self.conn.rollback()
    }
}

impl Deref for PooledConnection {
    type Target = dyn Connection;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref()
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut()
    }
}

impl SequenceSource for PooledConnection {
    fn reserve(&mut self, sequence: Sequence, size: u64) -> StoreResult<u64> {
        self.conn.reserve_sequence(sequence, size)
    }
}

/// 池状态快照
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    /// 打开过的连接总数
    pub size: usize,
    pub idle: usize,
    pub in_use: usize,
    /// 累计归还次数
    pub releases: u64,
}

#[derive(Default)]
struct PoolState {
    idle: Vec<PooledConnection>,
    next_id: u64,
    stats: PoolStats,
    closed: bool,
}

pub struct ConnectionPool {
    factory: Arc<dyn ConnectionFactory>,
    state: Mutex<PoolState>,
}

impl ConnectionPool {
    pub fn new(factory: Arc<dyn ConnectionFactory>) -> Self {
        Self {
            factory,
            state: Mutex::new(PoolState::default()),
        }
    }

    pub fn acquire(&self) -> StoreResult<PooledConnection> {
        let id = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(StoreError::illegal_state("connection pool is shut down"));
            }
            if let Some(conn) = state.idle.pop() {
                state.stats.idle -= 1;
                state.stats.in_use += 1;
                return Ok(conn);
            }
            state.next_id += 1;
            state.next_id
        };

        // 打开连接可能阻塞，不持有池锁
        let conn = self.factory.open().map_err(|e| match e {
            StoreError::StoreUnavailable { .. } | StoreError::StoreTimeout { .. } => e,
            other => StoreError::unavailable(format!(
                "cannot open connection to {}: {other}",
                self.factory.describe()
            )),
        })?;
        let mut pooled = PooledConnection {
            id,
            conn,
            depth: 0,
        };

        let mut state = self.state.lock();
        if state.closed {
            drop(state);
            let _ = pooled.conn.close();
            return Err(StoreError::illegal_state("connection pool is shut down"));
        }
        state.stats.size += 1;
        state.stats.in_use += 1;
        tracing::debug!(target: "nos::pool", id, size = state.stats.size, "opened pooled connection");
        Ok(pooled)
    }

    /// 归还连接；未结束的事务被回滚
    pub fn release(&self, mut conn: PooledConnection) {
        if conn.in_transaction() {
            tracing::warn!(target: "nos::pool", id = conn.id, depth = conn.depth, "released connection with open transaction; rolling back");
            if let Err(e) = conn.abort_transaction() {
                tracing::warn!(target: "nos::pool", id = conn.id, error = %e, "rollback on release failed");
            }
        }

        let mut state = self.state.lock();
        state.stats.releases += 1;
        state.stats.in_use = state.stats.in_use.saturating_sub(1);
        if state.closed {
            drop(state);
            if let Err(e) = conn.conn.close() {
                tracing::warn!(target: "nos::pool", id = conn.id, error = %e, "close after shutdown failed");
            }
            return;
        }
        state.stats.idle += 1;
        state.idle.push(conn);
    }

    /// 关闭所有空闲连接；之后的 `acquire` 失败
    pub fn shutdown(&self) -> StoreResult<()> {
        let idle = {
            let mut state = self.state.lock();
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            state.stats.idle = 0;
            std::mem::take(&mut state.idle)
        };

        let count = idle.len();
        let mut first_error = None;
        for mut conn in idle {
            if let Err(e) = conn.conn.close() {
                tracing::warn!(target: "nos::pool", id = conn.id, error = %e, "close failed");
                first_error.get_or_insert(e);
            }
        }
        tracing::info!(target: "nos::pool", closed = count, "connection pool shut down");
        first_error.map_or(Ok(()), Err)
    }

    pub fn is_shut_down(&self) -> bool {
        self.state.lock().closed
    }

    pub fn stats(&self) -> PoolStats {
        self.state.lock().stats
    }
}
