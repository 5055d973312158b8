//! 内存关系型后端
//!
//! 每个类型一张表，事务内写入暂存并在提交时重新做版本检查；序列不参与事务。
//! 主要用于测试与示例，也可作为多个对象存储共享的同一份“数据库”。
//!
mod database;

pub use database::{MemoryConnection, MemoryDatabase};

use crate::connection::{Connection, ConnectionFactory};
use nos_domain::error::StoreResult;
use std::sync::Arc;

pub struct MemoryConnectionFactory {
    db: Arc<MemoryDatabase>,
}

impl MemoryConnectionFactory {
    pub fn new(db: Arc<MemoryDatabase>) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Arc<MemoryDatabase> {
        &self.db
    }
}

impl ConnectionFactory for MemoryConnectionFactory {
    fn open(&self) -> StoreResult<Box<dyn Connection>> {
        Ok(Box::new(self.db.connect()?))
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}
