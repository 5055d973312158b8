//! 对象存储
//!
//! 连接池、持久化命令与事务执行、对象缓存、查询，以及内存与文件两种存储后端，
//! 通过 `ObjectStore` 门面对外提供。
//!
pub mod cache;
pub mod command;
pub mod config;
pub mod connection;
pub mod file;
pub mod memory;
pub mod object_store;
pub mod pool;
pub mod query;
pub mod runtime;
pub mod transaction;

pub use command::Command;
pub use config::{EncryptionConfig, StoreConfig};
pub use object_store::ObjectStore;
pub use query::PersistenceQuery;
pub use transaction::{Transaction, TransactionState};
