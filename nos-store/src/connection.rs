//! 存储连接契约
//!
//! 关系型风格的最小连接抽象：事务控制、按类型的表、按主键的增删改查、
//! 序列预取与服务表。所有调用都是同步阻塞的。
//!
use nos_domain::error::StoreResult;
use nos_domain::generator::Sequence;
use nos_domain::key::PrimaryKey;
use nos_domain::mapping::StoredRecord;
use nos_domain::version::Version;

pub trait Connection: Send {
    fn begin(&mut self) -> StoreResult<()>;

    fn commit(&mut self) -> StoreResult<()>;

    fn rollback(&mut self) -> StoreResult<()>;

    fn has_table(&mut self, type_name: &str) -> StoreResult<bool>;

    fn create_table(&mut self, type_name: &str) -> StoreResult<()>;

    /// 主键已存在时返回 `DuplicateKey`
    fn insert(&mut self, record: &StoredRecord) -> StoreResult<()>;

    /// 版本检查与写入是同一个原子操作：存储中的版本与 `expected` 不同则返回 `OptimisticLock`
    fn update(&mut self, record: &StoredRecord, expected: &Version) -> StoreResult<()>;

    fn delete(
        &mut self,
        type_name: &str,
        key: &PrimaryKey,
        expected: Option<&Version>,
    ) -> StoreResult<()>;

    /// 不存在返回 `None`
    fn select(&mut self, type_name: &str, key: &PrimaryKey) -> StoreResult<Option<StoredRecord>>;

    fn select_all(&mut self, type_name: &str) -> StoreResult<Vec<StoredRecord>>;

    fn count(&mut self, type_name: &str) -> StoreResult<u64>;

    /// 把序列推进 `size`，返回本批最后一个值；不受事务回滚影响
    fn reserve_sequence(&mut self, sequence: Sequence, size: u64) -> StoreResult<u64>;

    /// 服务名 -> 引用串；服务表在首次使用时创建
    fn service(&mut self, name: &str) -> StoreResult<Option<String>>;

    fn save_service(&mut self, name: &str, reference: &str) -> StoreResult<()>;

    fn close(&mut self) -> StoreResult<()>;
}

/// 打开新连接，失败时不得返回半初始化的连接
pub trait ConnectionFactory: Send + Sync {
    fn open(&self) -> StoreResult<Box<dyn Connection>>;

    /// 用于日志
    fn describe(&self) -> String;
}
