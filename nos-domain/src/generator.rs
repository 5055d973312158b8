//! 标识生成器（IdentifierGenerator）
//!
//! - 临时标识：进程内计数器，无 I/O；
//! - 持久标识与聚合内局部标识：按批次从存储预取（一次序列自增往返），本地逐个发放；
//! - 三种操作共享同一互斥域，补批与自增是同一个临界区。
//!
//! 补批的往返在持锁期间完成，高竞争下调用方会在补批处串行化，这是已知的扩展上限。
//!
use crate::error::{StoreError, StoreResult};
use parking_lot::Mutex;
use std::fmt;

/// 存储侧的序列命名空间
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Sequence {
    /// 全局唯一的对象标识
    Object,
    /// 集合/聚合内部的局部标识
    Aggregate,
}

impl Sequence {
    pub fn name(&self) -> &'static str {
        match self {
            Sequence::Object => "object-ids",
            Sequence::Aggregate => "aggregate-ids",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "object-ids" => Some(Sequence::Object),
            "aggregate-ids" => Some(Sequence::Aggregate),
            _ => None,
        }
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// 批次来源：把序列推进 `size`，返回本批最后一个可用值（含）
pub trait SequenceSource {
    fn reserve(&mut self, sequence: Sequence, size: u64) -> StoreResult<u64>;
}

impl<T> SequenceSource for &mut T
where
    T: SequenceSource + ?Sized,
{
    fn reserve(&mut self, sequence: Sequence, size: u64) -> StoreResult<u64> {
        (**self).reserve(sequence, size)
    }
}

#[derive(Debug, Default)]
struct Batch {
    /// 下一个待发放的值
    next: u64,
    /// 本批上界（含）；0 表示尚未取过批次
    limit: u64,
}

impl Batch {
    fn take(
        &mut self,
        sequence: Sequence,
        size: u64,
        source: &mut dyn SequenceSource,
    ) -> StoreResult<u64> {
        if self.limit == 0 || self.next > self.limit {
            let high = source.reserve(sequence, size)?;
            let low = high
                .checked_sub(size - 1)
                .filter(|low| *low > self.limit && *low > 0)
                .ok_or_else(|| StoreError::SequenceExhausted {
                    sequence: sequence.name().to_string(),
                    next: self.next,
                    limit: high,
                })?;
            tracing::debug!(target: "nos::ids", %sequence, low, high, "reserved id batch");
            self.next = low;
            self.limit = high;
        }

        if self.next > self.limit {
            return Err(StoreError::SequenceExhausted {
                sequence: sequence.name().to_string(),
                next: self.next,
                limit: self.limit,
            });
        }

        let id = self.next;
        self.next += 1;
        Ok(id)
    }
}

#[derive(Debug, Default)]
struct GeneratorState {
    transient: u64,
    objects: Batch,
    aggregates: Batch,
}

/// 标识生成器，可在多线程间共享
#[derive(Debug)]
pub struct IdentifierGenerator {
    batch_size: u64,
    state: Mutex<GeneratorState>,
}

impl IdentifierGenerator {
    pub fn new(batch_size: u64) -> StoreResult<Self> {
        if batch_size == 0 {
            return Err(StoreError::Configuration {
                reason: "id batch size must be at least 1".to_string(),
            });
        }
        Ok(Self {
            batch_size,
            state: Mutex::new(GeneratorState::default()),
        })
    }

    pub fn batch_size(&self) -> u64 {
        self.batch_size
    }

    /// 递增的临时序号（从 1 开始）
    pub fn next_transient_identifier(&self) -> u64 {
        let mut state = self.state.lock();
        state.transient += 1;
        state.transient
    }

    pub fn next_persistent_identifier(&self, source: &mut dyn SequenceSource) -> StoreResult<u64> {
        let mut state = self.state.lock();
        state
            .objects
            .take(Sequence::Object, self.batch_size, source)
    }

    pub fn next_aggregate_local_identifier(
        &self,
        source: &mut dyn SequenceSource,
    ) -> StoreResult<u64> {
        let mut state = self.state.lock();
        state
            .aggregates
            .take(Sequence::Aggregate, self.batch_size, source)
    }
}
