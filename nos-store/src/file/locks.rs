//! 记录锁管理
//!
//! 读者对记录加共享锁，写者以所有者（一个客户端会话）的身份加排他锁；
//! 同一所有者持有写锁时可以继续读。等待有上限，超时返回 `LockConflict`。
//! 关闭时等待所有未释放的锁排空。
//!
use nos_domain::error::{StoreError, StoreResult};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct RecordLock {
    writer: Option<u64>,
    readers: usize,
}

impl RecordLock {
    fn is_free(&self) -> bool {
        self.writer.is_none() && self.readers == 0
    }
}

#[derive(Default)]
pub struct LockManager {
    records: Mutex<HashMap<String, RecordLock>>,
    released: Condvar,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read(&self, owner: u64, record: &str, timeout: Duration) -> StoreResult<ReadGuard<'_>> {
        let deadline = Instant::now() + timeout;
        let mut records = self.records.lock();
        loop {
            let lock = records.entry(record.to_string()).or_default();
            if lock.writer.is_none_or(|w| w == owner) {
                lock.readers += 1;
                return Ok(ReadGuard {
                    manager: self,
                    record: record.to_string(),
                });
            }
            if self.released.wait_until(&mut records, deadline).timed_out() {
                tracing::warn!(target: "nos::file", record, owner, "read lock wait timed out");
                return Err(StoreError::LockConflict {
                    reference: record.to_string(),
                });
            }
        }
    }

    /// 按给定顺序依次加排他锁；任何一个超时则释放已得到的锁
    pub fn write_all(
        &self,
        owner: u64,
        records: &[String],
        timeout: Duration,
    ) -> StoreResult<WriteGuard<'_>> {
        let deadline = Instant::now() + timeout;
        let mut guard = WriteGuard {
            manager: self,
            owner,
            records: Vec::with_capacity(records.len()),
        };
        let mut table = self.records.lock();
        for record in records {
            loop {
                let lock = table.entry(record.clone()).or_default();
                match lock.writer {
                    Some(w) if w == owner => break,
                    None if lock.readers == 0 => {
                        lock.writer = Some(owner);
                        guard.records.push(record.clone());
                        break;
                    }
                    _ => {}
                }
                if self.released.wait_until(&mut table, deadline).timed_out() {
                    tracing::warn!(target: "nos::file", record, owner, "write lock wait timed out");
                    drop(table);
                    // guard 在此释放已持有的锁
                    return Err(StoreError::LockConflict {
                        reference: record.clone(),
                    });
                }
            }
        }
        Ok(guard)
    }

    pub fn held(&self) -> usize {
        self.records.lock().len()
    }

    /// 等待所有锁释放；超时返回仍被持有的数量
    pub fn drain(&self, timeout: Duration) -> Result<(), usize> {
        let deadline = Instant::now() + timeout;
        let mut records = self.records.lock();
        while !records.is_empty() {
            if self.released.wait_until(&mut records, deadline).timed_out() {
                return Err(records.len());
            }
        }
        Ok(())
    }

    fn release(&self, record: &str, release: impl FnOnce(&mut RecordLock)) {
        let mut records = self.records.lock();
        if let Some(lock) = records.get_mut(record) {
            release(lock);
            if lock.is_free() {
                records.remove(record);
            }
        }
        self.released.notify_all();
    }
}

pub struct ReadGuard<'a> {
    manager: &'a LockManager,
    record: String,
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.manager.release(&self.record, |lock| {
            lock.readers = lock.readers.saturating_sub(1);
        });
    }
}

pub struct WriteGuard<'a> {
    manager: &'a LockManager,
    owner: u64,
    records: Vec<String>,
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        for record in &self.records {
            self.manager.release(record, |lock| {
                if lock.writer == Some(self.owner) {
                    lock.writer = None;
                }
            });
        }
    }
}
