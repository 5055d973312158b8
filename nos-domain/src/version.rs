//! 版本戳（乐观并发控制）
//!
//! 每个持久对象附带一个版本：序列号 + 作者 + 时间戳。
//! 乐观锁比较只看序列号，作者与时间戳仅用于审计。
//! `Option<Version>` 的 `None` 表示“从未保存”。
//!
use crate::error::{StoreError, StoreResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// 版本戳
///
/// # 示例
///
/// ```
/// use nos_domain::version::Version;
///
/// let v1 = Version::new("alice");
/// assert_eq!(v1.sequence(), 1);
///
/// let v2 = v1.next("bob")?;
/// assert_eq!(v2.sequence(), 2);
/// assert_eq!(v2.author(), "bob");
/// assert!(v2.is_later_than(&v1));
/// # Ok::<(), nos_domain::error::StoreError>(())
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    sequence: u64,
    author: String,
    time: DateTime<Utc>,
}

impl Version {
    /// 首个版本（序列号为 1）
    pub fn new(author: impl Into<String>) -> Self {
        Self::from_parts(1, author, Utc::now())
    }

    pub fn from_parts(sequence: u64, author: impl Into<String>, time: DateTime<Utc>) -> Self {
        Self {
            sequence,
            author: author.into(),
            time,
        }
    }

    /// 下一个版本：序列号加一，时间为当前时间，作者为当前调用者
    ///
    /// 序列号已到 `u64::MAX` 时返回 `Integrity`，不会回绕或停留在原值。
    pub fn next(&self, author: impl Into<String>) -> StoreResult<Self> {
        let sequence = self.sequence.checked_add(1).ok_or_else(|| {
            StoreError::integrity(format!("version sequence exhausted at v{}", self.sequence))
        })?;
        Ok(Self::from_parts(sequence, author, Utc::now()))
    }

    /// 对“从未保存”的对象给出首个版本
    ///
    /// ```
    /// use nos_domain::version::Version;
    ///
    /// assert_eq!(Version::next_after(None, "alice")?.sequence(), 1);
    /// let v3 = Version::next_after(Some(&Version::new("a").next("a")?), "b")?;
    /// assert_eq!(v3.sequence(), 3);
    /// # Ok::<(), nos_domain::error::StoreError>(())
    /// ```
    pub fn next_after(previous: Option<&Version>, author: impl Into<String>) -> StoreResult<Self> {
        match previous {
            Some(v) => v.next(author),
            None => Ok(Self::new(author)),
        }
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn author(&self) -> &str {
        &self.author
    }

    pub fn time(&self) -> DateTime<Utc> {
        self.time
    }

    pub fn is_later_than(&self, other: &Version) -> bool {
        self.sequence > other.sequence
    }

    /// 序列号不同即视为被他人修改
    pub fn differs(&self, other: &Version) -> bool {
        self.sequence != other.sequence
    }

    pub fn compare(&self, other: &Version) -> Ordering {
        self.sequence.cmp(&other.sequence)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.sequence)
    }
}
