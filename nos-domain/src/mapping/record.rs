//! 存储记录（StoredRecord）
//!
//! 映射层与存储后端之间的中立数据形态：有序的 `名称 -> 值` 条目，
//! 内嵌聚合以嵌套记录表示，聚合集合以记录列表表示。
//!
use crate::key::PrimaryKey;
use crate::version::Version;
use bon::Builder;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordValue {
    Null,
    /// 编码（可能已加密）后的标量或引用串
    Text(String),
    Nested(Record),
    List(Vec<Record>),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// 聚合集合元素的局部标识
    #[serde(default, skip_serializing_if = "Option::is_none")]
    local_id: Option<u64>,
    entries: Vec<(String, RecordValue)>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_local_id(local_id: u64) -> Self {
        Self {
            local_id: Some(local_id),
            entries: Vec::new(),
        }
    }

    pub fn local_id(&self) -> Option<u64> {
        self.local_id
    }

    pub fn push(&mut self, name: impl Into<String>, value: RecordValue) {
        self.entries.push((name.into(), value));
    }

    pub fn get(&self, name: &str) -> Option<&RecordValue> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &RecordValue)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// 一行存储数据
#[derive(Debug, Clone, PartialEq, Eq, Builder, Serialize, Deserialize)]
pub struct StoredRecord {
    #[builder(into)]
    type_name: String,
    key: PrimaryKey,
    /// 写入时由命令设置
    version: Option<Version>,
    /// 冗余保存的标题，供按标题查询
    title: Option<String>,
    data: Record,
}

impl StoredRecord {
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn key(&self) -> &PrimaryKey {
        &self.key
    }

    pub fn version(&self) -> Option<&Version> {
        self.version.as_ref()
    }

    pub fn set_version(&mut self, version: Version) {
        self.version = Some(version);
    }

    pub fn title(&self) -> Option<&str> {
        self.title.as_deref()
    }

    pub fn data(&self) -> &Record {
        &self.data
    }

    /// `类型名@主键`
    pub fn reference_string(&self) -> String {
        format!("{}@{}", self.type_name, self.key.reference_text())
    }
}
