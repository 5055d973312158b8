//! 标量值（ScalarValue）
//!
//! 属性的值类型及其稳定文本编码，映射层据此写入/读回标量字段。
//!
use crate::error::{StoreError, StoreResult};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// 值类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    Text,
    Integer,
    Decimal,
    Boolean,
    Date,
    DateTime,
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueType::Text => "text",
            ValueType::Integer => "integer",
            ValueType::Decimal => "decimal",
            ValueType::Boolean => "boolean",
            ValueType::Date => "date",
            ValueType::DateTime => "datetime",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ScalarValue {
    Text(String),
    Integer(i64),
    Decimal(f64),
    Boolean(bool),
    Date(NaiveDate),
    DateTime(DateTime<Utc>),
}

impl ScalarValue {
    pub fn value_type(&self) -> ValueType {
        match self {
            ScalarValue::Text(_) => ValueType::Text,
            ScalarValue::Integer(_) => ValueType::Integer,
            ScalarValue::Decimal(_) => ValueType::Decimal,
            ScalarValue::Boolean(_) => ValueType::Boolean,
            ScalarValue::Date(_) => ValueType::Date,
            ScalarValue::DateTime(_) => ValueType::DateTime,
        }
    }

    /// 文本编码
    pub fn encode(&self) -> String {
        match self {
            ScalarValue::Text(v) => v.clone(),
            ScalarValue::Integer(v) => v.to_string(),
            ScalarValue::Decimal(v) => v.to_string(),
            ScalarValue::Boolean(v) => v.to_string(),
            ScalarValue::Date(v) => v.format("%Y-%m-%d").to_string(),
            ScalarValue::DateTime(v) => v.to_rfc3339(),
        }
    }

    /// 按值类型解码 `encode` 的输出
    pub fn decode(value_type: ValueType, encoded: &str) -> StoreResult<Self> {
        let value = match value_type {
            ValueType::Text => ScalarValue::Text(encoded.to_string()),
            ValueType::Integer => ScalarValue::Integer(encoded.parse()?),
            ValueType::Decimal => ScalarValue::Decimal(encoded.parse()?),
            ValueType::Boolean => ScalarValue::Boolean(encoded.parse()?),
            ValueType::Date => {
                ScalarValue::Date(NaiveDate::parse_from_str(encoded, "%Y-%m-%d")?)
            }
            ValueType::DateTime => {
                ScalarValue::DateTime(DateTime::parse_from_rfc3339(encoded)?.with_timezone(&Utc))
            }
        };
        Ok(value)
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ScalarValue::Text(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            ScalarValue::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn expect_type(&self, expected: ValueType) -> StoreResult<()> {
        if self.value_type() == expected {
            return Ok(());
        }
        Err(StoreError::TypeMismatch {
            expected: expected.to_string(),
            found: self.value_type().to_string(),
        })
    }
}

impl fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl From<&str> for ScalarValue {
    fn from(value: &str) -> Self {
        ScalarValue::Text(value.to_string())
    }
}

impl From<String> for ScalarValue {
    fn from(value: String) -> Self {
        ScalarValue::Text(value)
    }
}

impl From<i64> for ScalarValue {
    fn from(value: i64) -> Self {
        ScalarValue::Integer(value)
    }
}

impl From<f64> for ScalarValue {
    fn from(value: f64) -> Self {
        ScalarValue::Decimal(value)
    }
}

impl From<bool> for ScalarValue {
    fn from(value: bool) -> Self {
        ScalarValue::Boolean(value)
    }
}

impl From<NaiveDate> for ScalarValue {
    fn from(value: NaiveDate) -> Self {
        ScalarValue::Date(value)
    }
}

impl From<DateTime<Utc>> for ScalarValue {
    fn from(value: DateTime<Utc>) -> Self {
        ScalarValue::DateTime(value)
    }
}
