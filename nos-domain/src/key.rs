//! 主键（PrimaryKey）
//!
//! 封闭的主键变体集合：整数、字符串、序列号。`string_value` 是稳定、可往返的
//! 文本形式，既用于持久化，也用于拼装 `类型名@主键` 形式的引用串。
//!
use crate::error::{StoreError, StoreResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// 主键变体
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PrimaryKey {
    Integer(i64),
    String(String),
    /// 十六进制文本形式
    Serial(u64),
}

/// 主键类型，决定从文本解析时采用的变体
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyKind {
    #[default]
    Integer,
    String,
    Serial,
}

impl PrimaryKey {
    pub fn kind(&self) -> KeyKind {
        match self {
            PrimaryKey::Integer(_) => KeyKind::Integer,
            PrimaryKey::String(_) => KeyKind::String,
            PrimaryKey::Serial(_) => KeyKind::Serial,
        }
    }

    /// 稳定的文本形式
    pub fn string_value(&self) -> String {
        match self {
            PrimaryKey::Integer(v) => v.to_string(),
            PrimaryKey::String(v) => v.clone(),
            PrimaryKey::Serial(v) => format!("{v:x}"),
        }
    }

    /// 按给定类型解析 `string_value` 产生的文本
    pub fn parse(kind: KeyKind, input: &str) -> StoreResult<Self> {
        let malformed = |reason: String| StoreError::MalformedKey {
            input: input.to_string(),
            reason,
        };

        match kind {
            KeyKind::Integer => input
                .parse::<i64>()
                .map(PrimaryKey::Integer)
                .map_err(|e| malformed(e.to_string())),
            KeyKind::String => {
                if input.is_empty() {
                    return Err(malformed("empty string key".to_string()));
                }
                Ok(PrimaryKey::String(input.to_string()))
            }
            KeyKind::Serial => u64::from_str_radix(input, 16)
                .map(PrimaryKey::Serial)
                .map_err(|e| malformed(e.to_string())),
        }
    }

    /// 引用串中的主键文本
    ///
    /// 引用串以 `@` 分隔类型名与主键，引用集合以 `|` 连接，
    /// 字符串主键中的 `%`、`@`、`|` 因此写作 `%25`、`%40`、`%7C`。
    pub fn reference_text(&self) -> String {
        let text = self.string_value();
        if !text.contains(['%', '@', '|']) {
            return text;
        }
        let mut escaped = String::with_capacity(text.len() + 4);
        for c in text.chars() {
            match c {
                '%' => escaped.push_str("%25"),
                '@' => escaped.push_str("%40"),
                '|' => escaped.push_str("%7C"),
                c => escaped.push(c),
            }
        }
        escaped
    }

    /// 解析 `reference_text` 产生的文本
    pub fn parse_reference_text(kind: KeyKind, text: &str) -> StoreResult<Self> {
        if !text.contains('%') {
            return Self::parse(kind, text);
        }
        let mut unescaped = String::with_capacity(text.len());
        let mut rest = text;
        while let Some(at) = rest.find('%') {
            unescaped.push_str(&rest[..at]);
            let c = match rest.get(at + 1..at + 3) {
                Some("25") => '%',
                Some("40") => '@',
                Some("7C" | "7c") => '|',
                _ => {
                    return Err(StoreError::MalformedKey {
                        input: text.to_string(),
                        reason: "bad escape in reference".to_string(),
                    });
                }
            };
            unescaped.push(c);
            rest = &rest[at + 3..];
        }
        unescaped.push_str(rest);
        Self::parse(kind, &unescaped)
    }

    /// 将序列号转换为指定类型的持久主键
    pub fn from_sequence(kind: KeyKind, value: u64) -> StoreResult<Self> {
        match kind {
            KeyKind::Integer => i64::try_from(value)
                .map(PrimaryKey::Integer)
                .map_err(|e| StoreError::MalformedKey {
                    input: value.to_string(),
                    reason: e.to_string(),
                }),
            KeyKind::String => Ok(PrimaryKey::String(value.to_string())),
            KeyKind::Serial => Ok(PrimaryKey::Serial(value)),
        }
    }
}

impl fmt::Display for PrimaryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.string_value())
    }
}

impl From<i64> for PrimaryKey {
    fn from(value: i64) -> Self {
        PrimaryKey::Integer(value)
    }
}

impl From<&str> for PrimaryKey {
    fn from(value: &str) -> Self {
        PrimaryKey::String(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    fn hash_of(key: &PrimaryKey) -> u64 {
        let mut h = DefaultHasher::new();
        key.hash(&mut h);
        h.finish()
    }

    #[test]
    fn equal_keys_hash_equal() {
        let pairs = [
            (PrimaryKey::Integer(7), PrimaryKey::Integer(7)),
            (PrimaryKey::from("abc"), PrimaryKey::String("abc".into())),
            (PrimaryKey::Serial(255), PrimaryKey::Serial(255)),
        ];
        for (a, b) in pairs {
            assert_eq!(a, b);
            assert_eq!(hash_of(&a), hash_of(&b));
        }
    }

    #[test]
    fn different_variant_or_value_is_not_equal() {
        assert_ne!(PrimaryKey::Integer(1), PrimaryKey::Serial(1));
        assert_ne!(PrimaryKey::Integer(1), PrimaryKey::String("1".into()));
        assert_ne!(PrimaryKey::Integer(1), PrimaryKey::Integer(2));
        assert_ne!(PrimaryKey::Serial(10), PrimaryKey::Serial(11));
    }

    #[test]
    fn string_value_round_trips() {
        for key in [
            PrimaryKey::Integer(-42),
            PrimaryKey::String("order-17".into()),
            PrimaryKey::Serial(0x1f),
        ] {
            let text = key.string_value();
            assert_eq!(PrimaryKey::parse(key.kind(), &text).unwrap(), key);
        }
        assert_eq!(PrimaryKey::Serial(31).string_value(), "1f");
    }

    #[test]
    fn malformed_input_is_rejected() {
        for (kind, input) in [
            (KeyKind::Integer, "12x"),
            (KeyKind::Serial, "zz"),
            (KeyKind::String, ""),
        ] {
            match PrimaryKey::parse(kind, input) {
                Err(StoreError::MalformedKey { input: i, .. }) => assert_eq!(i, input),
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn sequence_values_map_to_kind() {
        assert_eq!(
            PrimaryKey::from_sequence(KeyKind::Integer, 1).unwrap(),
            PrimaryKey::Integer(1)
        );
        assert_eq!(
            PrimaryKey::from_sequence(KeyKind::Serial, 16).unwrap(),
            PrimaryKey::Serial(16)
        );
        assert!(PrimaryKey::from_sequence(KeyKind::Integer, u64::MAX).is_err());
    }
}
