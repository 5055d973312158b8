//! 持久化查询
//!
//! 封闭的查询种类：全部实例、按属性模式、按标题，以及在对象存储上登记的命名查询。
//!
use crate::object_store::ObjectStore;
use nos_domain::adapter::ObjectRef;
use nos_domain::error::{StoreError, StoreResult};
use nos_domain::mapping::StoredRecord;
use nos_domain::metamodel::{FieldKind, ObjectSpecification};
use nos_domain::value::ScalarValue;
use std::fmt;

#[non_exhaustive]
#[derive(Debug, Clone, PartialEq)]
pub enum PersistenceQuery {
    FindAll {
        type_name: String,
    },
    /// 各属性值均相等的实例
    FindByPattern {
        type_name: String,
        pattern: Vec<(String, ScalarValue)>,
    },
    /// 标题包含给定文本（不区分大小写）的实例
    FindByTitle {
        type_name: String,
        title: String,
    },
    Named {
        name: String,
        parameters: Vec<ScalarValue>,
    },
}

impl PersistenceQuery {
    pub fn find_all(type_name: impl Into<String>) -> Self {
        PersistenceQuery::FindAll {
            type_name: type_name.into(),
        }
    }

    pub fn find_by_pattern(
        type_name: impl Into<String>,
        pattern: impl IntoIterator<Item = (impl Into<String>, ScalarValue)>,
    ) -> Self {
        PersistenceQuery::FindByPattern {
            type_name: type_name.into(),
            pattern: pattern.into_iter().map(|(f, v)| (f.into(), v)).collect(),
        }
    }

    pub fn find_by_title(type_name: impl Into<String>, title: impl Into<String>) -> Self {
        PersistenceQuery::FindByTitle {
            type_name: type_name.into(),
            title: title.into(),
        }
    }

    pub fn named(name: impl Into<String>, parameters: Vec<ScalarValue>) -> Self {
        PersistenceQuery::Named {
            name: name.into(),
            parameters,
        }
    }

    /// 命名查询没有固定类型
    pub fn type_name(&self) -> Option<&str> {
        match self {
            PersistenceQuery::FindAll { type_name }
            | PersistenceQuery::FindByPattern { type_name, .. }
            | PersistenceQuery::FindByTitle { type_name, .. } => Some(type_name),
            PersistenceQuery::Named { .. } => None,
        }
    }
}

impl fmt::Display for PersistenceQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PersistenceQuery::FindAll { type_name } => write!(f, "all {type_name}"),
            PersistenceQuery::FindByPattern { type_name, pattern } => {
                write!(f, "{type_name} where ")?;
                for (i, (field, value)) in pattern.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" and ")?;
                    }
                    write!(f, "{field}={value}")?;
                }
                Ok(())
            }
            PersistenceQuery::FindByTitle { type_name, title } => {
                write!(f, "{type_name} titled {title:?}")
            }
            PersistenceQuery::Named { name, .. } => write!(f, "named query {name}"),
        }
    }
}

/// 命名查询处理器
pub trait NamedQuery: Send + Sync {
    fn run(&self, store: &ObjectStore, parameters: &[ScalarValue]) -> StoreResult<Vec<ObjectRef>>;
}

impl<F> NamedQuery for F
where
    F: Fn(&ObjectStore, &[ScalarValue]) -> StoreResult<Vec<ObjectRef>> + Send + Sync,
{
    fn run(&self, store: &ObjectStore, parameters: &[ScalarValue]) -> StoreResult<Vec<ObjectRef>> {
        self(store, parameters)
    }
}

pub(crate) fn title_matches(record: &StoredRecord, title: &str) -> bool {
    let needle = title.to_lowercase();
    record
        .title()
        .is_some_and(|t| t.to_lowercase().contains(&needle))
}

/// 模式中的属性必须是该类型的标量属性，且值类型一致
pub(crate) fn validate_pattern(
    spec: &ObjectSpecification,
    pattern: &[(String, ScalarValue)],
) -> StoreResult<()> {
    for (field, value) in pattern {
        let Some(field_spec) = spec.field(field) else {
            return Err(StoreError::UnknownField {
                type_name: spec.type_name().to_string(),
                field: field.clone(),
            });
        };
        match field_spec.kind() {
            FieldKind::Value(expected) => value.expect_type(*expected)?,
            _ => {
                return Err(StoreError::TypeMismatch {
                    expected: "scalar field".to_string(),
                    found: format!("{}.{field}", spec.type_name()),
                });
            }
        }
    }
    Ok(())
}

pub(crate) fn pattern_matches(
    object: &ObjectRef,
    pattern: &[(String, ScalarValue)],
) -> StoreResult<bool> {
    for (field, expected) in pattern {
        if object.value(field)?.as_ref() != Some(expected) {
            return Ok(false);
        }
    }
    Ok(true)
}
