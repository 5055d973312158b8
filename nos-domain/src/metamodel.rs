//! 元模型契约（metamodel）
//!
//! 对象存储不自行发现领域类型的结构，而是通过 `SpecificationLoader` 获取
//! `ObjectSpecification`：按顺序列出可持久化的标量属性、单值引用与一对多集合。
//!
//! - 引用/集合标记为 `aggregated` 时，被引用对象内嵌于父对象，生命周期与父对象绑定；
//! - 否则为独立引用，以 `类型名@主键` 形式保存。
//!
use crate::value::ValueType;
use bon::Builder;
use dashmap::DashMap;
use std::sync::Arc;

/// 字段种类
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldKind {
    Value(ValueType),
    Reference { target: String, aggregated: bool },
    Collection { element: String, aggregated: bool },
}

/// 字段描述
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    name: String,
    kind: FieldKind,
    persisted: bool,
}

impl FieldSpec {
    pub fn value(name: impl Into<String>, value_type: ValueType) -> Self {
        Self::new(name, FieldKind::Value(value_type))
    }

    pub fn reference(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(
            name,
            FieldKind::Reference {
                target: target.into(),
                aggregated: false,
            },
        )
    }

    /// 内嵌聚合（单值）
    pub fn aggregate(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(
            name,
            FieldKind::Reference {
                target: target.into(),
                aggregated: true,
            },
        )
    }

    pub fn references(name: impl Into<String>, element: impl Into<String>) -> Self {
        Self::new(
            name,
            FieldKind::Collection {
                element: element.into(),
                aggregated: false,
            },
        )
    }

    /// 内嵌聚合（集合）
    pub fn aggregates(name: impl Into<String>, element: impl Into<String>) -> Self {
        Self::new(
            name,
            FieldKind::Collection {
                element: element.into(),
                aggregated: true,
            },
        )
    }

    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            persisted: true,
        }
    }

    /// 派生/计算属性，不参与持久化
    pub fn not_persisted(mut self) -> Self {
        self.persisted = false;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &FieldKind {
        &self.kind
    }

    pub fn is_persisted(&self) -> bool {
        self.persisted
    }

    pub fn is_collection(&self) -> bool {
        matches!(self.kind, FieldKind::Collection { .. })
    }
}

/// 领域类型的元模型描述
#[derive(Debug, Clone, Builder)]
pub struct ObjectSpecification {
    #[builder(into)]
    type_name: String,
    #[builder(default)]
    fields: Vec<FieldSpec>,
    /// 组成标题的属性，按顺序以空格拼接
    #[builder(default)]
    title_fields: Vec<String>,
    /// 该类型只能作为其他对象的内嵌部分存在
    #[builder(default)]
    aggregated: bool,
}

impl ObjectSpecification {
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn persistable_fields(&self) -> impl Iterator<Item = &FieldSpec> {
        self.fields.iter().filter(|f| f.persisted)
    }

    /// 一对多关联
    pub fn collections(&self) -> impl Iterator<Item = &FieldSpec> {
        self.fields.iter().filter(|f| f.is_collection())
    }

    pub fn title_fields(&self) -> &[String] {
        &self.title_fields
    }

    pub fn is_aggregated(&self) -> bool {
        self.aggregated
    }
}

/// 元模型协作方：按类型名提供对象规格
pub trait SpecificationLoader: Send + Sync {
    fn load_specification(&self, type_name: &str) -> Option<Arc<ObjectSpecification>>;
}

impl<T> SpecificationLoader for Arc<T>
where
    T: SpecificationLoader + ?Sized,
{
    fn load_specification(&self, type_name: &str) -> Option<Arc<ObjectSpecification>> {
        (**self).load_specification(type_name)
    }
}

/// 由 `#[naked_object]` 宏为普通结构体实现
pub trait DomainType {
    const TYPE: &'static str;

    fn specification() -> ObjectSpecification;
}

/// 基于内存的规格注册表
#[derive(Default)]
pub struct SpecificationRegistry {
    specs: DashMap<String, Arc<ObjectSpecification>>,
}

impl SpecificationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, spec: ObjectSpecification) -> Arc<ObjectSpecification> {
        let spec = Arc::new(spec);
        self.specs
            .insert(spec.type_name().to_string(), Arc::clone(&spec));
        spec
    }

    pub fn register_type<T: DomainType>(&self) -> Arc<ObjectSpecification> {
        self.register(T::specification())
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}

impl SpecificationLoader for SpecificationRegistry {
    fn load_specification(&self, type_name: &str) -> Option<Arc<ObjectSpecification>> {
        self.specs.get(type_name).map(|s| Arc::clone(s.value()))
    }
}
