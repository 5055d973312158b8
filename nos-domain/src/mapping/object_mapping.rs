//! 对象映射（ObjectMapping）
//!
//! 一个类型的全部持久化属性映射为封闭的几种变体，由同一对 `decompose`/`recompose`
//! 按相同顺序处理：
//!
//! - 标量：值自身的文本编码，可选静态加密；
//! - 内嵌聚合：递归写入嵌套记录，生命周期与父对象一致；
//! - 独立引用：只写 `类型名@主键`，要求目标已是持久对象；
//! - 集合：聚合元素逐个内联（带局部标识），引用元素以 `|` 拼接。
//!
//! 读回时独立引用只生成占位对象（ghost），首次访问时才加载。
//!
use super::record::{Record, RecordValue};
use crate::adapter::{FieldValue, ObjectAdapter, ObjectRef, ResolveState};
use crate::encryption::DataEncryption;
use crate::error::{StoreError, StoreResult};
use crate::key::KeyKind;
use crate::metamodel::{FieldKind, ObjectSpecification, SpecificationLoader};
use crate::oid::Oid;
use crate::value::{ScalarValue, ValueType};
use std::sync::Arc;

/// 引用集合的分隔符
pub const REFERENCE_DELIMITER: char = '|';

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MappingKind {
    Scalar(ValueType),
    EmbeddedAggregate { target: String },
    Reference { target: String },
    AggregateCollection { element: String },
    ReferenceCollection { element: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldMapping {
    field: String,
    storage_name: String,
    kind: MappingKind,
    encrypted: bool,
}

impl FieldMapping {
    pub fn new(field: impl Into<String>, kind: MappingKind) -> Self {
        let field = field.into();
        Self {
            storage_name: field.clone(),
            field,
            kind,
            encrypted: false,
        }
    }

    /// 使用不同于属性名的存储名
    pub fn stored_as(mut self, storage_name: impl Into<String>) -> Self {
        self.storage_name = storage_name.into();
        self
    }

    /// 标量写入前加密
    pub fn encrypted(mut self) -> Self {
        self.encrypted = matches!(self.kind, MappingKind::Scalar(_));
        self
    }

    pub fn field(&self) -> &str {
        &self.field
    }

    pub fn storage_name(&self) -> &str {
        &self.storage_name
    }

    pub fn kind(&self) -> &MappingKind {
        &self.kind
    }

    pub fn is_encrypted(&self) -> bool {
        self.encrypted
    }
}

/// 映射过程所需的协作方，由对象存储在调用时提供
pub trait MappingContext {
    fn mapping_for(&self, type_name: &str) -> StoreResult<Arc<ObjectMapping>>;

    fn specification(&self, type_name: &str) -> StoreResult<Arc<ObjectSpecification>>;

    /// 聚合集合元素的局部标识
    fn next_aggregate_id(&mut self) -> StoreResult<u64>;

    fn encryption(&self) -> &dyn DataEncryption;

    fn key_kind(&self) -> KeyKind;

    /// 按标识取得对象：已缓存的实例，或新的占位对象
    fn reference(&self, oid: Oid) -> StoreResult<ObjectRef>;
}

#[derive(Debug, Clone)]
pub struct ObjectMapping {
    type_name: String,
    fields: Vec<FieldMapping>,
}

impl ObjectMapping {
    /// 没有任何可持久化属性的类型不能注册映射
    pub fn new(type_name: impl Into<String>, fields: Vec<FieldMapping>) -> StoreResult<Self> {
        let type_name = type_name.into();
        if fields.is_empty() {
            return Err(StoreError::NoPersistableFields { type_name });
        }
        Ok(Self { type_name, fields })
    }

    /// 按元模型推导默认映射
    ///
    /// 引用/集合在属性或目标类型任一标记为聚合时内嵌。
    pub fn auto(
        spec: &ObjectSpecification,
        loader: &dyn SpecificationLoader,
        encrypt_scalars: bool,
    ) -> StoreResult<Self> {
        let embedded = |target: &str, aggregated: bool| -> StoreResult<bool> {
            let target_spec = loader.load_specification(target);
            match target_spec {
                Some(s) => Ok(aggregated || s.is_aggregated()),
                None if aggregated => Err(StoreError::MissingSpecification {
                    type_name: target.to_string(),
                }),
                None => Ok(false),
            }
        };

        let mut fields = Vec::new();
        for field in spec.persistable_fields() {
            let kind = match field.kind() {
                FieldKind::Value(vt) => MappingKind::Scalar(*vt),
                FieldKind::Reference { target, aggregated } => {
                    if embedded(target, *aggregated)? {
                        MappingKind::EmbeddedAggregate {
                            target: target.clone(),
                        }
                    } else {
                        MappingKind::Reference {
                            target: target.clone(),
                        }
                    }
                }
                FieldKind::Collection {
                    element,
                    aggregated,
                } => {
                    if embedded(element, *aggregated)? {
                        MappingKind::AggregateCollection {
                            element: element.clone(),
                        }
                    } else {
                        MappingKind::ReferenceCollection {
                            element: element.clone(),
                        }
                    }
                }
            };
            let mapping = FieldMapping::new(field.name(), kind);
            fields.push(if encrypt_scalars {
                mapping.encrypted()
            } else {
                mapping
            });
        }
        Self::new(spec.type_name(), fields)
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn fields(&self) -> &[FieldMapping] {
        &self.fields
    }

    /// 映射中的属性必须都在元模型中
    pub fn validate(&self, spec: &ObjectSpecification) -> StoreResult<()> {
        for mapping in &self.fields {
            if spec.field(mapping.field()).is_none() {
                return Err(StoreError::UnknownField {
                    type_name: self.type_name.clone(),
                    field: mapping.field().to_string(),
                });
            }
        }
        Ok(())
    }

    /// 对象 -> 记录
    pub fn decompose(
        &self,
        object: &ObjectAdapter,
        ctx: &mut dyn MappingContext,
    ) -> StoreResult<Record> {
        let mut record = match object.local_id() {
            Some(id) => Record::with_local_id(id),
            None => Record::new(),
        };

        for mapping in &self.fields {
            let value = object.field(mapping.field())?;
            let stored = match (mapping.kind(), value) {
                (MappingKind::Scalar(_), FieldValue::Scalar(None)) => RecordValue::Null,
                (MappingKind::Scalar(vt), FieldValue::Scalar(Some(v))) => {
                    v.expect_type(*vt)?;
                    let encoded = v.encode();
                    RecordValue::Text(if mapping.encrypted {
                        ctx.encryption().encrypt(&encoded)
                    } else {
                        encoded
                    })
                }
                (
                    MappingKind::EmbeddedAggregate { .. },
                    FieldValue::Aggregate(None) | FieldValue::Reference(None),
                ) => RecordValue::Null,
                (
                    MappingKind::EmbeddedAggregate { target },
                    FieldValue::Aggregate(Some(child)) | FieldValue::Reference(Some(child)),
                ) => {
                    let child_mapping = ctx.mapping_for(target)?;
                    RecordValue::Nested(child_mapping.decompose(&child, ctx)?)
                }
                (MappingKind::Reference { .. }, FieldValue::Reference(None)) => RecordValue::Null,
                (MappingKind::Reference { .. }, FieldValue::Reference(Some(target))) => {
                    RecordValue::Text(persistent_reference(mapping.field(), &target)?)
                }
                (MappingKind::AggregateCollection { element }, FieldValue::Collection(items)) => {
                    let element_mapping = ctx.mapping_for(element)?;
                    let mut records = Vec::with_capacity(items.len());
                    for item in &items {
                        if item.local_id().is_none() {
                            let id = ctx.next_aggregate_id()?;
                            item.set_local_id(id)?;
                        }
                        records.push(element_mapping.decompose(item, ctx)?);
                    }
                    RecordValue::List(records)
                }
                (MappingKind::ReferenceCollection { .. }, FieldValue::Collection(items)) => {
                    if items.is_empty() {
                        RecordValue::Null
                    } else {
                        let references = items
                            .iter()
                            .map(|item| persistent_reference(mapping.field(), item))
                            .collect::<StoreResult<Vec<_>>>()?;
                        RecordValue::Text(references.join(&REFERENCE_DELIMITER.to_string()))
                    }
                }
                (kind, value) => {
                    return Err(StoreError::InvalidValue {
                        reason: format!(
                            "{}.{}: {value:?} cannot be stored as {kind:?}",
                            self.type_name,
                            mapping.field()
                        ),
                    });
                }
            };
            record.push(mapping.storage_name(), stored);
        }
        Ok(record)
    }

    /// 记录 -> 对象，按写入时的顺序与结构还原
    pub fn recompose(
        &self,
        object: &ObjectRef,
        record: &Record,
        ctx: &dyn MappingContext,
    ) -> StoreResult<()> {
        for mapping in &self.fields {
            let stored = record
                .get(mapping.storage_name())
                .unwrap_or(&RecordValue::Null);
            let field = mapping.field();

            match (mapping.kind(), stored) {
                (MappingKind::Scalar(_), RecordValue::Null) => object.clear_value(field)?,
                (MappingKind::Scalar(vt), RecordValue::Text(text)) => {
                    let plain = if mapping.encrypted {
                        ctx.encryption().decrypt(text)?
                    } else {
                        text.clone()
                    };
                    let value = ScalarValue::decode(*vt, &plain).map_err(|e| {
                        StoreError::integrity(format!(
                            "{}.{field} holds undecodable {vt}: {e}",
                            self.type_name
                        ))
                    })?;
                    object.set_value(field, value)?;
                }
                (MappingKind::EmbeddedAggregate { .. }, RecordValue::Null)
                | (MappingKind::Reference { .. }, RecordValue::Null) => {
                    object.set_reference(field, None)?
                }
                (MappingKind::EmbeddedAggregate { target }, RecordValue::Nested(nested)) => {
                    let child = embedded_child(object, field, target, nested, ctx)?;
                    object.set_reference(field, Some(child))?;
                }
                (MappingKind::Reference { .. }, RecordValue::Text(reference)) => {
                    let target = ctx.reference(parse_reference(reference, ctx.key_kind())?)?;
                    object.set_reference(field, Some(target))?;
                }
                (MappingKind::AggregateCollection { .. }, RecordValue::Null)
                | (MappingKind::ReferenceCollection { .. }, RecordValue::Null) => {
                    object.set_field(field, FieldValue::Collection(Vec::new()))?
                }
                (MappingKind::AggregateCollection { element }, RecordValue::List(records)) => {
                    let items = records
                        .iter()
                        .map(|nested| embedded_child(object, field, element, nested, ctx))
                        .collect::<StoreResult<Vec<_>>>()?;
                    object.set_field(field, FieldValue::Collection(items))?;
                }
                (MappingKind::ReferenceCollection { .. }, RecordValue::Text(joined)) => {
                    let items = joined
                        .split(REFERENCE_DELIMITER)
                        .filter(|s| !s.is_empty())
                        .map(|s| ctx.reference(parse_reference(s, ctx.key_kind())?))
                        .collect::<StoreResult<Vec<_>>>()?;
                    object.set_field(field, FieldValue::Collection(items))?;
                }
                (kind, stored) => {
                    return Err(StoreError::integrity(format!(
                        "{}.{field}: stored {stored:?} does not match {kind:?}",
                        self.type_name
                    )));
                }
            }
        }
        Ok(())
    }
}

fn persistent_reference(field: &str, target: &ObjectAdapter) -> StoreResult<String> {
    match target.oid() {
        Some(oid) if oid.is_persistent() => Ok(oid.reference_string()),
        Some(oid) => Err(StoreError::DanglingReference {
            field: field.to_string(),
            reference: oid.reference_string(),
        }),
        None => Err(StoreError::DanglingReference {
            field: field.to_string(),
            reference: format!("{}(aggregated)", target.type_name()),
        }),
    }
}

fn parse_reference(reference: &str, kind: KeyKind) -> StoreResult<Oid> {
    Oid::parse_reference(reference, kind)
        .map_err(|e| StoreError::integrity(format!("bad stored reference {reference:?}: {e}")))
}

fn embedded_child(
    parent: &ObjectRef,
    field: &str,
    type_name: &str,
    record: &Record,
    ctx: &dyn MappingContext,
) -> StoreResult<ObjectRef> {
    let child = ObjectAdapter::new_aggregated(ctx.specification(type_name)?, parent, field);
    if let Some(id) = record.local_id() {
        child.set_local_id(id)?;
    }
    ctx.mapping_for(type_name)?.recompose(&child, record, ctx)?;
    child.set_resolve_state(ResolveState::Resolved);
    Ok(child)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encryption::{KeyedCipher, NoEncryption};
    use crate::key::PrimaryKey;
    use crate::metamodel::{FieldSpec, SpecificationRegistry};
    use std::collections::HashMap;

    struct TestContext {
        specs: SpecificationRegistry,
        encryption: Box<dyn DataEncryption>,
        next_local: u64,
        encrypt: bool,
    }

    impl TestContext {
        fn new(encryption: Box<dyn DataEncryption>) -> Self {
            let specs = SpecificationRegistry::new();
            specs.register(
                ObjectSpecification::builder()
                    .type_name("Order")
                    .fields(vec![
                        FieldSpec::value("number", ValueType::Integer),
                        FieldSpec::value("note", ValueType::Text),
                        FieldSpec::aggregates("lines", "Line"),
                        FieldSpec::references("watchers", "Customer"),
                        FieldSpec::reference("customer", "Customer"),
                        FieldSpec::value("total", ValueType::Decimal).not_persisted(),
                    ])
                    .build(),
            );
            specs.register(
                ObjectSpecification::builder()
                    .type_name("Line")
                    .fields(vec![FieldSpec::value("sku", ValueType::Text)])
                    .aggregated(true)
                    .build(),
            );
            specs.register(
                ObjectSpecification::builder()
                    .type_name("Customer")
                    .fields(vec![FieldSpec::value("name", ValueType::Text)])
                    .build(),
            );
            Self {
                specs,
                encryption,
                next_local: 0,
                encrypt: false,
            }
        }
    }

    impl MappingContext for TestContext {
        fn mapping_for(&self, type_name: &str) -> StoreResult<Arc<ObjectMapping>> {
            let spec = self.specification(type_name)?;
            Ok(Arc::new(ObjectMapping::auto(&spec, &self.specs, self.encrypt)?))
        }

        fn specification(&self, type_name: &str) -> StoreResult<Arc<ObjectSpecification>> {
            self.specs
                .load_specification(type_name)
                .ok_or_else(|| StoreError::MissingSpecification {
                    type_name: type_name.to_string(),
                })
        }

        fn next_aggregate_id(&mut self) -> StoreResult<u64> {
            self.next_local += 1;
            Ok(self.next_local)
        }

        fn encryption(&self) -> &dyn DataEncryption {
            self.encryption.as_ref()
        }

        fn key_kind(&self) -> KeyKind {
            KeyKind::Integer
        }

        fn reference(&self, oid: Oid) -> StoreResult<ObjectRef> {
            Ok(ObjectAdapter::new_ghost(
                self.specification(oid.type_name())?,
                oid,
            ))
        }
    }

    fn customer(ctx: &TestContext, key: i64) -> ObjectRef {
        let spec = ctx.specification("Customer").unwrap();
        ObjectAdapter::new_ghost(
            spec,
            Oid::create_persistent("Customer", PrimaryKey::Integer(key)),
        )
    }

    fn order(ctx: &TestContext) -> ObjectRef {
        let order = ObjectAdapter::new_transient(
            ctx.specification("Order").unwrap(),
            Oid::create_transient("Order", 1),
        );
        order.set_value("number", 42i64).unwrap();
        for sku in ["a-1", "b-2", "c-3"] {
            let line = ObjectAdapter::new_aggregated(ctx.specification("Line").unwrap(), &order, "lines");
            line.set_value("sku", sku).unwrap();
            order.add_to_collection("lines", line).unwrap();
        }
        order.add_to_collection("watchers", customer(ctx, 7)).unwrap();
        order.add_to_collection("watchers", customer(ctx, 8)).unwrap();
        order
    }

    #[test]
    fn auto_mapping_classifies_fields() {
        let ctx = TestContext::new(Box::new(NoEncryption));
        let mapping = ctx.mapping_for("Order").unwrap();
        let kinds: HashMap<&str, &MappingKind> =
            mapping.fields().iter().map(|m| (m.field(), m.kind())).collect();
        assert_eq!(kinds.len(), 5);
        assert_eq!(kinds["number"], &MappingKind::Scalar(ValueType::Integer));
        assert_eq!(
            kinds["lines"],
            &MappingKind::AggregateCollection {
                element: "Line".into()
            }
        );
        assert_eq!(
            kinds["watchers"],
            &MappingKind::ReferenceCollection {
                element: "Customer".into()
            }
        );
        assert!(!kinds.contains_key("total"));
    }

    #[test]
    fn empty_mapping_is_rejected() {
        assert!(matches!(
            ObjectMapping::new("Empty", vec![]),
            Err(StoreError::NoPersistableFields { .. })
        ));
    }

    #[test]
    fn decompose_then_recompose() {
        let mut ctx = TestContext::new(Box::new(NoEncryption));
        let original = order(&ctx);
        let mapping = ctx.mapping_for("Order").unwrap();
        let record = mapping.decompose(&original, &mut ctx).unwrap();

        match record.get("lines") {
            Some(RecordValue::List(lines)) => {
                let ids: Vec<_> = lines.iter().map(|l| l.local_id()).collect();
                assert_eq!(ids, [Some(1), Some(2), Some(3)]);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            record.get("watchers"),
            Some(&RecordValue::Text("Customer@7|Customer@8".into()))
        );
        assert_eq!(record.get("note"), Some(&RecordValue::Null));

        let copy = ObjectAdapter::new_ghost(
            ctx.specification("Order").unwrap(),
            Oid::create_persistent("Order", PrimaryKey::Integer(1)),
        );
        mapping.recompose(&copy, &record, &ctx).unwrap();

        assert_eq!(copy.value("number").unwrap(), Some(ScalarValue::Integer(42)));
        assert_eq!(copy.value("note").unwrap(), None);
        let lines = copy.collection("lines").unwrap();
        assert_eq!(lines.len(), 3);
        assert!(lines.iter().all(|l| l.resolve_state() == ResolveState::Resolved));
        assert_eq!(lines[2].value("sku").unwrap(), Some(ScalarValue::from("c-3")));
        assert_eq!(lines[0].root_oid(), copy.oid());

        let watchers = copy.collection("watchers").unwrap();
        assert_eq!(watchers.len(), 2);
        assert!(watchers.iter().all(|w| w.is_ghost()));
        assert_eq!(
            watchers[1].oid().unwrap(),
            Oid::create_persistent("Customer", PrimaryKey::Integer(8))
        );
    }

    #[test]
    fn transient_reference_is_dangling() {
        let mut ctx = TestContext::new(Box::new(NoEncryption));
        let original = order(&ctx);
        let stranger = ObjectAdapter::new_transient(
            ctx.specification("Customer").unwrap(),
            Oid::create_transient("Customer", 9),
        );
        original.set_reference("customer", Some(stranger)).unwrap();

        let mapping = ctx.mapping_for("Order").unwrap();
        match mapping.decompose(&original, &mut ctx) {
            Err(StoreError::DanglingReference { field, .. }) => assert_eq!(field, "customer"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn encrypted_scalars_round_trip() {
        let mut ctx = TestContext::new(Box::new(KeyedCipher::new("k3y").unwrap()));
        ctx.encrypt = true;
        let original = order(&ctx);
        let mapping = ctx.mapping_for("Order").unwrap();
        let record = mapping.decompose(&original, &mut ctx).unwrap();
        assert_ne!(record.get("number"), Some(&RecordValue::Text("42".into())));

        let copy = ObjectAdapter::new_ghost(
            ctx.specification("Order").unwrap(),
            Oid::create_persistent("Order", PrimaryKey::Integer(1)),
        );
        mapping.recompose(&copy, &record, &ctx).unwrap();
        assert_eq!(copy.value("number").unwrap(), Some(ScalarValue::Integer(42)));
    }

    // 存储中的脏数据按完整性错误上报
    #[test]
    fn corrupt_scalar_is_integrity_error() {
        let ctx = TestContext::new(Box::new(NoEncryption));
        let mapping = ctx.mapping_for("Customer").unwrap();
        let mut record = Record::new();
        record.push("name", RecordValue::List(vec![]));
        let target = customer(&ctx, 1);
        assert!(matches!(
            mapping.recompose(&target, &record, &ctx),
            Err(StoreError::Integrity { .. })
        ));

        let mapping = ctx.mapping_for("Order").unwrap();
        let mut record = Record::new();
        record.push("number", RecordValue::Text("forty-two".into()));
        let target = order(&ctx);
        assert!(matches!(
            mapping.recompose(&target, &record, &ctx),
            Err(StoreError::Integrity { .. })
        ));
    }
}
