//! 对象适配器（ObjectAdapter）
//!
//! 内存中的“裸对象”：标识、版本、解析状态以及按元模型校验的属性值。
//! 对象图通过 `ObjectRef`（`Arc<ObjectAdapter>`）共享；内嵌聚合对象没有独立标识，
//! 只持有指向父对象的弱引用，父对象提升后无需同步更新子对象。
//!
use crate::error::{StoreError, StoreResult};
use crate::key::PrimaryKey;
use crate::metamodel::{FieldKind, FieldSpec, ObjectSpecification};
use crate::oid::Oid;
use crate::value::ScalarValue;
use crate::version::Version;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

pub type ObjectRef = Arc<ObjectAdapter>;

/// 对象标识
#[derive(Debug, Clone)]
pub enum ObjectIdentity {
    /// 可独立持久化的根对象
    Root(Oid),
    /// 内嵌于父对象的聚合部分
    Aggregated {
        parent: Weak<ObjectAdapter>,
        field: String,
        /// 集合内的局部标识，写入时分配
        local_id: Option<u64>,
    },
}

/// 解析状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveState {
    /// 新建，尚未写入存储
    Transient,
    /// 仅有标识，属性尚未从存储加载
    Ghost,
    Resolved,
    Destroyed,
}

/// 属性值
///
/// `Scalar(None)` 与 `Reference(None)` 表示属性为空，与“对象不存在”不同。
#[derive(Debug, Clone)]
pub enum FieldValue {
    Scalar(Option<ScalarValue>),
    Reference(Option<ObjectRef>),
    Aggregate(Option<ObjectRef>),
    Collection(Vec<ObjectRef>),
}

impl FieldValue {
    /// 属性种类对应的空值
    pub fn empty_for(kind: &FieldKind) -> Self {
        match kind {
            FieldKind::Value(_) => FieldValue::Scalar(None),
            FieldKind::Reference {
                aggregated: false, ..
            } => FieldValue::Reference(None),
            FieldKind::Reference {
                aggregated: true, ..
            } => FieldValue::Aggregate(None),
            FieldKind::Collection { .. } => FieldValue::Collection(Vec::new()),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            FieldValue::Scalar(v) => v.is_none(),
            FieldValue::Reference(v) | FieldValue::Aggregate(v) => v.is_none(),
            FieldValue::Collection(v) => v.is_empty(),
        }
    }
}

pub struct ObjectAdapter {
    spec: Arc<ObjectSpecification>,
    identity: RwLock<ObjectIdentity>,
    version: RwLock<Option<Version>>,
    state: RwLock<ResolveState>,
    fields: RwLock<HashMap<String, FieldValue>>,
}

impl ObjectAdapter {
    fn with(
        spec: Arc<ObjectSpecification>,
        identity: ObjectIdentity,
        state: ResolveState,
    ) -> ObjectRef {
        let fields = spec
            .fields()
            .iter()
            .map(|f| (f.name().to_string(), FieldValue::empty_for(f.kind())))
            .collect();
        Arc::new(Self {
            spec,
            identity: RwLock::new(identity),
            version: RwLock::new(None),
            state: RwLock::new(state),
            fields: RwLock::new(fields),
        })
    }

    pub fn new_transient(spec: Arc<ObjectSpecification>, oid: Oid) -> ObjectRef {
        Self::with(spec, ObjectIdentity::Root(oid), ResolveState::Transient)
    }

    /// 只有标识的占位对象，首次访问时再加载
    pub fn new_ghost(spec: Arc<ObjectSpecification>, oid: Oid) -> ObjectRef {
        Self::with(spec, ObjectIdentity::Root(oid), ResolveState::Ghost)
    }

    pub fn new_aggregated(
        spec: Arc<ObjectSpecification>,
        parent: &ObjectRef,
        field: impl Into<String>,
    ) -> ObjectRef {
        let identity = ObjectIdentity::Aggregated {
            parent: Arc::downgrade(parent),
            field: field.into(),
            local_id: None,
        };
        Self::with(spec, identity, ResolveState::Transient)
    }

    pub fn specification(&self) -> &Arc<ObjectSpecification> {
        &self.spec
    }

    pub fn type_name(&self) -> &str {
        self.spec.type_name()
    }

    pub fn identity(&self) -> ObjectIdentity {
        self.identity.read().clone()
    }

    /// 根对象的标识；内嵌对象返回 `None`
    pub fn oid(&self) -> Option<Oid> {
        match &*self.identity.read() {
            ObjectIdentity::Root(oid) => Some(oid.clone()),
            ObjectIdentity::Aggregated { .. } => None,
        }
    }

    /// 沿父链找到所属根对象的标识
    pub fn root_oid(&self) -> Option<Oid> {
        let parent = match &*self.identity.read() {
            ObjectIdentity::Root(oid) => return Some(oid.clone()),
            ObjectIdentity::Aggregated { parent, .. } => parent.upgrade(),
        };
        parent.and_then(|p| p.root_oid())
    }

    pub fn is_aggregated(&self) -> bool {
        matches!(&*self.identity.read(), ObjectIdentity::Aggregated { .. })
    }

    pub fn local_id(&self) -> Option<u64> {
        match &*self.identity.read() {
            ObjectIdentity::Aggregated { local_id, .. } => *local_id,
            ObjectIdentity::Root(_) => None,
        }
    }

    pub fn set_local_id(&self, id: u64) -> StoreResult<()> {
        match &mut *self.identity.write() {
            ObjectIdentity::Aggregated { local_id, .. } => {
                *local_id = Some(id);
                Ok(())
            }
            ObjectIdentity::Root(oid) => Err(StoreError::illegal_state(format!(
                "root object {oid} has no local id"
            ))),
        }
    }

    pub fn version(&self) -> Option<Version> {
        self.version.read().clone()
    }

    pub fn set_version(&self, version: Option<Version>) {
        *self.version.write() = version;
    }

    pub fn resolve_state(&self) -> ResolveState {
        *self.state.read()
    }

    pub fn set_resolve_state(&self, state: ResolveState) {
        *self.state.write() = state;
    }

    pub fn is_ghost(&self) -> bool {
        self.resolve_state() == ResolveState::Ghost
    }

    pub fn is_destroyed(&self) -> bool {
        self.resolve_state() == ResolveState::Destroyed
    }

    fn field_spec(&self, name: &str) -> StoreResult<&FieldSpec> {
        self.spec
            .field(name)
            .ok_or_else(|| StoreError::UnknownField {
                type_name: self.type_name().to_string(),
                field: name.to_string(),
            })
    }

    pub fn field(&self, name: &str) -> StoreResult<FieldValue> {
        let spec = self.field_spec(name)?;
        Ok(self
            .fields
            .read()
            .get(name)
            .cloned()
            .unwrap_or_else(|| FieldValue::empty_for(spec.kind())))
    }

    /// 写入属性，值的形态与目标类型必须符合元模型描述
    pub fn set_field(&self, name: &str, value: FieldValue) -> StoreResult<()> {
        let spec = self.field_spec(name)?;
        check_value(self.type_name(), spec, &value)?;
        self.fields.write().insert(name.to_string(), value);
        Ok(())
    }

    pub fn set_value(&self, name: &str, value: impl Into<ScalarValue>) -> StoreResult<()> {
        self.set_field(name, FieldValue::Scalar(Some(value.into())))
    }

    pub fn clear_value(&self, name: &str) -> StoreResult<()> {
        self.set_field(name, FieldValue::Scalar(None))
    }

    pub fn value(&self, name: &str) -> StoreResult<Option<ScalarValue>> {
        match self.field(name)? {
            FieldValue::Scalar(v) => Ok(v),
            _ => Err(self.wrong_shape(name, "scalar")),
        }
    }

    /// 单值关联；内嵌或独立由元模型决定
    pub fn set_reference(&self, name: &str, target: Option<ObjectRef>) -> StoreResult<()> {
        let value = match self.field_spec(name)?.kind() {
            FieldKind::Reference {
                aggregated: true, ..
            } => FieldValue::Aggregate(target),
            _ => FieldValue::Reference(target),
        };
        self.set_field(name, value)
    }

    pub fn reference(&self, name: &str) -> StoreResult<Option<ObjectRef>> {
        match self.field(name)? {
            FieldValue::Reference(v) | FieldValue::Aggregate(v) => Ok(v),
            _ => Err(self.wrong_shape(name, "reference")),
        }
    }

    pub fn collection(&self, name: &str) -> StoreResult<Vec<ObjectRef>> {
        match self.field(name)? {
            FieldValue::Collection(v) => Ok(v),
            _ => Err(self.wrong_shape(name, "collection")),
        }
    }

    pub fn add_to_collection(&self, name: &str, element: ObjectRef) -> StoreResult<()> {
        let mut elements = self.collection(name)?;
        elements.push(element);
        self.set_field(name, FieldValue::Collection(elements))
    }

    pub fn remove_from_collection(&self, name: &str, element: &ObjectRef) -> StoreResult<bool> {
        let mut elements = self.collection(name)?;
        let before = elements.len();
        elements.retain(|e| !Arc::ptr_eq(e, element));
        let removed = elements.len() != before;
        self.set_field(name, FieldValue::Collection(elements))?;
        Ok(removed)
    }

    /// 标题：标题属性的文本值以空格拼接，空值跳过
    pub fn title(&self) -> String {
        let fields = self.fields.read();
        self.spec
            .title_fields()
            .iter()
            .filter_map(|name| match fields.get(name) {
                Some(FieldValue::Scalar(Some(v))) => Some(v.encode()),
                Some(FieldValue::Reference(Some(r))) | Some(FieldValue::Aggregate(Some(r))) => {
                    Some(r.title())
                }
                _ => None,
            })
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// 以新主键提升根对象的标识，返回提升后的标识
    pub fn promote(&self, key: PrimaryKey) -> StoreResult<Oid> {
        match &mut *self.identity.write() {
            ObjectIdentity::Root(oid) => {
                oid.set_id(key)?;
                oid.make_persistent()?;
                Ok(oid.clone())
            }
            ObjectIdentity::Aggregated { .. } => Err(StoreError::NotIndependentlyPersistable {
                type_name: self.type_name().to_string(),
            }),
        }
    }

    /// 提升前的标识
    pub fn previous_oid(&self) -> Option<Oid> {
        match &*self.identity.read() {
            ObjectIdentity::Root(oid) => oid.previous().cloned(),
            ObjectIdentity::Aggregated { .. } => None,
        }
    }

    pub fn clear_previous(&self) {
        if let ObjectIdentity::Root(oid) = &mut *self.identity.write() {
            oid.clear_previous();
        }
    }

    pub fn revert_promotion(&self) -> bool {
        match &mut *self.identity.write() {
            ObjectIdentity::Root(oid) => oid.revert_promotion(),
            ObjectIdentity::Aggregated { .. } => false,
        }
    }

    fn wrong_shape(&self, name: &str, expected: &str) -> StoreError {
        StoreError::TypeMismatch {
            expected: expected.to_string(),
            found: format!("{}.{name}", self.type_name()),
        }
    }
}

fn check_value(type_name: &str, spec: &FieldSpec, value: &FieldValue) -> StoreResult<()> {
    let invalid = |reason: String| StoreError::InvalidValue {
        reason: format!("{type_name}.{}: {reason}", spec.name()),
    };
    let check_target = |target: &str, object: &ObjectRef| {
        if object.type_name() == target {
            Ok(())
        } else {
            Err(invalid(format!(
                "expected {target}, got {}",
                object.type_name()
            )))
        }
    };

    match (spec.kind(), value) {
        (FieldKind::Value(_), FieldValue::Scalar(None)) => Ok(()),
        (FieldKind::Value(vt), FieldValue::Scalar(Some(v))) => v.expect_type(*vt),
        (
            FieldKind::Reference {
                target,
                aggregated: false,
            },
            FieldValue::Reference(v),
        )
        | (
            FieldKind::Reference {
                target,
                aggregated: true,
            },
            FieldValue::Aggregate(v),
        ) => match v {
            Some(object) => check_target(target, object),
            None => Ok(()),
        },
        (FieldKind::Collection { element, .. }, FieldValue::Collection(items)) => items
            .iter()
            .try_for_each(|object| check_target(element, object)),
        (kind, _) => Err(invalid(format!("value does not fit field kind {kind:?}"))),
    }
}

impl fmt::Debug for ObjectAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let identity = match &*self.identity.read() {
            ObjectIdentity::Root(oid) => oid.to_string(),
            ObjectIdentity::Aggregated {
                field, local_id, ..
            } => format!("{}#{field}/{local_id:?}", self.type_name()),
        };
        f.debug_struct("ObjectAdapter")
            .field("identity", &identity)
            .field("state", &self.resolve_state())
            .field("version", &self.version())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ValueType;

    fn widget_spec() -> Arc<ObjectSpecification> {
        Arc::new(
            ObjectSpecification::builder()
                .type_name("Widget")
                .fields(vec![
                    FieldSpec::value("name", ValueType::Text),
                    FieldSpec::value("color", ValueType::Text),
                    FieldSpec::value("stock", ValueType::Integer),
                    FieldSpec::aggregates("parts", "Part"),
                ])
                .title_fields(vec!["name".to_string(), "color".to_string()])
                .build(),
        )
    }

    fn part_spec() -> Arc<ObjectSpecification> {
        Arc::new(
            ObjectSpecification::builder()
                .type_name("Part")
                .fields(vec![FieldSpec::value("label", ValueType::Text)])
                .aggregated(true)
                .build(),
        )
    }

    #[test]
    fn new_object_has_empty_fields() {
        let widget = ObjectAdapter::new_transient(widget_spec(), Oid::create_transient("Widget", 1));
        assert_eq!(widget.resolve_state(), ResolveState::Transient);
        assert!(widget.value("name").unwrap().is_none());
        assert!(widget.collection("parts").unwrap().is_empty());
        assert!(widget.version().is_none());
    }

    #[test]
    fn set_field_is_validated() {
        let widget = ObjectAdapter::new_transient(widget_spec(), Oid::create_transient("Widget", 1));
        widget.set_value("stock", 4i64).unwrap();
        assert_eq!(widget.value("stock").unwrap(), Some(ScalarValue::Integer(4)));

        assert!(matches!(
            widget.set_value("stock", "four"),
            Err(StoreError::TypeMismatch { .. })
        ));
        assert!(matches!(
            widget.set_value("weight", 1i64),
            Err(StoreError::UnknownField { .. })
        ));
        let stray = ObjectAdapter::new_transient(widget_spec(), Oid::create_transient("Widget", 2));
        assert!(matches!(
            widget.add_to_collection("parts", stray),
            Err(StoreError::InvalidValue { .. })
        ));
    }

    #[test]
    fn title_joins_title_fields() {
        let widget = ObjectAdapter::new_transient(widget_spec(), Oid::create_transient("Widget", 1));
        widget.set_value("name", "Sprocket").unwrap();
        assert_eq!(widget.title(), "Sprocket");
        widget.set_value("color", "red").unwrap();
        assert_eq!(widget.title(), "Sprocket red");
    }

    #[test]
    fn promotion_and_revert() {
        let widget = ObjectAdapter::new_transient(widget_spec(), Oid::create_transient("Widget", 3));
        let oid = widget.promote(PrimaryKey::Integer(11)).unwrap();
        assert!(oid.is_persistent());
        assert_eq!(widget.previous_oid().unwrap().key(), &PrimaryKey::Integer(-3));

        assert!(widget.revert_promotion());
        assert!(widget.oid().unwrap().is_transient());
        assert_eq!(widget.oid().unwrap().key(), &PrimaryKey::Integer(-3));
    }

    // 内嵌对象的根标识随父对象提升而变化
    #[test]
    fn aggregated_part_follows_parent() {
        let widget = ObjectAdapter::new_transient(widget_spec(), Oid::create_transient("Widget", 1));
        let part = ObjectAdapter::new_aggregated(part_spec(), &widget, "parts");
        widget.add_to_collection("parts", part.clone()).unwrap();

        assert!(part.is_aggregated());
        assert!(part.oid().is_none());
        assert!(matches!(
            part.promote(PrimaryKey::Integer(1)),
            Err(StoreError::NotIndependentlyPersistable { .. })
        ));

        widget.promote(PrimaryKey::Integer(9)).unwrap();
        assert_eq!(part.root_oid().unwrap().key(), &PrimaryKey::Integer(9));

        part.set_local_id(5).unwrap();
        assert_eq!(part.local_id(), Some(5));
        assert!(widget.set_local_id(1).is_err());
    }
}
