//! 映射注册表（MappingRegistry）
//!
//! 按类型名缓存 `ObjectMapping`。首次访问时通过默认工厂（自动映射）推导并注册，
//! 查找与创建在同一个分片锁内完成，并发首次访问只会创建一个实例。
//! 显式注册优先于自动推导，且在注册时立即校验。
//!
use super::object_mapping::ObjectMapping;
use crate::error::{StoreError, StoreResult};
use crate::metamodel::{ObjectSpecification, SpecificationLoader};
use dashmap::DashMap;
use std::sync::Arc;

/// 映射工厂
///
/// 工厂在注册表的分片锁内执行，不能回调注册表。
pub trait MappingFactory: Send + Sync {
    fn create_mapping(
        &self,
        spec: &ObjectSpecification,
        loader: &dyn SpecificationLoader,
    ) -> StoreResult<ObjectMapping>;
}

impl<F> MappingFactory for F
where
    F: Fn(&ObjectSpecification, &dyn SpecificationLoader) -> StoreResult<ObjectMapping>
        + Send
        + Sync,
{
    fn create_mapping(
        &self,
        spec: &ObjectSpecification,
        loader: &dyn SpecificationLoader,
    ) -> StoreResult<ObjectMapping> {
        self(spec, loader)
    }
}

/// 按元模型推导映射
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoMapper {
    encrypt_scalars: bool,
}

impl AutoMapper {
    pub fn new(encrypt_scalars: bool) -> Self {
        Self { encrypt_scalars }
    }
}

impl MappingFactory for AutoMapper {
    fn create_mapping(
        &self,
        spec: &ObjectSpecification,
        loader: &dyn SpecificationLoader,
    ) -> StoreResult<ObjectMapping> {
        ObjectMapping::auto(spec, loader, self.encrypt_scalars)
    }
}

pub struct MappingRegistry {
    loader: Arc<dyn SpecificationLoader>,
    mappings: DashMap<String, Arc<ObjectMapping>>,
    default_factory: Arc<dyn MappingFactory>,
}

impl MappingRegistry {
    pub fn new(loader: Arc<dyn SpecificationLoader>) -> Self {
        Self::with_default_factory(loader, Arc::new(AutoMapper::default()))
    }

    pub fn with_default_factory(
        loader: Arc<dyn SpecificationLoader>,
        default_factory: Arc<dyn MappingFactory>,
    ) -> Self {
        Self {
            loader,
            mappings: DashMap::new(),
            default_factory,
        }
    }

    pub fn loader(&self) -> &Arc<dyn SpecificationLoader> {
        &self.loader
    }

    fn specification(&self, type_name: &str) -> StoreResult<Arc<ObjectSpecification>> {
        self.loader
            .load_specification(type_name)
            .ok_or_else(|| StoreError::MissingSpecification {
                type_name: type_name.to_string(),
            })
    }

    /// 已注册的映射，或按默认工厂推导后注册
    pub fn get_mapping(&self, type_name: &str) -> StoreResult<Arc<ObjectMapping>> {
        if let Some(mapping) = self.mappings.get(type_name) {
            return Ok(Arc::clone(mapping.value()));
        }

        let entry = self
            .mappings
            .entry(type_name.to_string())
            .or_try_insert_with(|| {
                let spec = self.specification(type_name)?;
                let mapping = self
                    .default_factory
                    .create_mapping(&spec, self.loader.as_ref())?;
                tracing::debug!(
                    target: "nos::store",
                    type_name,
                    fields = mapping.fields().len(),
                    "derived default mapping"
                );
                Ok::<_, StoreError>(Arc::new(mapping))
            })?;
        Ok(Arc::clone(entry.value()))
    }

    /// 显式注册，覆盖自动推导
    pub fn register_mapping(&self, mapping: ObjectMapping) -> StoreResult<Arc<ObjectMapping>> {
        let spec = self.specification(mapping.type_name())?;
        mapping.validate(&spec)?;
        let mapping = Arc::new(mapping);
        self.mappings
            .insert(mapping.type_name().to_string(), Arc::clone(&mapping));
        Ok(mapping)
    }

    /// 以工厂注册：立即构建，配置错误在此处暴露
    pub fn register_factory(
        &self,
        type_name: &str,
        factory: &dyn MappingFactory,
    ) -> StoreResult<Arc<ObjectMapping>> {
        let spec = self.specification(type_name)?;
        let mapping = factory.create_mapping(&spec, self.loader.as_ref())?;
        self.register_mapping(mapping)
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.mappings.contains_key(type_name)
    }

    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::{FieldMapping, MappingKind};
    use crate::metamodel::{FieldSpec, SpecificationRegistry};
    use crate::value::ValueType;
    use std::sync::Barrier;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn loader() -> Arc<SpecificationRegistry> {
        let specs = SpecificationRegistry::new();
        specs.register(
            ObjectSpecification::builder()
                .type_name("Widget")
                .fields(vec![FieldSpec::value("name", ValueType::Text)])
                .build(),
        );
        specs.register(
            ObjectSpecification::builder()
                .type_name("Marker")
                .fields(vec![FieldSpec::value("cached", ValueType::Text).not_persisted()])
                .build(),
        );
        Arc::new(specs)
    }

    #[test]
    fn derives_and_caches() {
        let registry = MappingRegistry::new(loader());
        let first = registry.get_mapping("Widget").unwrap();
        let second = registry.get_mapping("Widget").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn unknown_type_is_configuration_error() {
        let registry = MappingRegistry::new(loader());
        match registry.get_mapping("Ghost") {
            Err(e @ StoreError::MissingSpecification { .. }) => {
                assert_eq!(e.category(), crate::error::ErrorCategory::Configuration)
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(registry.is_empty());
    }

    // 没有可持久化属性的类型在注册时立即失败
    #[test]
    fn zero_field_type_fails_at_registration() {
        let registry = MappingRegistry::new(loader());
        assert!(matches!(
            registry.register_factory("Marker", &AutoMapper::default()),
            Err(StoreError::NoPersistableFields { .. })
        ));
        assert!(!registry.contains("Marker"));
    }

    #[test]
    fn explicit_mapping_takes_precedence() {
        let registry = MappingRegistry::new(loader());
        let custom = ObjectMapping::new(
            "Widget",
            vec![FieldMapping::new("name", MappingKind::Scalar(ValueType::Text)).stored_as("label")],
        )
        .unwrap();
        registry.register_mapping(custom).unwrap();
        let mapping = registry.get_mapping("Widget").unwrap();
        assert_eq!(mapping.fields()[0].storage_name(), "label");

        let bogus = ObjectMapping::new(
            "Widget",
            vec![FieldMapping::new("weight", MappingKind::Scalar(ValueType::Integer))],
        )
        .unwrap();
        assert!(matches!(
            registry.register_mapping(bogus),
            Err(StoreError::UnknownField { .. })
        ));
    }

    #[test]
    fn concurrent_first_access_creates_once() {
        let created = Arc::new(AtomicUsize::new(0));
        let counter = created.clone();
        let factory = move |spec: &ObjectSpecification, loader: &dyn SpecificationLoader| {
            counter.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(std::time::Duration::from_millis(5));
            ObjectMapping::auto(spec, loader, false)
        };
        let registry = Arc::new(MappingRegistry::with_default_factory(
            loader(),
            Arc::new(factory),
        ));

        let barrier = Arc::new(Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    registry.get_mapping("Widget").unwrap()
                })
            })
            .collect();
        let mappings: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert!(mappings.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    }
}
