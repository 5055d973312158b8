//! 存储运行时
//!
//! 一个对象存储内共享的协作方：配置、元模型、映射注册表、标识生成器、
//! 加密与对象缓存。显式传递给命令与查询，不使用全局状态。
//!
use crate::cache::ObjectCache;
use crate::config::StoreConfig;
use nos_domain::adapter::{ObjectAdapter, ObjectRef};
use nos_domain::encryption::DataEncryption;
use nos_domain::error::{StoreError, StoreResult};
use nos_domain::generator::{IdentifierGenerator, SequenceSource};
use nos_domain::key::KeyKind;
use nos_domain::mapping::{AutoMapper, MappingContext, MappingRegistry, ObjectMapping};
use nos_domain::metamodel::{ObjectSpecification, SpecificationLoader};
use nos_domain::oid::Oid;
use std::sync::Arc;

pub struct StoreRuntime {
    config: StoreConfig,
    specifications: Arc<dyn SpecificationLoader>,
    mappings: MappingRegistry,
    generator: IdentifierGenerator,
    encryption: Arc<dyn DataEncryption>,
    cache: ObjectCache,
}

impl StoreRuntime {
    pub fn new(
        config: StoreConfig,
        specifications: Arc<dyn SpecificationLoader>,
    ) -> StoreResult<Self> {
        config.validate()?;
        let generator = IdentifierGenerator::new(config.id_batch_size())?;
        let encryption = config.encryption().cipher()?;
        let mappings = MappingRegistry::with_default_factory(
            specifications.clone(),
            Arc::new(AutoMapper::new(config.encryption().is_enabled())),
        );
        Ok(Self {
            config,
            specifications,
            mappings,
            generator,
            encryption,
            cache: ObjectCache::new(),
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn mappings(&self) -> &MappingRegistry {
        &self.mappings
    }

    pub fn generator(&self) -> &IdentifierGenerator {
        &self.generator
    }

    pub fn encryption(&self) -> &dyn DataEncryption {
        self.encryption.as_ref()
    }

    pub fn cache(&self) -> &ObjectCache {
        &self.cache
    }

    pub fn specification(&self, type_name: &str) -> StoreResult<Arc<ObjectSpecification>> {
        self.specifications
            .load_specification(type_name)
            .ok_or_else(|| StoreError::MissingSpecification {
                type_name: type_name.to_string(),
            })
    }

    /// 缓存中的实例，或新登记的占位对象
    pub fn ghost(&self, oid: Oid) -> StoreResult<ObjectRef> {
        if let Some(object) = self.cache.get(&oid) {
            return Ok(object);
        }
        let spec = self.specification(oid.type_name())?;
        Ok(self
            .cache
            .get_or_insert_with(oid.clone(), || ObjectAdapter::new_ghost(spec, oid)))
    }
}

/// 一次分解/重组过程的映射上下文
pub struct MappingSession<'a> {
    runtime: &'a StoreRuntime,
    source: Option<&'a mut dyn SequenceSource>,
}

impl<'a> MappingSession<'a> {
    /// 写入：聚合元素的局部标识从 `source` 预取
    pub fn writing(runtime: &'a StoreRuntime, source: &'a mut dyn SequenceSource) -> Self {
        Self {
            runtime,
            source: Some(source),
        }
    }

    pub fn reading(runtime: &'a StoreRuntime) -> Self {
        Self {
            runtime,
            source: None,
        }
    }
}

impl MappingContext for MappingSession<'_> {
    fn mapping_for(&self, type_name: &str) -> StoreResult<Arc<ObjectMapping>> {
        self.runtime.mappings.get_mapping(type_name)
    }

    fn specification(&self, type_name: &str) -> StoreResult<Arc<ObjectSpecification>> {
        self.runtime.specification(type_name)
    }

    fn next_aggregate_id(&mut self) -> StoreResult<u64> {
        match self.source.as_deref_mut() {
            Some(source) => self.runtime.generator.next_aggregate_local_identifier(source),
            None => Err(StoreError::illegal_state(
                "aggregate ids are only assigned while writing",
            )),
        }
    }

    fn encryption(&self) -> &dyn DataEncryption {
        self.runtime.encryption()
    }

    fn key_kind(&self) -> KeyKind {
        self.runtime.config.key_kind()
    }

    fn reference(&self, oid: Oid) -> StoreResult<ObjectRef> {
        self.runtime.ghost(oid)
    }
}
