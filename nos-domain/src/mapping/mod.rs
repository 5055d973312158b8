//! 字段/类型映射（mapping）
//!
//! - `record`：映射层与存储后端之间的中立记录形态；
//! - `object_mapping`：封闭的映射变体与 `decompose`/`recompose`；
//! - `registry`：并发安全的按类型映射注册表。
//!
mod object_mapping;
mod record;
mod registry;

pub use object_mapping::{
    FieldMapping, MappingContext, MappingKind, ObjectMapping, REFERENCE_DELIMITER,
};
pub use record::{Record, RecordValue, StoredRecord};
pub use registry::{AutoMapper, MappingFactory, MappingRegistry};
