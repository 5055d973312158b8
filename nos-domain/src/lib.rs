//! 对象存储领域核心（nos-domain）
//!
//! 在内存中的领域对象图与外部存储表示之间做转换所需的基础构件：
//! - 主键（`key`）与对象标识（`oid`）：临时 -> 持久的生命周期与前驱标识
//! - 版本戳（`version`）：乐观并发控制
//! - 标识生成器（`generator`）：批量预取的持久标识与聚合内局部标识
//! - 元模型契约（`metamodel`）与对象适配器（`adapter`）
//! - 字段/类型映射（`mapping`）与静态数据变换（`encryption`）
//!
//! 本 crate 不包含任何存储实现，连接、事务与后端位于 `nos-store`。
//!
//! 典型用法：
//! 1. 用 `#[naked_object]` 或 `ObjectSpecification::builder()` 描述领域类型；
//! 2. 将规格注册到 `SpecificationRegistry`；
//! 3. 由 `MappingRegistry` 按需推导映射，在对象与 `Record` 之间分解/重组。
//!
pub mod adapter;
pub mod encryption;
pub mod error;
pub mod generator;
pub mod key;
pub mod mapping;
pub mod metamodel;
pub mod oid;
pub mod value;
pub mod version;

// 允许在本 crate 内部通过 ::nos_domain 进行自引用，
// 以便过程宏在本 crate 的单元测试中也能解析到 ::nos_domain 路径。
extern crate self as nos_domain;
