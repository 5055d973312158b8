use proc_macro::TokenStream;

mod field_utils;
mod naked_object;

/// 裸对象宏
/// - 为具名字段结构体实现 `::nos_domain::metamodel::DomainType`，由字段类型推导元模型描述
/// - 标量：`String`、整数、浮点、`bool`、`NaiveDate`、`DateTime<_>`（可包在 `Option`/`Box` 中）
/// - `Vec<T>` 为一对多集合，其他类型为单值引用，目标类型名取自 `<T as DomainType>::TYPE`
/// - 支持参数：`#[naked_object(name = "...", title = "a, b", aggregated)]`
/// - 字段属性：`#[naked(aggregated)]`、`#[naked(skip)]`、`#[naked(target = "T")]`
#[proc_macro_attribute]
pub fn naked_object(attr: TokenStream, item: TokenStream) -> TokenStream {
    naked_object::expand(attr, item)
}
