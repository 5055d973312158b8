use syn::{Attribute, Field, GenericArgument, LitStr, PathArguments, Type};

/// 字段在元模型中的形态
pub(crate) enum FieldShape<'a> {
    /// 标量，携带 `ValueType` 变体名
    Value(&'static str),
    Reference(&'a Type),
    Collection(&'a Type),
}

/// `#[naked(...)]` 字段属性
#[derive(Default)]
pub(crate) struct NakedFieldAttrs {
    pub(crate) aggregated: bool,
    pub(crate) skip: bool,
    pub(crate) target: Option<LitStr>,
}

/// 解析并移除字段上的 `#[naked(...)]`，其余属性保留
pub(crate) fn take_naked_attrs(field: &mut Field) -> syn::Result<NakedFieldAttrs> {
    let mut parsed = NakedFieldAttrs::default();
    let mut retained: Vec<Attribute> = Vec::new();
    for attr in field.attrs.drain(..) {
        if !attr.path().is_ident("naked") {
            retained.push(attr);
            continue;
        }
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("aggregated") {
                parsed.aggregated = true;
                Ok(())
            } else if meta.path.is_ident("skip") {
                parsed.skip = true;
                Ok(())
            } else if meta.path.is_ident("target") {
                parsed.target = Some(meta.value()?.parse()?);
                Ok(())
            } else {
                Err(meta.error("unknown key; expected 'aggregated', 'skip' or 'target'"))
            }
        })?;
    }
    field.attrs = retained;
    Ok(parsed)
}

// 取路径类型最后一段及其唯一的泛型参数
fn last_segment(ty: &Type) -> Option<(String, Option<&Type>)> {
    let Type::Path(tp) = ty else {
        return None;
    };
    if tp.qself.is_some() {
        return None;
    }
    let seg = tp.path.segments.last()?;
    let arg = match &seg.arguments {
        PathArguments::AngleBracketed(args) => args.args.iter().find_map(|a| match a {
            GenericArgument::Type(t) => Some(t),
            _ => None,
        }),
        _ => None,
    };
    Some((seg.ident.to_string(), arg))
}

/// 去掉 `Option<_>`、`Box<_>` 与引用外层
pub(crate) fn unwrap_wrappers(ty: &Type) -> &Type {
    if let Type::Reference(r) = ty {
        return unwrap_wrappers(&r.elem);
    }
    match last_segment(ty) {
        Some((name, Some(inner))) if name == "Option" || name == "Box" => unwrap_wrappers(inner),
        _ => ty,
    }
}

pub(crate) fn classify(ty: &Type) -> FieldShape<'_> {
    let ty = unwrap_wrappers(ty);
    match last_segment(ty) {
        Some((name, Some(inner))) if name == "Vec" => FieldShape::Collection(unwrap_wrappers(inner)),
        Some((name, _)) => match scalar_kind(&name) {
            Some(kind) => FieldShape::Value(kind),
            None => FieldShape::Reference(ty),
        },
        None => FieldShape::Reference(ty),
    }
}

/// 标量类型不能作为集合元素
pub(crate) fn is_scalar(ty: &Type) -> bool {
    matches!(classify(ty), FieldShape::Value(_))
}

fn scalar_kind(ident: &str) -> Option<&'static str> {
    let kind = match ident {
        "String" | "str" => "Text",
        "i8" | "i16" | "i32" | "i64" | "isize" | "u8" | "u16" | "u32" | "u64" | "usize" => {
            "Integer"
        }
        "f32" | "f64" => "Decimal",
        "bool" => "Boolean",
        "NaiveDate" => "Date",
        "DateTime" => "DateTime",
        _ => return None,
    };
    Some(kind)
}
