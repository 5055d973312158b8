use crate::field_utils::{FieldShape, classify, is_scalar, take_naked_attrs};
use proc_macro::TokenStream;
use quote::quote;
use syn::punctuated::Punctuated;
use syn::spanned::Spanned;
use syn::{Item, LitStr, Result, Token, parse::Parse, parse::ParseStream, parse_macro_input};

/// #[naked_object] 宏实现
/// - 仅支持具名字段结构体，原样输出结构体（去掉字段上的 `#[naked(...)]`）
/// - 为结构体实现 `::nos_domain::metamodel::DomainType`
/// - 参数：`name = "..."`（默认结构体名）、`title = "a, b"`、`aggregated`
pub(crate) fn expand(attr: TokenStream, item: TokenStream) -> TokenStream {
    let cfg = parse_macro_input!(attr as NakedObjectAttrConfig);
    let input = parse_macro_input!(item as Item);

    let mut st = match input {
        Item::Struct(s) => s,
        other => {
            return syn::Error::new(other.span(), "#[naked_object] only on struct")
                .to_compile_error()
                .into();
        }
    };

    match build(&cfg, &mut st) {
        Ok(spec_impl) => TokenStream::from(quote! {
            #st
            #spec_impl
        }),
        Err(e) => e.to_compile_error().into(),
    }
}

fn build(
    cfg: &NakedObjectAttrConfig,
    st: &mut syn::ItemStruct,
) -> Result<proc_macro2::TokenStream> {
    let span = st.span();
    let fields_named = match &mut st.fields {
        syn::Fields::Named(f) => f,
        _ => return Err(syn::Error::new(span, "only supports named-field struct")),
    };

    let mut field_specs = Vec::new();
    let mut field_names = Vec::new();
    for field in fields_named.named.iter_mut() {
        let attrs = take_naked_attrs(field)?;
        if attrs.skip {
            continue;
        }
        let Some(ident) = field.ident.as_ref() else {
            continue;
        };
        let name = ident.to_string();
        let aggregated = attrs.aggregated;
        let target_of = |ty: &syn::Type| match &attrs.target {
            Some(lit) => quote! { #lit },
            None => quote! { <#ty as ::nos_domain::metamodel::DomainType>::TYPE },
        };

        let spec = match classify(&field.ty) {
            FieldShape::Value(kind) => {
                let variant = syn::Ident::new(kind, field.ty.span());
                quote! {
                    ::nos_domain::metamodel::FieldSpec::value(
                        #name,
                        ::nos_domain::value::ValueType::#variant,
                    )
                }
            }
            FieldShape::Reference(ty) => {
                let target = target_of(ty);
                quote! {
                    ::nos_domain::metamodel::FieldSpec::new(
                        #name,
                        ::nos_domain::metamodel::FieldKind::Reference {
                            target: ::std::string::ToString::to_string(#target),
                            aggregated: #aggregated,
                        },
                    )
                }
            }
            FieldShape::Collection(ty) if is_scalar(ty) => {
                return Err(syn::Error::new(
                    field.ty.span(),
                    "collections of scalar values are not persistable; mark the field #[naked(skip)]",
                ));
            }
            FieldShape::Collection(ty) => {
                let element = target_of(ty);
                quote! {
                    ::nos_domain::metamodel::FieldSpec::new(
                        #name,
                        ::nos_domain::metamodel::FieldKind::Collection {
                            element: ::std::string::ToString::to_string(#element),
                            aggregated: #aggregated,
                        },
                    )
                }
            }
        };
        field_specs.push(spec);
        field_names.push(name);
    }

    // 标题属性必须是已声明且未跳过的字段
    let title_fields: Vec<String> = match &cfg.title {
        Some(lit) => {
            let mut names = Vec::new();
            for part in lit.value().split(',').map(str::trim).filter(|s| !s.is_empty()) {
                if !field_names.iter().any(|n| n == part) {
                    return Err(syn::Error::new(
                        lit.span(),
                        format!("title field '{part}' is not a persisted field"),
                    ));
                }
                names.push(part.to_string());
            }
            names
        }
        None => Vec::new(),
    };

    let ident = &st.ident;
    let type_name = cfg
        .name
        .as_ref()
        .map(LitStr::value)
        .unwrap_or_else(|| ident.to_string());
    let aggregated = cfg.aggregated;
    let (impl_generics, ty_generics, where_clause) = st.generics.split_for_impl();

    Ok(quote! {
        impl #impl_generics ::nos_domain::metamodel::DomainType for #ident #ty_generics #where_clause {
            const TYPE: &'static str = #type_name;

            fn specification() -> ::nos_domain::metamodel::ObjectSpecification {
                ::nos_domain::metamodel::ObjectSpecification::builder()
                    .type_name(<Self as ::nos_domain::metamodel::DomainType>::TYPE)
                    .fields(::std::vec![#(#field_specs),*])
                    .title_fields(::std::vec![#(::std::string::String::from(#title_fields)),*])
                    .aggregated(#aggregated)
                    .build()
            }
        }
    })
}

// -------- parsing --------

struct NakedObjectAttrConfig {
    name: Option<LitStr>,
    title: Option<LitStr>,
    aggregated: bool,
}

impl Parse for NakedObjectAttrConfig {
    fn parse(input: ParseStream) -> Result<Self> {
        let mut cfg = Self {
            name: None,
            title: None,
            aggregated: false,
        };
        if input.is_empty() {
            return Ok(cfg);
        }

        let pairs: Punctuated<NakedObjectAttrElem, Token![,]> =
            Punctuated::parse_terminated(input)?;
        for elem in pairs {
            match elem {
                NakedObjectAttrElem::Name(lit) => {
                    if cfg.name.replace(lit).is_some() {
                        return Err(duplicate("name"));
                    }
                }
                NakedObjectAttrElem::Title(lit) => {
                    if cfg.title.replace(lit).is_some() {
                        return Err(duplicate("title"));
                    }
                }
                NakedObjectAttrElem::Aggregated(b) => cfg.aggregated = b,
            }
        }
        Ok(cfg)
    }
}

fn duplicate(key: &str) -> syn::Error {
    syn::Error::new(
        proc_macro2::Span::call_site(),
        format!("duplicate key '{key}' in attribute"),
    )
}

enum NakedObjectAttrElem {
    Name(LitStr),
    Title(LitStr),
    Aggregated(bool),
}

impl Parse for NakedObjectAttrElem {
    fn parse(input: ParseStream) -> Result<Self> {
        let key: syn::Ident = input.parse()?;
        if key == "aggregated" {
            if input.peek(Token![=]) {
                let _eq: Token![=] = input.parse()?;
                let b: syn::LitBool = input.parse()?;
                return Ok(Self::Aggregated(b.value()));
            }
            return Ok(Self::Aggregated(true));
        }

        let _eq: Token![=] = input.parse()?;
        let lit: LitStr = input.parse()?;
        if key == "name" {
            Ok(Self::Name(lit))
        } else if key == "title" {
            Ok(Self::Title(lit))
        } else {
            Err(syn::Error::new(
                key.span(),
                "unknown key in attribute; expected 'name', 'title' or 'aggregated'",
            ))
        }
    }
}
