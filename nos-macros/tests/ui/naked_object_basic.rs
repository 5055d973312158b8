use nos_domain::metamodel::{DomainType, FieldKind};
use nos_domain::value::ValueType;
use nos_macros::naked_object;

#[naked_object(title = "first, last")]
struct Person {
    first: String,
    last: Option<String>,
    born: Option<chrono::NaiveDate>,
    active: bool,
    #[naked(target = "Address")]
    home: Option<Box<Address>>,
    #[naked(skip)]
    cache: Vec<u8>,
}

#[naked_object(name = "Address", aggregated)]
struct Address {
    street: String,
    zip: Option<u32>,
}

fn main() {
    let spec = Person::specification();
    assert_eq!(Person::TYPE, "Person");
    assert_eq!(spec.fields().len(), 5);
    assert_eq!(spec.title_fields(), ["first".to_string(), "last".to_string()]);
    assert_eq!(
        spec.field("born").map(|f| f.kind().clone()),
        Some(FieldKind::Value(ValueType::Date))
    );
    assert!(spec.field("cache").is_none());
    assert!(Address::specification().is_aggregated());

    let _ = Person {
        first: String::new(),
        last: None,
        born: None,
        active: true,
        home: None,
        cache: Vec::new(),
    };
    let _ = Address {
        street: String::new(),
        zip: None,
    };
}
