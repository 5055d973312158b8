use nos_domain::metamodel::{DomainType, FieldKind};
use nos_macros::naked_object;

#[naked_object(name = "order")]
struct Order {
    number: i64,
    customer: Customer,
    #[naked(aggregated)]
    lines: Vec<OrderLine>,
    watchers: Vec<Customer>,
}

#[naked_object]
struct Customer {
    name: String,
}

#[naked_object(aggregated = true)]
struct OrderLine {
    quantity: u32,
    price: f64,
}

fn main() {
    let spec = Order::specification();
    assert_eq!(spec.type_name(), "order");
    assert_eq!(
        spec.field("customer").map(|f| f.kind().clone()),
        Some(FieldKind::Reference {
            target: "Customer".to_string(),
            aggregated: false,
        })
    );
    assert_eq!(
        spec.field("lines").map(|f| f.kind().clone()),
        Some(FieldKind::Collection {
            element: "OrderLine".to_string(),
            aggregated: true,
        })
    );
    assert!(spec.field("watchers").is_some_and(|f| f.is_collection()));
    assert!(OrderLine::specification().is_aggregated());
    assert!(!Customer::specification().is_aggregated());
}
