//! JSON shape classification through the full pipeline.

use pretty_assertions::assert_eq;

use sproc_analysis::{analysis, AnalysisContext, ProcedureDescriptor};

use crate::common::SnapshotBuilder;

fn analyze(store: &crate::common::TestStore) -> Vec<ProcedureDescriptor> {
    let ctx = AnalysisContext::new("dbo");
    analysis::load_descriptors(&store.root, &ctx).expect("analysis should succeed")
}

#[test]
fn for_json_set_keeps_logical_fields() {
    let store = SnapshotBuilder::new()
        .table("dbo", "Customers", &[("Id", "int", false), ("Name", "nvarchar(100)", false)])
        .procedure(
            "dbo",
            "GetCustomersJson",
            "SELECT c.Id, c.Name FROM Customers c FOR JSON PATH, ROOT('customers')",
        )
        .build();

    let descriptors = analyze(&store);
    let set = &descriptors[0].result_sets[0];
    assert!(set.returns_json);
    assert!(set.returns_json_array);
    assert_eq!(set.json_root.as_deref(), Some("customers"));

    // The logical shape survives: two typed fields, not one text column
    assert_eq!(set.fields.len(), 2);
    assert_eq!(set.fields[0].sql_type.as_deref(), Some("int"));
    assert_eq!(set.fields[1].sql_type.as_deref(), Some("nvarchar(100)"));
}

#[test]
fn without_array_wrapper_is_single_object() {
    let store = SnapshotBuilder::new()
        .table("dbo", "Customers", &[("Id", "int", false)])
        .procedure(
            "dbo",
            "GetCustomerJson",
            "SELECT c.Id FROM Customers c FOR JSON PATH, WITHOUT_ARRAY_WRAPPER",
        )
        .build();

    let descriptors = analyze(&store);
    let set = &descriptors[0].result_sets[0];
    assert!(set.returns_json);
    assert!(!set.returns_json_array);
    // A one-field JSON payload is not a scalar result
    assert!(!set.is_scalar);
}

#[test]
fn nested_json_subquery_does_not_mark_outer_set() {
    let store = SnapshotBuilder::new()
        .table("dbo", "Customers", &[("Id", "int", false)])
        .table("dbo", "Orders", &[("Id", "int", false), ("CustomerId", "int", false)])
        .procedure(
            "dbo",
            "GetCustomersWithOrders",
            "SELECT c.Id, (SELECT o.Id FROM Orders o WHERE o.CustomerId = c.Id FOR JSON PATH) AS orders FROM Customers c",
        )
        .build();

    let descriptors = analyze(&store);
    let set = &descriptors[0].result_sets[0];
    assert!(!set.returns_json);
    assert_eq!(set.fields.len(), 2);
    assert_eq!(set.fields[1].name, "orders");
}

#[test]
fn json_sets_mix_with_plain_sets() {
    let store = SnapshotBuilder::new()
        .table("dbo", "Orders", &[("Id", "int", false)])
        .procedure(
            "dbo",
            "GetOrdersTwice",
            "SELECT o.Id FROM Orders o; SELECT o.Id FROM Orders o FOR JSON PATH",
        )
        .build();

    let descriptors = analyze(&store);
    let sets = &descriptors[0].result_sets;
    assert_eq!(sets.len(), 2);
    assert!(!sets[0].returns_json);
    assert!(sets[0].is_scalar);
    assert!(sets[1].returns_json);
    assert!(!sets[1].is_scalar);
    assert_eq!(sets[0].name, "Orders");
    assert_eq!(sets[1].name, "Orders2");
}
