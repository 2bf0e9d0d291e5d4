//! End-to-end descriptor assembly over a snapshot store on disk.

use pretty_assertions::assert_eq;
use serde_json::json;

use sproc_analysis::model::ReferenceKind;
use sproc_analysis::{analysis, AnalysisContext, AnalyzeOptions, ProcedureDescriptor};

use crate::common::SnapshotBuilder;

fn analyze(store: &crate::common::TestStore) -> Vec<ProcedureDescriptor> {
    let ctx = AnalysisContext::new("dbo");
    analysis::load_descriptors(&store.root, &ctx).expect("analysis should succeed")
}

#[test]
fn aggregates_resolve_through_heuristics() {
    let store = SnapshotBuilder::new()
        .table("dbo", "Orders", &[("Id", "int", false), ("Total", "decimal(18,2)", true)])
        .procedure(
            "dbo",
            "GetOrderStats",
            "SELECT COUNT(*) AS OrderCount, SUM(o.Total) AS GrandTotal FROM Orders o",
        )
        .build();

    let descriptors = analyze(&store);
    assert_eq!(descriptors.len(), 1);
    let set = &descriptors[0].result_sets[0];
    assert_eq!(set.name, "Orders");
    assert!(!set.is_scalar);

    let count = &set.fields[0];
    assert_eq!(count.name, "OrderCount");
    assert_eq!(count.sql_type.as_deref(), Some("int"));
    assert_eq!(count.is_nullable, Some(false));

    let total = &set.fields[1];
    assert_eq!(total.name, "GrandTotal");
    assert_eq!(total.sql_type.as_deref(), Some("decimal"));
    assert_eq!(total.is_nullable, Some(true));
}

#[test]
fn table_binding_resolves_types_and_nullability() {
    let store = SnapshotBuilder::new()
        .table("dbo", "Orders", &[("Id", "int", false), ("CustomerId", "int", false)])
        .table("dbo", "Customers", &[("Id", "int", false), ("Name", "nvarchar(100)", false)])
        .procedure(
            "dbo",
            "GetOrdersWithCustomer",
            "SELECT o.Id, c.Name FROM Orders o LEFT JOIN Customers c ON c.Id = o.CustomerId",
        )
        .build();

    let descriptors = analyze(&store);
    let set = &descriptors[0].result_sets[0];

    let id = &set.fields[0];
    assert_eq!(id.sql_type.as_deref(), Some("int"));
    assert_eq!(id.is_nullable, Some(false));

    // Customers sits on the nullable side of the LEFT JOIN
    let name = &set.fields[1];
    assert_eq!(name.sql_type.as_deref(), Some("nvarchar(100)"));
    assert_eq!(name.is_nullable, Some(true));
}

#[test]
fn cast_target_outranks_table_metadata() {
    let store = SnapshotBuilder::new()
        .table("dbo", "Orders", &[("Total", "decimal(18,2)", true)])
        .procedure(
            "dbo",
            "GetTotalsAsText",
            "SELECT CAST(o.Total AS varchar(20)) AS TotalText FROM Orders o",
        )
        .build();

    let descriptors = analyze(&store);
    let field = &descriptors[0].result_sets[0].fields[0];
    assert_eq!(field.sql_type.as_deref(), Some("varchar(20)"));
}

#[test]
fn user_defined_type_column_inherits_base_and_records_dependency() {
    let store = SnapshotBuilder::new()
        .scalar_type("dbo", "AccountCode", "nvarchar", Some(20))
        .table("dbo", "Accounts", &[("Code", "AccountCode", true)])
        .procedure("dbo", "GetAccountCodes", "SELECT a.Code FROM Accounts a")
        .build();

    let descriptors = analyze(&store);
    let field = &descriptors[0].result_sets[0].fields[0];
    assert_eq!(field.sql_type.as_deref(), Some("nvarchar(20)"));
    let reference = field.reference.as_ref().expect("UDT reference");
    assert_eq!(reference.kind, ReferenceKind::UserDefinedType);
    assert_eq!(reference.name, "AccountCode");

    assert!(descriptors[0]
        .dependencies
        .iter()
        .any(|d| d.kind == ReferenceKind::UserDefinedType && d.name == "AccountCode"));
}

#[test]
fn from_sources_classified_as_table_function_or_view() {
    let store = SnapshotBuilder::new()
        .table("dbo", "Orders", &[("Id", "int", false)])
        .function("dbo", "fnRates")
        .procedure(
            "dbo",
            "GetMixed",
            "SELECT o.Id FROM Orders o; SELECT r.Rate FROM fnRates r; SELECT v.Id FROM ActiveOrders v",
        )
        .build();

    let descriptors = analyze(&store);
    let deps = &descriptors[0].dependencies;
    let kind_of = |name: &str| {
        deps.iter()
            .find(|d| d.name.eq_ignore_ascii_case(name))
            .map(|d| d.kind)
    };
    assert_eq!(kind_of("Orders"), Some(ReferenceKind::Table));
    assert_eq!(kind_of("fnRates"), Some(ReferenceKind::Function));
    assert_eq!(kind_of("ActiveOrders"), Some(ReferenceKind::View));
}

#[test]
fn table_valued_parameter_becomes_table_type_reference() {
    let store = SnapshotBuilder::new()
        .procedure_document(
            "dbo",
            "SaveOrders",
            json!({
                "Schema": "dbo",
                "Name": "SaveOrders",
                "Definition": "SELECT 1 AS ok",
                "Inputs": [
                    { "Name": "@UserName", "SqlTypeName": "nvarchar", "MaxLength": 50 },
                    { "Name": "@Rows", "IsTableType": true, "TableTypeSchema": "dbo", "TableTypeName": "OrderRows" },
                    { "Name": "@SavedCount", "SqlTypeName": "int", "IsOutput": true }
                ]
            }),
        )
        .build();

    let descriptors = analyze(&store);
    let proc = &descriptors[0];
    assert_eq!(proc.input_parameters.len(), 2);
    assert_eq!(proc.input_parameters[0].name, "UserName");
    assert_eq!(proc.input_parameters[0].sql_type.as_deref(), Some("nvarchar(50)"));

    let rows = &proc.input_parameters[1];
    let reference = rows.reference.as_ref().expect("table type reference");
    assert_eq!(reference.kind, ReferenceKind::UserDefinedTableType);
    assert_eq!(reference.name, "OrderRows");

    assert_eq!(proc.output_fields.len(), 1);
    assert_eq!(proc.output_fields[0].name, "SavedCount");
    assert_eq!(proc.output_fields[0].sql_type.as_deref(), Some("int"));
}

#[test]
fn unparsed_exec_body_becomes_passthrough_set() {
    let store = SnapshotBuilder::new()
        .procedure("dbo", "Wrapper", "SELECT FROM FROM; EXEC dbo.GetOrders @Top = 5")
        .build();

    let descriptors = analyze(&store);
    let set = &descriptors[0].result_sets[0];
    let reference = set.reference.as_ref().expect("pass-through reference");
    assert_eq!(reference.kind, ReferenceKind::Procedure);
    assert_eq!(reference.name, "GetOrders");
    assert!(set.fields.is_empty());
}

#[test]
fn repeated_analysis_is_byte_identical() {
    let store = SnapshotBuilder::new()
        .table("dbo", "Orders", &[("Id", "int", false)])
        .procedure(
            "dbo",
            "GetMystery",
            "SELECT o.Id, x.Alpha + x.Beta AS Mystery FROM Orders o, Unknown x",
        )
        .build();

    let ctx = AnalysisContext::new("dbo");
    let first = analysis::load_descriptors(&store.root, &ctx).unwrap();
    let second = analysis::load_descriptors(&store.root, &ctx).unwrap();

    let mystery = first[0].result_sets[0]
        .fields
        .iter()
        .find(|f| f.name == "Mystery")
        .unwrap();
    assert!(mystery.sql_type.is_none());
    assert!(mystery.target_type.is_none());

    let first_json = serde_json::to_string(&first).unwrap();
    let second_json = serde_json::to_string(&second).unwrap();
    assert_eq!(first_json, second_json);
}

#[test]
fn unresolved_column_warns_once_across_runs() {
    let store = SnapshotBuilder::new()
        .table("dbo", "Orders", &[("Id", "int", false)])
        .procedure(
            "dbo",
            "GetMystery",
            "SELECT o.Id, x.Alpha + x.Beta AS Mystery FROM Orders o, Unknown x",
        )
        .build();

    let ctx = AnalysisContext::new("dbo");
    analysis::load_descriptors(&store.root, &ctx).unwrap();
    assert_eq!(ctx.warning_count(), 1);

    // The guard outlives the run, so a second analysis stays quiet
    analysis::load_descriptors(&store.root, &ctx).unwrap();
    analysis::load_descriptors(&store.root, &ctx).unwrap();
    assert_eq!(ctx.warning_count(), 1);
}

#[test]
fn analyze_project_entry_point() {
    let store = SnapshotBuilder::new()
        .table("dbo", "Orders", &[("Id", "int", false)])
        .procedure("dbo", "GetOrderIds", "SELECT o.Id FROM Orders o")
        .build();

    let descriptors =
        sproc_analysis::analyze_project(AnalyzeOptions::new(&store.root)).unwrap();
    assert_eq!(descriptors.len(), 1);
    assert_eq!(descriptors[0].full_name(), "[dbo].[GetOrderIds]");
}
