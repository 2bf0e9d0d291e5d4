//! Table metadata cache behavior observed through whole analysis runs.

use pretty_assertions::assert_eq;

use sproc_analysis::{analysis, AnalysisContext};

use crate::common::SnapshotBuilder;

#[test]
fn stale_metadata_persists_until_invalidated() {
    // Customers exists from the start so the tables directory is present
    let store = SnapshotBuilder::new()
        .table("dbo", "Customers", &[("Id", "int", false)])
        .procedure("dbo", "GetOrderIds", "SELECT o.Id FROM Orders o")
        .build();

    let ctx = AnalysisContext::new("dbo");
    let first = analysis::load_descriptors(&store.root, &ctx).unwrap();
    assert!(first[0].result_sets[0].fields[0].sql_type.is_none());

    // Orders appears after the first run; within the TTL window the cached
    // snapshot still rules
    store.write_table("dbo", "Orders", &[("Id", "int", false)]);
    let stale = analysis::load_descriptors(&store.root, &ctx).unwrap();
    assert!(stale[0].result_sets[0].fields[0].sql_type.is_none());

    ctx.registry
        .cache_for(&store.tables_dir())
        .invalidate();
    let fresh = analysis::load_descriptors(&store.root, &ctx).unwrap();
    assert_eq!(
        fresh[0].result_sets[0].fields[0].sql_type.as_deref(),
        Some("int")
    );
}

#[test]
fn separate_contexts_do_not_share_caches() {
    let store = SnapshotBuilder::new()
        .table("dbo", "Customers", &[("Id", "int", false)])
        .procedure("dbo", "GetOrderIds", "SELECT o.Id FROM Orders o")
        .build();

    let first_ctx = AnalysisContext::new("dbo");
    let first = analysis::load_descriptors(&store.root, &first_ctx).unwrap();
    assert!(first[0].result_sets[0].fields[0].sql_type.is_none());

    // A fresh context has no warm cache and sees the new table immediately
    store.write_table("dbo", "Orders", &[("Id", "int", false)]);
    let second_ctx = AnalysisContext::new("dbo");
    let second = analysis::load_descriptors(&store.root, &second_ctx).unwrap();
    assert_eq!(
        second[0].result_sets[0].fields[0].sql_type.as_deref(),
        Some("int")
    );
}
