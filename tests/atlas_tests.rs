//! End-to-end tests over the fixture registry
//!
//! The fixture under `tests/fixtures/registry` models a small selling
//! system: customers, orders with embedded items and an approval workflow,
//! invoices (one with a dangling cost center link), notes with a dynamic
//! reference, and three customizations on top.

use std::path::Path;
use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use kind_atlas::atlas::{Collaborators, RollbackRequest, RollbackResponse};
use kind_atlas::harness::TestOutcome;
use kind_atlas::introspect::{IntrospectRequest, Scope};
use kind_atlas::lineage::FieldSource;
use kind_atlas::loader;
use kind_atlas::monitor::MonitorRequest;
use kind_atlas::rollback::{RollbackAction, RollbackStatus};
use kind_atlas::search::{MatchType, SearchRequest};
use kind_atlas::store::{
    Action, ErrorRecord, MemoryErrorFeed, MemoryNotifier, MemoryPolicy, MemoryStore,
};
use kind_atlas::{Atlas, AtlasConfig, AtlasError, Caller, CustomizationStatus, EdgeKind};

fn fixtures_path() -> &'static Path {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures/registry")
        .leak()
}

fn open_atlas() -> Atlas {
    loader::open(AtlasConfig::default(), fixtures_path()).unwrap()
}

/// Atlas over the fixture kinds with hand-picked collaborators
fn atlas_with(policy: MemoryPolicy, errors: Vec<ErrorRecord>, notifier: Arc<MemoryNotifier>) -> Atlas {
    let loaded = loader::load_from_directory(fixtures_path()).unwrap();
    let collaborators = Collaborators {
        store: Arc::new(MemoryStore::with_records(loaded.records)),
        policy: Arc::new(policy),
        errors: Arc::new(MemoryErrorFeed::new(errors)),
        notifier,
    };
    Atlas::new(AtlasConfig::default(), loaded.customizations, collaborators)
}

// =============================================================================
// Relationship mapping
// =============================================================================

#[test]
fn test_customer_is_linked_from_order() {
    let atlas = open_atlas();
    let map = atlas.map_relationships("Customer", Some(1), None).unwrap();

    let linking: Vec<&str> = map.links_from.iter().map(|e| e.kind.as_str()).collect();
    assert!(linking.contains(&"Order"));
    assert!(linking.contains(&"Invoice"));
    assert!(map.links_from.iter().all(|e| e.hop == 1));
    // `owner` is a standard field and skipped by default
    assert!(map.links_to.iter().all(|e| e.kind != "User"));

    let with_standard = atlas.map_relationships("Customer", Some(1), Some(true)).unwrap();
    assert!(with_standard.links_to.iter().any(|e| e.kind == "User"));
}

#[test]
fn test_order_map_covers_every_edge_kind() {
    let atlas = open_atlas();
    let map = atlas.map_relationships("order", Some(1), None).unwrap();

    assert_eq!(map.kind, "Order");
    assert_eq!(map.embedded_children[0].kind, "Order Item");
    assert_eq!(map.workflow_edges[0].kind, "Invoice");
    assert_eq!(map.workflow_edges[0].edge_kind, EdgeKind::WorkflowLink);
    assert_eq!(map.auto_derived_fields[0].derived_from, "customer.full_name");
    assert_eq!(map.workflow.as_ref().unwrap().transitions.len(), 2);
    assert!(map.summary.starts_with("Order: links to 1 kinds"));

    let note = atlas.map_relationships("Note", Some(2), None).unwrap();
    assert!(note.links_to.iter().all(|e| e.potential && e.hop == 1));
    assert_eq!(note.links_to.len(), 2);
}

#[test]
fn test_dangling_link_degrades_to_warning() {
    let atlas = open_atlas();
    let map = atlas.map_relationships("Invoice", Some(1), None).unwrap();

    assert_eq!(map.warnings.len(), 1);
    assert_eq!(map.warnings[0].target, "Cost Center");
    let targets: Vec<&str> = map.links_to.iter().map(|e| e.kind.as_str()).collect();
    assert_eq!(targets, vec!["Customer", "Order"]);
}

#[test]
fn test_depth_never_exceeds_request() {
    let atlas = open_atlas();
    for depth in 1..=3 {
        let map = atlas.map_relationships("Invoice", Some(depth), None).unwrap();
        assert!(map.entries().all(|e| e.hop <= depth));
    }
    let clamped = atlas.map_relationships("Invoice", Some(50), None).unwrap();
    assert_eq!(clamped.depth, AtlasConfig::default().graph.max_depth);
}

// =============================================================================
// Lineage
// =============================================================================

#[test]
fn test_explore_derived_field() {
    let atlas = open_atlas();
    let lineage = atlas.explore_fields("Order", "customer_name").unwrap();

    assert!(matches!(lineage.source, FieldSource::Derived { .. }));
    let origin = lineage.origin().unwrap();
    assert_eq!((origin.kind.as_str(), origin.field.as_str()), ("Customer", "full_name"));

    let visibility = atlas
        .explore_fields("Order", "cancel_reason")
        .unwrap()
        .visibility
        .unwrap();
    assert!(visibility.is_valid());
    assert_eq!(visibility.bindings, vec!["status"]);

    assert!(matches!(
        atlas.explore_fields("Order", "nope"),
        Err(AtlasError::NotFound { .. })
    ));
}

#[test]
fn test_field_overview_sections() {
    let atlas = open_atlas();
    let overview = atlas.field_overview("Order", None).unwrap();
    let labels: Vec<&str> = overview.sections.iter().map(|s| s.label.as_str()).collect();
    assert_eq!(labels, vec!["Default", "Items"]);

    let items = atlas.field_overview("Order", Some("item")).unwrap();
    assert_eq!(items.sections.len(), 1);
}

// =============================================================================
// Search
// =============================================================================

#[tokio::test]
async fn test_exact_number_beats_text_substring() {
    let atlas = open_atlas();
    let outcome = atlas
        .universal_search(&Caller::system(), &SearchRequest::new("7500").limit(10))
        .await
        .unwrap();

    assert_eq!(outcome.hits.len(), 2);
    assert_eq!(outcome.hits[0].kind, "Invoice");
    assert_eq!(outcome.hits[0].match_type, MatchType::Exact);
    assert_eq!(outcome.hits[1].kind, "Note");
    assert_eq!(outcome.hits[1].match_type, MatchType::Substring);
    assert!(outcome.partial_failures.is_empty());
    assert!(!outcome.searched_kinds.contains(&"Order Item".to_string()));
}

#[tokio::test]
async fn test_search_skips_unreadable_kinds() {
    let atlas = atlas_with(
        MemoryPolicy::allow_all().deny("guest", "Invoice", Action::Read),
        Vec::new(),
        Arc::new(MemoryNotifier::default()),
    );
    let outcome = atlas
        .universal_search(&Caller::new("guest"), &SearchRequest::new("7500"))
        .await
        .unwrap();

    assert_eq!(outcome.hits.len(), 1);
    assert_eq!(outcome.hits[0].kind, "Note");
}

// =============================================================================
// Rollback
// =============================================================================

#[tokio::test]
async fn test_rollback_round_trip_and_delete_safety() {
    let notifier = Arc::new(MemoryNotifier::default());
    let atlas = atlas_with(MemoryPolicy::allow_all(), Vec::new(), notifier.clone());
    let caller = Caller::system();
    let request = |action, id: &str| RollbackRequest {
        action,
        target_type: None,
        target_id: Some(id.to_string()),
        kind: None,
    };

    let blocked = match atlas
        .rollback_changes(&caller, &request(RollbackAction::Delete, "cf-region"))
        .await
        .unwrap()
    {
        RollbackResponse::Transition(result) => result,
        other => panic!("expected transition, got {other:?}"),
    };
    assert_eq!(blocked.status, RollbackStatus::Blocked);
    assert_eq!(blocked.blocking_dependents, vec!["ss-region"]);
    assert_eq!(blocked.state.status, CustomizationStatus::Active);

    let before = atlas.customizations().get("ps-grand-total-label").unwrap();
    let disabled = match atlas
        .rollback_changes(&caller, &request(RollbackAction::Disable, "ps-grand-total-label"))
        .await
        .unwrap()
    {
        RollbackResponse::Transition(result) => result,
        other => panic!("expected transition, got {other:?}"),
    };
    let entry = atlas.rollback().audit_entry(disabled.audit_id.unwrap()).unwrap();
    assert_eq!(entry.before, before);
    assert!(entry.diff().contains("-  \"status\": \"active\""));
    let label = |atlas: &Atlas| {
        atlas
            .snapshot()
            .kind("Invoice")
            .and_then(|k| k.field("grand_total"))
            .and_then(|f| f.label.clone())
    };
    assert_eq!(label(&atlas), None);

    atlas
        .rollback_changes(&caller, &request(RollbackAction::Enable, "ps-grand-total-label"))
        .await
        .unwrap();
    assert_eq!(atlas.customizations().get("ps-grand-total-label").unwrap(), before);
    assert_eq!(label(&atlas).as_deref(), Some("Amount Due"));
    assert_eq!(atlas.rollback().history("ps-grand-total-label").len(), 2);
    assert_eq!(notifier.events().len(), 2);

    // Script first, then the field it referenced
    atlas
        .rollback_changes(&caller, &request(RollbackAction::Delete, "ss-region"))
        .await
        .unwrap();
    let deleted = atlas
        .rollback_changes(&caller, &request(RollbackAction::Delete, "cf-region"))
        .await
        .unwrap();
    assert!(matches!(
        deleted,
        RollbackResponse::Transition(ref r) if r.status == RollbackStatus::Applied
    ));
    assert!(atlas.snapshot().kind("Customer").unwrap().field("region").is_none());
}

#[tokio::test]
async fn test_rollback_list_and_type_check() {
    let atlas = open_atlas();
    let caller = Caller::system();
    let listed = atlas
        .rollback_changes(
            &caller,
            &RollbackRequest {
                action: RollbackAction::List,
                target_type: None,
                target_id: None,
                kind: Some("customer".to_string()),
            },
        )
        .await
        .unwrap();
    match listed {
        RollbackResponse::Listed { count, .. } => assert_eq!(count, 2),
        other => panic!("expected list, got {other:?}"),
    }

    let mismatch = atlas
        .rollback_changes(
            &caller,
            &RollbackRequest {
                action: RollbackAction::Disable,
                target_type: Some(kind_atlas::customization::CustomizationKind::Script),
                target_id: Some("cf-region".to_string()),
                kind: None,
            },
        )
        .await;
    assert!(matches!(mismatch, Err(AtlasError::ValidationFailure(_))));
}

// =============================================================================
// Harness, monitor, introspection
// =============================================================================

#[tokio::test]
async fn test_created_item_passes_and_cleans_up() {
    let atlas = open_atlas();
    let payload = serde_json::json!({"name": "Test"}).as_object().cloned().unwrap();
    let run = atlas
        .test_created_item(&Caller::system(), "Customer", payload)
        .await
        .unwrap();

    assert_eq!(run.outcome, TestOutcome::Pass);
    assert_eq!(run.filled_fields, vec!["full_name"]);
    let search = atlas
        .universal_search(
            &Caller::system(),
            &SearchRequest {
                kind: Some("Customer".to_string()),
                ..SearchRequest::new("__test__")
            },
        )
        .await
        .unwrap();
    assert!(search.hits.is_empty());
}

#[tokio::test]
async fn test_monitor_over_recent_errors() {
    let now = Utc::now();
    let error = |id: &str, minutes_ago: i64| ErrorRecord {
        id: id.to_string(),
        timestamp: now - ChronoDuration::minutes(minutes_ago),
        method: Some("invoice.submit".to_string()),
        message: format!("MandatoryError: Invoice INV-{:05} missing customer", minutes_ago),
    };
    let atlas = atlas_with(
        MemoryPolicy::allow_all(),
        vec![error("e1", 1), error("e2", 2), error("e3", 3), error("p1", 90)],
        Arc::new(MemoryNotifier::default()),
    );

    let report = atlas.monitor_errors(&MonitorRequest::default()).await.unwrap();
    assert_eq!(report.total, 3);
    assert_eq!(report.groups.len(), 1);
    let group = &report.groups[0];
    assert_eq!(group.signature, "MandatoryError: Invoice INV-<n> missing customer");
    assert_eq!(group.prior_count, 1);
    assert!(group.trending);
    assert!(group.suggestion.contains("required field"));
}

#[test]
fn test_introspect_all() {
    let atlas = open_atlas();
    let report = atlas.introspect_system(&IntrospectRequest::new(Scope::All)).unwrap();

    assert_eq!(report.apps.as_ref().unwrap().len(), 2);
    assert_eq!(report.kinds.as_ref().unwrap().len(), 6);
    let customizations = report.customizations.as_ref().unwrap();
    assert_eq!(customizations.added_fields.count, 1);
    assert_eq!(customizations.scripts.count, 1);
    assert_eq!(customizations.property_overrides.count, 1);
    assert!(report.links.is_none());

    let mut links = IntrospectRequest::new(Scope::Links);
    links.kind = Some("Customer".to_string());
    let report = atlas.introspect_system(&links).unwrap();
    assert!(report.links.unwrap().incoming_count >= 2);
}

#[test]
fn test_graph_export() {
    let atlas = open_atlas();
    let dot = atlas.graph().to_dot();
    assert!(dot.contains("\"Order\" -> \"Invoice\" [label=\"status\", style=dotted]"));
    assert!(dot.contains("\"Order\" -> \"Order_Item\" [label=\"items\", style=bold]"));
    assert!(!dot.contains("Cost_Center"));
}
