//! End-to-end runs of the engine against the in-memory provisioner.

use std::sync::Arc;
use std::time::Duration;

use stackform::config::{ConfigParser, StackDeclaration};
use stackform::engine::{DriftStatus, Engine, EngineConfig};
use stackform::error::{GraphError, ProviderError, StackformError};
use stackform::model::PropertyValue;
use stackform::planner::{CancelToken, Operation, ResourceState, RetryPolicy};
use stackform::provider::{CallKind, MemoryProvisioner};
use stackform::state::{LocalStateStore, MemoryStateStore, ObservedState, RunOperation, StateStore};
use tokio_test::{assert_err, assert_ok};

const NETWORK: &str = r"
  - name: vpc
    kind: network
    properties:
      cidr: 10.0.0.0/16
      availability_zones: [eu-west-1a]
      subnets:
        - { name: data, type: isolated }
";

const SECURITY_GROUP: &str = r"
  - name: web-sg
    kind: security_group
    properties:
      network: { ref: vpc }
";

const BUCKET: &str = r"
  - name: assets
    kind: bucket
    properties:
      bucket_name: shop-assets
";

fn declaration(resources: &str) -> StackDeclaration {
    let yaml = format!("stack:\n  name: shop\n  environment: test\nresources:\n{resources}");
    ConfigParser::new().parse_yaml(&yaml, None).unwrap()
}

fn fast_retry() -> EngineConfig {
    EngineConfig::default().with_retry(RetryPolicy {
        max_attempts: 3,
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
    })
}

struct Harness {
    engine: Engine,
    provider: Arc<MemoryProvisioner>,
    store: Arc<MemoryStateStore>,
}

fn harness() -> Harness {
    harness_with(MemoryProvisioner::new())
}

fn harness_with(provider: MemoryProvisioner) -> Harness {
    let provider = Arc::new(provider);
    let store = Arc::new(MemoryStateStore::new());
    let engine = Engine::new(fast_retry(), provider.clone(), store.clone());
    Harness { engine, provider, store }
}

#[tokio::test]
async fn test_graph_order_respects_references() {
    let h = harness();
    let decl = declaration(&format!("{SECURITY_GROUP}{BUCKET}{NETWORK}"));

    let graph = h.engine.graph(&decl).unwrap();
    let order = graph.names_in_order();

    let pos = |name: &str| order.iter().position(|n| *n == name).unwrap();
    assert!(pos("vpc") < pos("web-sg"));
    assert_eq!(order.len(), 3);

    // Same declaration, same order
    let again = h.engine.graph(&decl).unwrap();
    assert_eq!(again.names_in_order(), order);
}

#[tokio::test]
async fn test_cycle_is_reported_with_both_members() {
    let h = harness();
    let decl = declaration(
        r"
  - name: a
    kind: bucket
    properties:
      bucket_name: bucket-a
      read_write: [{ ref: b }]
  - name: b
    kind: bucket
    properties:
      bucket_name: bucket-b
      read_write: [{ ref: a }]
",
    );

    let err = assert_err!(h.engine.plan(&decl).await);
    match err {
        StackformError::Graph(GraphError::Cycle { members }) => {
            assert!(members.contains(&String::from("a")));
            assert!(members.contains(&String::from("b")));
        }
        other => panic!("expected a cycle, got {other}"),
    }
    assert!(h.provider.calls().is_empty());
}

#[tokio::test]
async fn test_invalid_declaration_never_reaches_provider() {
    let h = harness();
    let decl = declaration(
        r"
  - name: assets
    kind: bucket
    properties:
      bucket_name: Not_A_Valid_Bucket
",
    );

    let err = assert_err!(h.engine.apply(&decl, &CancelToken::new()).await);
    assert!(matches!(err, StackformError::Validation(_)));
    assert!(h.provider.calls().is_empty());
}

#[tokio::test]
async fn test_second_apply_is_all_no_op() {
    let h = harness();
    let decl = declaration(&format!("{NETWORK}{SECURITY_GROUP}{BUCKET}"));

    let first = assert_ok!(h.engine.apply(&decl, &CancelToken::new()).await);
    assert!(first.success());
    assert_eq!(h.provider.calls_of(CallKind::Create).len(), 3);

    let plan = h.engine.plan(&decl).await.unwrap();
    assert!(!plan.has_changes());
    assert_eq!(plan.unchanged_count(), 3);

    h.provider.clear_calls();
    let second = assert_ok!(h.engine.apply(&decl, &CancelToken::new()).await);
    assert!(second.success());
    assert!(h.provider.calls_of(CallKind::Create).is_empty());
    assert!(h.provider.calls_of(CallKind::Update).is_empty());

    // Only the run that changed something is in the history
    let state = h.store.load().await.unwrap().unwrap();
    assert_eq!(state.history.len(), 1);
    assert!(state.history[0].success);
    assert_eq!(state.history[0].operation, RunOperation::Apply);
}

#[tokio::test]
async fn test_create_then_destroy_in_reverse_order() {
    let h = harness();
    let decl = declaration(&format!("{NETWORK}{SECURITY_GROUP}"));

    let plan = h.engine.plan(&decl).await.unwrap();
    assert_eq!(
        plan.changes.operations(),
        vec![("vpc", Operation::Create), ("web-sg", Operation::Create)]
    );
    h.engine.apply(&decl, &CancelToken::new()).await.unwrap();

    let destroy = h.engine.plan_destroy(&decl).await.unwrap();
    assert_eq!(
        destroy.changes.operations(),
        vec![("web-sg", Operation::Delete), ("vpc", Operation::Delete)]
    );

    let report = h.engine.destroy(&decl, &CancelToken::new()).await.unwrap();
    assert!(report.success());
    assert_eq!(h.provider.calls_of(CallKind::Delete), vec!["web-sg", "vpc"]);
    assert_eq!(h.provider.live_count(), 0);

    let state = h.store.load().await.unwrap().unwrap();
    assert!(state.is_empty());
    assert_eq!(state.history.last().unwrap().operation, RunOperation::Destroy);
}

#[tokio::test]
async fn test_removed_resource_is_deleted() {
    let h = harness();
    h.engine
        .apply(&declaration(&format!("{NETWORK}{BUCKET}")), &CancelToken::new())
        .await
        .unwrap();

    let plan = h.engine.plan(&declaration(NETWORK)).await.unwrap();
    assert_eq!(
        plan.changes.operations(),
        vec![("vpc", Operation::NoOp), ("assets", Operation::Delete)]
    );
    assert_eq!(plan.changes.find("assets").unwrap().reason, "no longer declared");
}

#[tokio::test]
async fn test_immutable_change_replaces_and_updates_referrers() {
    let h = harness();
    let decl = declaration(&format!("{NETWORK}{SECURITY_GROUP}"));
    h.engine.apply(&decl, &CancelToken::new()).await.unwrap();
    let old_handle = h.provider.handle_of("vpc").unwrap();

    let changed = declaration(&format!("{}{SECURITY_GROUP}", NETWORK.replace("10.0.0.0/16", "10.1.0.0/16")));
    let plan = h.engine.plan(&changed).await.unwrap();

    let vpc = plan.changes.find("vpc").unwrap();
    assert_eq!(vpc.operation, Operation::Replace);
    assert!(vpc.property_changes.iter().any(|p| p.property == "cidr" && p.immutable));
    assert_eq!(plan.changes.find("web-sg").unwrap().operation, Operation::Update);

    let report = h.engine.apply(&changed, &CancelToken::new()).await.unwrap();
    assert!(report.success());

    let new_handle = h.provider.handle_of("vpc").unwrap();
    assert_ne!(old_handle, new_handle);
    assert_eq!(h.provider.calls_of(CallKind::Delete), vec!["vpc"]);

    // The security group now points at the replacement
    let sg = h.provider.live_properties("web-sg").unwrap();
    assert_eq!(sg["network"], PropertyValue::from(new_handle.as_str()));
}

#[tokio::test]
async fn test_mutable_change_updates_in_place() {
    let h = harness();
    h.engine.apply(&declaration(BUCKET), &CancelToken::new()).await.unwrap();

    let versioned = declaration(&format!("{BUCKET}      versioned: true\n"));
    let report = h.engine.apply(&versioned, &CancelToken::new()).await.unwrap();

    assert!(report.success());
    assert_eq!(report.outcome("assets").unwrap().operation, Operation::Update);
    assert_eq!(h.provider.calls_of(CallKind::Update), vec!["assets"]);
    assert_eq!(
        h.provider.live_properties("assets").unwrap()["versioned"],
        PropertyValue::Bool(true)
    );
}

#[tokio::test]
async fn test_terminal_failure_blocks_only_dependents() {
    let h = harness();
    h.provider.fail_on(
        "vpc",
        ProviderError::Rejected {
            status: 400,
            message: String::from("quota exceeded"),
        },
    );
    let decl = declaration(&format!("{NETWORK}{SECURITY_GROUP}{BUCKET}"));

    let report = h.engine.apply(&decl, &CancelToken::new()).await.unwrap();

    assert!(!report.success());
    let vpc = report.outcome("vpc").unwrap();
    assert_eq!(vpc.state, ResourceState::Failed);
    assert_eq!(vpc.attempts, 1);
    assert!(vpc.error.as_deref().unwrap().contains("quota exceeded"));

    let sg = report.outcome("web-sg").unwrap();
    assert_eq!(sg.state, ResourceState::Planned);
    assert_eq!(sg.blocked_by.as_deref(), Some("vpc"));

    assert_eq!(report.outcome("assets").unwrap().state, ResourceState::Applied);
    let mut created = h.provider.calls_of(CallKind::Create);
    created.sort();
    assert_eq!(created, vec!["assets", "vpc"]);

    // The failed run is recorded, and only the bucket is in the state
    let state = h.store.load().await.unwrap().unwrap();
    assert_eq!(state.record_names(), vec!["assets"]);
    assert!(!state.history[0].success);

    // A later run picks up where the failed one stopped
    h.provider.clear_failure("vpc");
    let plan = h.engine.plan(&decl).await.unwrap();
    assert_eq!(
        plan.changes.operations(),
        vec![
            ("vpc", Operation::Create),
            ("web-sg", Operation::Create),
            ("assets", Operation::NoOp)
        ]
    );
}

#[tokio::test]
async fn test_failed_describe_is_recovered_by_next_run() {
    let h = harness();
    h.provider.fail_call(
        CallKind::Describe,
        "assets",
        1,
        ProviderError::AuthenticationFailed {
            message: String::from("token expired"),
        },
    );
    let decl = declaration(BUCKET);

    let report = h.engine.apply(&decl, &CancelToken::new()).await.unwrap();
    assert_eq!(report.outcome("assets").unwrap().state, ResourceState::Failed);

    // The handle is kept, but the record is not taken as up to date
    let record = h.store.get_record("assets").await.unwrap().unwrap();
    assert!(record.is_pending());
    assert!(record.outputs.is_empty());

    let plan = h.engine.plan(&decl).await.unwrap();
    assert_eq!(plan.changes.operations(), vec![("assets", Operation::Update)]);

    let report = h.engine.apply(&decl, &CancelToken::new()).await.unwrap();
    assert!(report.success());
    assert_eq!(h.provider.calls_of(CallKind::Create), vec!["assets"]);

    let record = h.store.get_record("assets").await.unwrap().unwrap();
    assert!(!record.is_pending());
    assert_eq!(record.outputs["arn"], PropertyValue::from("arn:stackform:bucket:assets"));

    let plan = h.engine.plan(&decl).await.unwrap();
    assert_eq!(plan.changes.operations(), vec![("assets", Operation::NoOp)]);
}

#[tokio::test]
async fn test_fail_fast_stops_unrelated_changes() {
    let provider = Arc::new(MemoryProvisioner::new());
    let store = Arc::new(MemoryStateStore::new());
    let config = fast_retry().with_parallelism(1).with_fail_fast(true);
    let engine = Engine::new(config, provider.clone(), store.clone());
    provider.fail_on(
        "vpc",
        ProviderError::Rejected {
            status: 400,
            message: String::from("quota exceeded"),
        },
    );
    let decl = declaration(&format!("{NETWORK}{SECURITY_GROUP}{BUCKET}"));

    let report = engine.apply(&decl, &CancelToken::new()).await.unwrap();

    assert_eq!(report.outcome("vpc").unwrap().state, ResourceState::Failed);
    let assets = report.outcome("assets").unwrap();
    assert_eq!(assets.state, ResourceState::Planned);
    assert_eq!(assets.blocked_by, None);
    assert_eq!(provider.calls_of(CallKind::Create), vec!["vpc"]);
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let h = harness();
    h.provider.fail_times(
        "assets",
        2,
        ProviderError::Unavailable {
            status: 503,
            message: String::from("try later"),
        },
    );

    let report = h.engine.apply(&declaration(BUCKET), &CancelToken::new()).await.unwrap();

    assert!(report.success());
    assert_eq!(h.provider.calls_of(CallKind::Create).len(), 3);
    assert!(report.outcome("assets").unwrap().attempts >= 3);
}

#[tokio::test]
async fn test_exhausted_retries_report_transient_failure() {
    let h = harness();
    h.provider.fail_on("assets", ProviderError::RateLimited { retry_after_secs: 0 });

    let report = h.engine.apply(&declaration(BUCKET), &CancelToken::new()).await.unwrap();

    let outcome = report.outcome("assets").unwrap();
    assert_eq!(outcome.state, ResourceState::Failed);
    assert_eq!(outcome.attempts, 3);
    assert_eq!(outcome.error_kind, Some(stackform::error::ErrorKind::Transient));
}

#[tokio::test]
async fn test_concurrent_applies_serialise_per_resource() {
    let h = harness_with(MemoryProvisioner::new().with_latency(Duration::from_millis(20)));
    let decl = declaration(&format!("{NETWORK}{SECURITY_GROUP}{BUCKET}"));

    let cancel_first = CancelToken::new();
    let cancel_second = CancelToken::new();
    let (first, second) = tokio::join!(
        h.engine.apply(&decl, &cancel_first),
        h.engine.apply(&decl, &cancel_second)
    );
    assert!(first.unwrap().success());
    assert!(second.unwrap().success());

    let mut created = h.provider.calls_of(CallKind::Create);
    created.sort();
    assert_eq!(created, vec!["assets", "vpc", "web-sg"]);
    assert_eq!(h.provider.live_count(), 3);

    let state = h.store.load().await.unwrap().unwrap();
    assert_eq!(state.resources.len(), 3);
    for name in ["vpc", "web-sg", "assets"] {
        let record = &state.resources[name];
        assert_eq!(Some(&record.handle), h.provider.handle_of(name).as_ref());
    }
}

#[tokio::test]
async fn test_independent_branches_run_concurrently() {
    let h = harness_with(MemoryProvisioner::new().with_latency(Duration::from_millis(20)));
    let buckets: String = (0..4)
        .map(|i| format!("  - name: b{i}\n    kind: bucket\n    properties:\n      bucket_name: bucket-{i}\n"))
        .collect();

    let report = h.engine.apply(&declaration(&buckets), &CancelToken::new()).await.unwrap();

    assert!(report.success());
    assert!(h.provider.max_concurrency() > 1);
}

#[tokio::test]
async fn test_cancelled_run_changes_nothing() {
    let h = harness();
    let cancel = CancelToken::new();
    cancel.cancel();

    let report = h.engine.apply(&declaration(BUCKET), &cancel).await.unwrap();

    assert!(report.cancelled);
    assert!(!report.success());
    assert_eq!(report.outcome("assets").unwrap().state, ResourceState::Planned);
    assert!(h.provider.calls().is_empty());
}

#[tokio::test]
async fn test_drift_detection() {
    let h = harness();
    let decl = declaration(&format!("{NETWORK}{SECURITY_GROUP}{BUCKET}"));
    h.engine.apply(&decl, &CancelToken::new()).await.unwrap();

    let clean = h.engine.check_drift(&decl).await.unwrap();
    assert!(clean.is_converged());

    h.provider.set_live_property("assets", "versioned", PropertyValue::Bool(true));
    h.provider.remove_live("web-sg");

    let report = h.engine.check_drift(&declaration(&format!("{NETWORK}{SECURITY_GROUP}"))).await.unwrap();

    assert!(report.has_drift());
    assert_eq!(report.entry("vpc").unwrap().status, DriftStatus::InSync);
    assert_eq!(report.entry("web-sg").unwrap().status, DriftStatus::Missing);

    let assets = report.entry("assets").unwrap();
    assert_eq!(assets.status, DriftStatus::Drifted);
    assert_eq!(assets.differences[0].property, "versioned");
    assert_eq!(report.undeclared, vec!["assets"]);
}

#[tokio::test]
async fn test_state_of_another_stack_aborts() {
    let h = harness();
    h.store.save(&ObservedState::new("other", "prod")).await.unwrap();

    let err = h.engine.plan(&declaration(BUCKET)).await.unwrap_err();
    assert!(matches!(err, StackformError::Apply(_)));
}

#[tokio::test]
async fn test_local_state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(MemoryProvisioner::new());
    let decl = declaration(&format!("{NETWORK}{SECURITY_GROUP}"));

    {
        let store = Arc::new(LocalStateStore::with_base_dir(dir.path()));
        let engine = Engine::new(fast_retry(), provider.clone(), store);
        assert!(engine.apply(&decl, &CancelToken::new()).await.unwrap().success());
    }

    let store = Arc::new(LocalStateStore::with_base_dir(dir.path()));
    let engine = Engine::new(fast_retry(), provider.clone(), store.clone());
    let plan = engine.plan(&decl).await.unwrap();

    assert!(!plan.has_changes());
    let record = store.get_record("web-sg").await.unwrap().unwrap();
    assert_eq!(record.dependencies, vec!["vpc"]);
    assert_eq!(Some(record.handle), provider.handle_of("web-sg"));
}
