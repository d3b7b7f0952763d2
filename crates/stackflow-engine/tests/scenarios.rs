//! End-to-end engine scenarios against a scripted provider

mod common;

use common::ScriptedProvider;
use serde_json::json;
use stackflow_engine::{
    Action, ApplyOutcome, CancelHandle, ConfigError, Engine, EngineError, EngineOptions,
    ExecuteOptions, Expr, InstanceAddress, MemoryStateStore, Outcome, PlannedValue, Provider,
    ProviderErrorKind, Reference, ResourceConfig, ResourceId, ResourceSet, StateStore, StepEvent,
};
use std::sync::Arc;
use std::time::Duration;

fn vm(name: &str) -> ResourceConfig {
    ResourceConfig::new("vm", name).with_literal("name", json!(name))
}

fn set_of(configs: Vec<ResourceConfig>) -> ResourceSet {
    let mut set = ResourceSet::new();
    for config in configs {
        set.add(config).unwrap();
    }
    set
}

fn addr(name: &str) -> InstanceAddress {
    InstanceAddress::single("vm", name)
}

struct Harness {
    provider: Arc<ScriptedProvider>,
    store: Arc<MemoryStateStore>,
    engine: Engine,
}

impl Harness {
    fn new() -> Self {
        Self::with_options(EngineOptions::default())
    }

    fn with_options(options: EngineOptions) -> Self {
        let provider = ScriptedProvider::new();
        let store = Arc::new(MemoryStateStore::new());
        let engine = Engine::new(store.clone(), provider.clone(), options);
        Self {
            provider,
            store,
            engine,
        }
    }

    fn with_execute(execute: ExecuteOptions) -> Self {
        Self::with_options(EngineOptions {
            execute,
            ..Default::default()
        })
    }

    async fn apply(&self, set: &ResourceSet) -> ApplyOutcome {
        self.engine
            .apply(set, None, CancelHandle::new(), |_| {})
            .await
            .unwrap()
    }

    fn outcome_of<'o>(outcome: &'o ApplyOutcome, name: &str) -> &'o Outcome {
        &outcome
            .report
            .entries
            .iter()
            .find(|e| e.address == addr(name) && e.deposed.is_none())
            .unwrap_or_else(|| panic!("no entry for vm.{}", name))
            .outcome
    }
}

#[tokio::test]
async fn test_apply_creates_dependencies_first() {
    let h = Harness::new();
    let set = set_of(vec![
        vm("b").with_attribute("parent", Expr::reference(Reference::to("vm", "a", "id"))),
        vm("a"),
    ]);

    let outcome = h.apply(&set).await;
    assert!(outcome.report.is_success());
    assert!(h.provider.position("create:a") < h.provider.position("create:b"));

    let state = h.store.snapshot().await.unwrap();
    let a_id = state.get(&addr("a")).unwrap().id().unwrap().to_string();
    let b = state.get(&addr("b")).unwrap();
    assert_eq!(b.attributes["parent"], json!(a_id));
    assert_eq!(b.dependencies, vec![addr("a")]);
    assert_eq!(b.schema_version, 2);
}

#[tokio::test]
async fn test_plan_marks_values_unknown_until_apply() {
    let h = Harness::new();
    let set = set_of(vec![
        vm("a"),
        vm("b").with_attribute("parent", Expr::reference(Reference::to("vm", "a", "id"))),
    ]);

    let outcome = h.engine.plan(&set, false).await.unwrap();
    let b = outcome
        .plan
        .entries
        .iter()
        .find(|e| e.address == addr("b"))
        .unwrap();
    assert_eq!(b.action, Action::Create);
    let after = b.after.as_ref().unwrap();
    assert_eq!(after["parent"], PlannedValue::Unknown);
    assert_eq!(after["name"], PlannedValue::Known(json!("b")));
    assert!(h.provider.log().is_empty());
}

#[tokio::test]
async fn test_failure_skips_dependents_and_commits_nothing() {
    let h = Harness::new();
    h.provider.fail_on("a");
    let set = set_of(vec![
        vm("a"),
        vm("b").with_attribute("parent", Expr::reference(Reference::to("vm", "a", "id"))),
    ]);

    let outcome = h.apply(&set).await;
    assert!(!outcome.report.is_success());
    assert!(matches!(
        Harness::outcome_of(&outcome, "a"),
        Outcome::Failed(e) if e.kind == ProviderErrorKind::Permanent
    ));
    assert_eq!(
        Harness::outcome_of(&outcome, "b"),
        &Outcome::Skipped {
            upstream: "create vm.a".to_string()
        }
    );
    assert_eq!(outcome.report.failures().len(), 1);

    let stored = h.engine.load_state().await.unwrap();
    assert!(stored.is_empty());
    assert!(h.provider.log().is_empty());
}

#[tokio::test]
async fn test_partial_apply_commits_what_succeeded() {
    let h = Harness::new();
    h.provider.fail_on("a");
    let set = set_of(vec![
        vm("a"),
        vm("b").depends_on(ResourceId::new("vm", "a")),
        vm("c"),
    ]);

    let outcome = h.apply(&set).await;
    assert_eq!(Harness::outcome_of(&outcome, "c"), &Outcome::Success);
    assert!(matches!(Harness::outcome_of(&outcome, "b"), Outcome::Skipped { .. }));

    let state = h.store.snapshot().await.unwrap();
    assert!(state.get(&addr("c")).is_some());
    assert!(state.get(&addr("a")).is_none());
    assert!(state.get(&addr("b")).is_none());
    assert!(state.serial >= 1);
}

#[tokio::test]
async fn test_forced_replacement_deletes_then_creates() {
    let h = Harness::new();
    h.apply(&set_of(vec![vm("a").with_literal("location", json!("west"))]))
        .await;
    let (old_id, _) = h.provider.object_named("a").unwrap();

    let moved = set_of(vec![vm("a").with_literal("location", json!("east"))]);
    let planned = h.engine.plan(&moved, false).await.unwrap();
    let entry = &planned.plan.entries[0];
    assert_eq!(entry.action, Action::Replace);
    assert_eq!(entry.replace_reasons, vec!["location".to_string()]);

    let outcome = h.apply(&moved).await;
    assert!(outcome.report.is_success());
    assert_eq!(h.provider.log(), vec!["create:a", "delete:a", "create:a"]);

    let state = h.store.snapshot().await.unwrap();
    let record = state.get(&addr("a")).unwrap();
    assert_eq!(record.attributes["location"], json!("east"));
    assert_ne!(record.id(), Some(old_id.as_str()));
    assert_eq!(state.len(), 1);
}

#[tokio::test]
async fn test_create_before_destroy_creates_first() {
    let h = Harness::new();
    h.apply(&set_of(vec![
        vm("a").with_literal("location", json!("west")).create_before_destroy(),
    ]))
    .await;

    let moved = set_of(vec![
        vm("a").with_literal("location", json!("east")).create_before_destroy(),
    ]);
    let outcome = h.apply(&moved).await;
    assert!(outcome.report.is_success());
    assert_eq!(h.provider.log(), vec!["create:a", "create:a", "delete:a"]);
    assert_eq!(h.provider.object_count(), 1);

    let state = h.store.snapshot().await.unwrap();
    assert_eq!(state.len(), 1);
    assert!(state.records().all(|r| r.deposed.is_none()));
    assert_eq!(
        state.get(&addr("a")).unwrap().attributes["location"],
        json!("east")
    );
}

#[tokio::test]
async fn test_failed_create_before_destroy_keeps_old_object() {
    let h = Harness::new();
    h.apply(&set_of(vec![
        vm("a").with_literal("location", json!("west")).create_before_destroy(),
    ]))
    .await;
    let (old_id, _) = h.provider.object_named("a").unwrap();

    h.provider.fail_on("a");
    let moved = set_of(vec![
        vm("a").with_literal("location", json!("east")).create_before_destroy(),
    ]);
    let outcome = h.apply(&moved).await;
    assert!(!outcome.report.is_success());

    let state = h.store.snapshot().await.unwrap();
    let record = state.get(&addr("a")).unwrap();
    assert_eq!(record.id(), Some(old_id.as_str()));
    assert!(record.deposed.is_none());
}

#[tokio::test]
async fn test_in_place_update_keeps_identity() {
    let h = Harness::new();
    h.apply(&set_of(vec![vm("a").with_literal("size", json!(1))])).await;
    let (id, _) = h.provider.object_named("a").unwrap();

    let resized = set_of(vec![vm("a").with_literal("size", json!(2))]);
    let outcome = h.apply(&resized).await;
    assert_eq!(outcome.plan.entries[0].action, Action::Update);
    assert!(outcome.report.is_success());
    assert_eq!(h.provider.log(), vec!["create:a", "update:a"]);

    let state = h.store.snapshot().await.unwrap();
    let record = state.get(&addr("a")).unwrap();
    assert_eq!(record.id(), Some(id.as_str()));
    assert_eq!(record.attributes["size"], json!(2));
}

#[tokio::test]
async fn test_unordered_collection_reorder_is_noop() {
    let h = Harness::new();
    h.apply(&set_of(vec![vm("a").with_literal("tags", json!(["x", "y"]))]))
        .await;
    let planned = h
        .engine
        .plan(&set_of(vec![vm("a").with_literal("tags", json!(["y", "x"]))]), false)
        .await
        .unwrap();
    assert!(!planned.plan.has_changes);
}

#[tokio::test]
async fn test_second_plan_after_apply_converges() {
    let h = Harness::new();
    let set = set_of(vec![
        vm("a").with_literal("size", json!(1)),
        vm("b").with_attribute("parent", Expr::reference(Reference::to("vm", "a", "arn"))),
    ]);
    assert!(h.apply(&set).await.report.is_success());

    let planned = h.engine.plan(&set, false).await.unwrap();
    assert!(!planned.plan.has_changes);
    assert_eq!(planned.plan.summary().no_change, 2);

    let again = h.apply(&set).await;
    assert!(again.report.entries.is_empty());
    assert_eq!(h.provider.log().len(), 2);
}

#[tokio::test]
async fn test_removed_resources_are_deleted_dependents_first() {
    let h = Harness::new();
    h.apply(&set_of(vec![
        vm("a"),
        vm("b").with_attribute("parent", Expr::reference(Reference::to("vm", "a", "id"))),
    ]))
    .await;

    let outcome = h.apply(&ResourceSet::new()).await;
    assert_eq!(outcome.plan.summary().delete, 2);
    assert!(outcome.report.is_success());
    assert!(h.provider.position("delete:b") < h.provider.position("delete:a"));
    assert!(h.store.snapshot().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_unindexed_reference_fans_out_over_instances() {
    let h = Harness::new();
    let set = set_of(vec![
        vm("web").with_count(3),
        vm("lb").with_attribute("backends", Expr::reference(Reference::to("vm", "web", "id"))),
    ]);

    let outcome = h.apply(&set).await;
    assert!(outcome.report.is_success());
    assert_eq!(h.provider.position("create:lb"), 3);

    let state = h.store.snapshot().await.unwrap();
    let backends = state.get(&addr("lb")).unwrap().attributes["backends"].clone();
    assert_eq!(backends.as_array().unwrap().len(), 3);
    assert!(state.get(&InstanceAddress::indexed("vm", "web", 2)).is_some());
}

#[tokio::test]
async fn test_independent_resources_run_concurrently() {
    let h = Harness::new();
    // Both creates wait on one barrier; run one at a time they would hang
    h.provider.gate(&["c", "d"]);
    let set = set_of(vec![vm("c"), vm("d")]);

    let outcome = tokio::time::timeout(Duration::from_secs(5), h.apply(&set))
        .await
        .expect("independent creates did not overlap");
    assert!(outcome.report.is_success());
    assert_eq!(h.provider.peak_concurrency(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_parallelism_is_bounded() {
    let h = Harness::with_execute(ExecuteOptions {
        parallelism: 2,
        ..Default::default()
    });
    let names = ["a", "b", "c", "d", "e"];
    for name in names {
        h.provider.delay(name, Duration::from_secs(1));
    }

    let outcome = h.apply(&set_of(names.iter().map(|n| vm(n)).collect())).await;
    assert!(outcome.report.is_success());
    assert_eq!(h.provider.peak_concurrency(), 2);
    assert_eq!(h.provider.object_count(), 5);
}

#[tokio::test]
async fn test_lock_held_elsewhere_fails_fast() {
    let h = Harness::new();
    let held = h.store.acquire_lock("someone else", "apply").await.unwrap();

    let err = h
        .engine
        .apply(&set_of(vec![vm("a")]), None, CancelHandle::new(), |_| {})
        .await
        .unwrap_err();
    assert!(err.is_recoverable());
    match err {
        EngineError::LockBusy {
            info,
            possibly_stale,
        } => {
            assert_eq!(info.owner, "someone else");
            assert!(!possibly_stale);
        }
        other => panic!("expected LockBusy, got {:?}", other),
    }
    assert!(h.provider.log().is_empty());

    h.store.release_lock(held).await.unwrap();
    assert!(h.apply(&set_of(vec![vm("a")])).await.report.is_success());
    assert!(h.store.lock_info().await.unwrap().is_none());
}

#[tokio::test]
async fn test_commit_of_loaded_state_advances_serial() {
    let h = Harness::new();
    h.apply(&set_of(vec![vm("a")])).await;

    let lock = h.store.acquire_lock("test", "state").await.unwrap();
    let loaded = h.store.load().await.unwrap().unwrap();
    let committed = h.store.commit(&lock, &loaded).await.unwrap();
    assert_eq!(committed.serial, loaded.serial + 1);
    assert_eq!(committed.lineage, loaded.lineage);
    assert_eq!(committed.resources, loaded.resources);

    let err = h.store.commit(&lock, &loaded).await.unwrap_err();
    assert!(matches!(err, EngineError::StaleState { .. }));
    h.store.release_lock(lock).await.unwrap();
}

#[tokio::test]
async fn test_cancel_stops_new_work() {
    let h = Harness::new();
    let set = set_of(vec![
        vm("a"),
        vm("b").with_attribute("parent", Expr::reference(Reference::to("vm", "a", "id"))),
    ]);
    let cancel = CancelHandle::new();
    let trigger = cancel.clone();

    let outcome = h
        .engine
        .apply(&set, None, cancel, move |event| {
            if let StepEvent::Finished(_, Outcome::Success) = event {
                trigger.cancel();
            }
        })
        .await
        .unwrap();

    assert!(outcome.report.cancelled);
    assert_eq!(Harness::outcome_of(&outcome, "a"), &Outcome::Success);
    assert_eq!(Harness::outcome_of(&outcome, "b"), &Outcome::Cancelled);
    let state = h.store.snapshot().await.unwrap();
    assert!(state.get(&addr("a")).is_some());
    assert_eq!(h.provider.log(), vec!["create:a"]);
}

#[tokio::test(start_paused = true)]
async fn test_create_timeout_is_ambiguous() {
    let h = Harness::with_execute(ExecuteOptions {
        default_timeout: Some(Duration::from_secs(1)),
        ..Default::default()
    });
    h.provider.delay("a", Duration::from_secs(30));

    let outcome = h.apply(&set_of(vec![vm("a")])).await;
    assert_eq!(outcome.report.ambiguous().len(), 1);
    match outcome.report.ambiguity() {
        Some(EngineError::AmbiguousState(steps)) => assert!(steps.contains("vm.a")),
        other => panic!("expected AmbiguousState, got {:?}", other),
    }
    assert!(matches!(
        Harness::outcome_of(&outcome, "a"),
        Outcome::Failed(e) if e.kind == ProviderErrorKind::Ambiguous
    ));
}

#[tokio::test(start_paused = true)]
async fn test_update_timeout_reads_back_and_records_reality() {
    let h = Harness::with_execute(ExecuteOptions {
        default_timeout: Some(Duration::from_secs(1)),
        ..Default::default()
    });
    h.apply(&set_of(vec![vm("a").with_literal("size", json!(1))])).await;
    h.provider.delay("a", Duration::from_secs(30));

    let outcome = h.apply(&set_of(vec![vm("a").with_literal("size", json!(2))])).await;
    assert!(matches!(
        Harness::outcome_of(&outcome, "a"),
        Outcome::Failed(e) if e.kind == ProviderErrorKind::Timeout
    ));
    assert!(outcome.report.ambiguous().is_empty());

    let state = h.store.snapshot().await.unwrap();
    assert_eq!(state.get(&addr("a")).unwrap().attributes["size"], json!(1));
}

#[tokio::test(start_paused = true)]
async fn test_update_timeout_without_read_back_is_ambiguous() {
    let h = Harness::with_execute(ExecuteOptions {
        default_timeout: Some(Duration::from_secs(1)),
        ..Default::default()
    });
    h.apply(&set_of(vec![vm("a").with_literal("size", json!(1))])).await;
    h.provider.delay("a", Duration::from_secs(30));
    h.provider.fail_reads();

    let outcome = h.apply(&set_of(vec![vm("a").with_literal("size", json!(2))])).await;
    assert!(matches!(
        Harness::outcome_of(&outcome, "a"),
        Outcome::Failed(e) if e.kind == ProviderErrorKind::Ambiguous
    ));
}

#[tokio::test]
async fn test_saved_plan_rejected_after_state_changed() {
    let h = Harness::new();
    let set = set_of(vec![vm("a")]);
    let artifact = h.engine.plan(&set, false).await.unwrap().plan.to_artifact();

    // Someone else applies in between
    h.apply(&set_of(vec![vm("z")])).await;

    let err = h
        .engine
        .apply(&set, Some(artifact), CancelHandle::new(), |_| {})
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::StalePlan));
    assert!(!h.provider.log().contains(&"create:a".to_string()));
    assert!(h.store.lock_info().await.unwrap().is_none());
}

#[tokio::test]
async fn test_saved_plan_applies_when_nothing_changed() {
    let h = Harness::new();
    let set = set_of(vec![vm("a"), vm("b")]);
    let artifact = h.engine.plan(&set, false).await.unwrap().plan.to_artifact();

    let outcome = h
        .engine
        .apply(&set, Some(artifact), CancelHandle::new(), |_| {})
        .await
        .unwrap();
    assert!(outcome.report.is_success());
    assert_eq!(h.provider.object_count(), 2);
}

#[tokio::test]
async fn test_cycle_is_rejected_before_any_call() {
    let h = Harness::new();
    let set = set_of(vec![
        vm("a").with_attribute("x", Expr::reference(Reference::to("vm", "b", "id"))),
        vm("b").with_attribute("x", Expr::reference(Reference::to("vm", "a", "id"))),
    ]);

    let err = h.engine.plan(&set, false).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::Configuration(ConfigError::Cycle(_))
    ));
    assert!(h.provider.log().is_empty());
    assert!(h.store.snapshot().await.is_none());
}

#[tokio::test]
async fn test_refresh_records_drift_and_vanished_objects() {
    let h = Harness::new();
    let set = set_of(vec![vm("a").with_literal("size", json!(1)), vm("b")]);
    h.apply(&set).await;

    let (a_id, _) = h.provider.object_named("a").unwrap();
    h.provider.tamper(&a_id, "size", json!(5));
    let (b_id, _) = h.provider.object_named("b").unwrap();
    h.provider.delete("vm", &b_id).await.unwrap();

    let (report, state) = h.engine.refresh().await.unwrap();
    assert_eq!(report.checked, 2);
    assert_eq!(report.drifted.len(), 1);
    assert_eq!(report.drifted[0].attributes, vec!["size".to_string()]);
    assert_eq!(report.vanished, vec![addr("b")]);
    assert_eq!(state.get(&addr("a")).unwrap().attributes["size"], json!(5));

    let planned = h.engine.plan(&set, false).await.unwrap();
    let summary = planned.plan.summary();
    assert_eq!(summary.update, 1);
    assert_eq!(summary.create, 1);
}

#[tokio::test]
async fn test_destroy_removes_everything() {
    let h = Harness::new();
    let set = set_of(vec![
        vm("a"),
        vm("b").with_attribute("parent", Expr::reference(Reference::to("vm", "a", "id"))),
    ]);
    h.apply(&set).await;

    let outcome = h
        .engine
        .destroy(&set, CancelHandle::new(), |_| {})
        .await
        .unwrap();
    assert!(outcome.report.is_success());
    assert_eq!(h.provider.object_count(), 0);
    assert!(h.provider.position("delete:b") < h.provider.position("delete:a"));
    assert!(h.store.snapshot().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_destroy_refuses_protected_resources() {
    let h = Harness::new();
    let mut protected = vm("a");
    protected.lifecycle.prevent_destroy = true;
    let set = set_of(vec![protected]);
    h.apply(&set).await;

    let err = h
        .engine
        .destroy(&set, CancelHandle::new(), |_| {})
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Configuration(ConfigError::PreventDestroy { .. })
    ));
    assert_eq!(h.provider.object_count(), 1);
}

#[tokio::test]
async fn test_shrinking_count_of_protected_resource_is_refused() {
    let h = Harness::new();
    let mut protected = vm("a").with_count(3);
    protected.lifecycle.prevent_destroy = true;
    h.apply(&set_of(vec![protected.clone()])).await;

    let err = h
        .engine
        .apply(&set_of(vec![protected.with_count(2)]), None, CancelHandle::new(), |_| {})
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Configuration(ConfigError::PreventDestroy { ref address, .. })
            if address == "vm.a[2]"
    ));
    assert_eq!(h.provider.object_count(), 3);
    assert!(h.store.lock_info().await.unwrap().is_none());
}

#[tokio::test]
async fn test_outputs_follow_applied_state() {
    let h = Harness::new();
    let mut set = set_of(vec![vm("a")]);
    set.add_output("a_arn", Expr::reference(Reference::to("vm", "a", "arn")));

    let outcome = h.apply(&set).await;
    let (id, _) = h.provider.object_named("a").unwrap();
    assert_eq!(outcome.outputs["a_arn"], json!(format!("arn:scripted:{}", id)));
    assert_eq!(h.engine.outputs(&set).await.unwrap(), outcome.outputs);
}

#[tokio::test]
async fn test_failing_checkpoint_halts_apply() {
    let h = Harness::new();
    h.store.set_fail_commits(true);
    let set = set_of(vec![
        vm("a"),
        vm("b").with_attribute("parent", Expr::reference(Reference::to("vm", "a", "id"))),
    ]);

    let outcome = h.apply(&set).await;
    assert!(outcome.report.commit_error.is_some());
    assert_eq!(Harness::outcome_of(&outcome, "b"), &Outcome::Cancelled);
    assert_eq!(h.provider.log(), vec!["create:a"]);
}

#[tokio::test]
async fn test_forget_drops_record_only() {
    let h = Harness::new();
    h.apply(&set_of(vec![vm("a")])).await;

    let record = h.engine.forget(&addr("a")).await.unwrap();
    assert_eq!(record.name, "a");
    assert!(h.store.snapshot().await.unwrap().is_empty());
    assert_eq!(h.provider.object_count(), 1);

    let err = h.engine.forget(&addr("a")).await.unwrap_err();
    assert!(matches!(err, EngineError::StateNotFound(_)));
}
