//! Engine orchestration
//!
//! Every state-touching operation follows the same shape: take the lock,
//! load, work, commit, release. The lock is released on error paths too.

use crate::diff::diff;
use crate::error::{ConfigError, EngineError, Result};
use crate::executor::{ApplyReport, CancelHandle, ExecuteOptions, Executor, StepEvent};
use crate::expr::PlannedValue;
use crate::graph::ResourceGraph;
use crate::plan::{Plan, PlanArtifact};
use crate::provider::Provider;
use crate::refresh::{RefreshReport, refresh};
use crate::resource::{DataValues, InstanceAddress, ResourceSet};
use crate::state::{
    Lock, LockInfo, LockPolicy, StateFile, StateRecord, StateStore, acquire_lock_with_policy,
    default_lock_owner,
};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Identity written into the lock
    pub owner: String,
    pub lock: LockPolicy,
    pub execute: ExecuteOptions,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            owner: default_lock_owner(),
            lock: LockPolicy::default(),
            execute: ExecuteOptions::default(),
        }
    }
}

/// Result of a plan run
#[derive(Debug)]
pub struct PlanOutcome {
    pub plan: Plan,
    pub graph: ResourceGraph,
    /// Present when the plan was computed against refreshed state
    pub refresh: Option<RefreshReport>,
}

/// Result of an apply or destroy run
#[derive(Debug)]
pub struct ApplyOutcome {
    pub plan: Plan,
    pub report: ApplyReport,
    pub outputs: BTreeMap<String, Value>,
}

pub struct Engine {
    store: Arc<dyn StateStore>,
    provider: Arc<dyn Provider>,
    options: EngineOptions,
}

impl Engine {
    pub fn new(store: Arc<dyn StateStore>, provider: Arc<dyn Provider>, options: EngineOptions) -> Self {
        Self {
            store,
            provider,
            options,
        }
    }

    pub fn store(&self) -> &dyn StateStore {
        self.store.as_ref()
    }

    pub fn provider(&self) -> &dyn Provider {
        self.provider.as_ref()
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    async fn lock(&self, operation: &str) -> Result<Lock> {
        acquire_lock_with_policy(self.store(), &self.options.owner, operation, &self.options.lock).await
    }

    /// Release `lock` and pass `result` through. A release failure only
    /// surfaces when the work itself succeeded.
    async fn release<T>(&self, lock: Lock, result: Result<T>) -> Result<T> {
        let released = self.store.release_lock(lock).await;
        match (result, released) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(release_error)) => {
                tracing::error!(error = %release_error, "Failed to release state lock");
                Err(e)
            }
        }
    }

    pub async fn load_state(&self) -> Result<StateFile> {
        Ok(self.store.load().await?.unwrap_or_default())
    }

    /// Read every data lookup through the provider.
    pub async fn resolve_data(&self, set: &ResourceSet) -> Result<DataValues> {
        let mut values = DataValues::new();
        for data in set.data.values() {
            tracing::debug!(data = %data.id, "Reading data source");
            let attributes = self
                .provider
                .read_data(&data.id.resource_type, &data.query)
                .await?;
            values.insert(data.id.clone(), attributes);
        }
        Ok(values)
    }

    /// Resolve data lookups and build the graph.
    pub async fn build_graph(&self, set: &ResourceSet) -> Result<ResourceGraph> {
        let data = self.resolve_data(set).await?;
        Ok(ResourceGraph::build(set, &data)?)
    }

    #[tracing::instrument(skip_all)]
    pub async fn plan(&self, set: &ResourceSet, refresh_first: bool) -> Result<PlanOutcome> {
        let lock = self.lock("plan").await?;
        let result = self.plan_locked(set, refresh_first).await;
        self.release(lock, result).await
    }

    async fn plan_locked(&self, set: &ResourceSet, refresh_first: bool) -> Result<PlanOutcome> {
        let graph = self.build_graph(set).await?;
        let state = self.load_state().await?;

        let mut observed = state.clone();
        let report = if refresh_first {
            Some(
                refresh(
                    self.provider(),
                    &mut observed,
                    self.options.execute.parallelism,
                    self.options.execute.default_timeout,
                )
                .await,
            )
        } else {
            None
        };

        let entries = diff(&graph, &observed, self.provider())?;
        // The checksum covers the stored state, which is what apply verifies
        let plan = Plan::build(&graph, &state, entries)?;
        tracing::info!(summary = %plan.summary(), "Planned");
        Ok(PlanOutcome {
            plan,
            graph,
            refresh: report,
        })
    }

    /// Plan (or load `saved`) and execute under one lock.
    #[tracing::instrument(skip_all)]
    pub async fn apply<F>(
        &self,
        set: &ResourceSet,
        saved: Option<PlanArtifact>,
        cancel: CancelHandle,
        progress: F,
    ) -> Result<ApplyOutcome>
    where
        F: Fn(StepEvent<'_>) + Send + Sync,
    {
        let lock = self.lock("apply").await?;
        let result = self.apply_locked(&lock, set, saved, cancel, progress).await;
        self.release(lock, result).await
    }

    async fn apply_locked<F>(
        &self,
        lock: &Lock,
        set: &ResourceSet,
        saved: Option<PlanArtifact>,
        cancel: CancelHandle,
        progress: F,
    ) -> Result<ApplyOutcome>
    where
        F: Fn(StepEvent<'_>) + Send + Sync,
    {
        let graph = self.build_graph(set).await?;
        let state = self.load_state().await?;
        let plan = match saved {
            Some(artifact) => Plan::from_artifact(artifact, &graph, &state)?,
            None => {
                let entries = diff(&graph, &state, self.provider())?;
                Plan::build(&graph, &state, entries)?
            }
        };
        self.execute(lock, plan, &graph, state, cancel, progress).await
    }

    /// Delete everything recorded in state, dependents first.
    #[tracing::instrument(skip_all)]
    pub async fn destroy<F>(&self, set: &ResourceSet, cancel: CancelHandle, progress: F) -> Result<ApplyOutcome>
    where
        F: Fn(StepEvent<'_>) + Send + Sync,
    {
        let lock = self.lock("destroy").await?;
        let result = self.destroy_locked(&lock, set, cancel, progress).await;
        self.release(lock, result).await
    }

    async fn destroy_locked<F>(
        &self,
        lock: &Lock,
        set: &ResourceSet,
        cancel: CancelHandle,
        progress: F,
    ) -> Result<ApplyOutcome>
    where
        F: Fn(StepEvent<'_>) + Send + Sync,
    {
        let state = self.load_state().await?;
        for record in state.records() {
            let protected = set
                .get(&record.address().resource)
                .is_some_and(|r| r.lifecycle.prevent_destroy);
            if protected {
                return Err(ConfigError::PreventDestroy {
                    address: record.address().to_string(),
                    action: "delete".to_string(),
                }
                .into());
            }
        }

        let graph = ResourceGraph::default();
        let entries = diff(&graph, &state, self.provider())?;
        let plan = Plan::build(&graph, &state, entries)?;
        self.execute(lock, plan, &graph, state, cancel, progress).await
    }

    async fn execute<F>(
        &self,
        lock: &Lock,
        plan: Plan,
        graph: &ResourceGraph,
        state: StateFile,
        cancel: CancelHandle,
        progress: F,
    ) -> Result<ApplyOutcome>
    where
        F: Fn(StepEvent<'_>) + Send + Sync,
    {
        let executor = Executor::new(self.provider(), self.store(), lock, self.options.execute.clone())
            .with_cancel(cancel)
            .with_progress(progress);
        let report = executor.execute(&plan, graph, state).await;
        let outputs = evaluate_outputs(graph, &report.state).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Could not evaluate outputs");
            BTreeMap::new()
        });
        tracing::info!(
            succeeded = report.count(|o| o.is_success()),
            failures = report.failures().len(),
            "Apply finished"
        );
        Ok(ApplyOutcome {
            plan,
            report,
            outputs,
        })
    }

    /// Read every recorded object back and commit what changed.
    #[tracing::instrument(skip_all)]
    pub async fn refresh(&self) -> Result<(RefreshReport, StateFile)> {
        let lock = self.lock("refresh").await?;
        let result = async {
            let mut state = self.load_state().await?;
            let report = refresh(
                self.provider(),
                &mut state,
                self.options.execute.parallelism,
                self.options.execute.default_timeout,
            )
            .await;
            if report.has_drift() {
                state = self.store.commit(&lock, &state).await?;
            }
            Ok::<_, EngineError>((report, state))
        }
        .await;
        self.release(lock, result).await
    }

    /// Output values computed from the current state
    pub async fn outputs(&self, set: &ResourceSet) -> Result<BTreeMap<String, Value>> {
        let graph = self.build_graph(set).await?;
        let state = self.load_state().await?;
        Ok(evaluate_outputs(&graph, &state)?)
    }

    /// Drop a record from state without touching the real object.
    #[tracing::instrument(skip(self))]
    pub async fn forget(&self, address: &InstanceAddress) -> Result<StateRecord> {
        let lock = self.lock("state rm").await?;
        let result = async {
            let mut state = self.load_state().await?;
            let record = state
                .remove(address, None)
                .ok_or_else(|| EngineError::StateNotFound(address.to_string()))?;
            self.store.commit(&lock, &state).await?;
            Ok::<_, EngineError>(record)
        }
        .await;
        self.release(lock, result).await
    }

    pub async fn lock_info(&self) -> Result<Option<LockInfo>> {
        self.store.lock_info().await
    }

    pub async fn force_unlock(&self, lock_id: &str) -> Result<LockInfo> {
        self.store.force_unlock(lock_id).await
    }
}

/// Evaluate the graph's outputs against recorded attributes.
pub fn evaluate_outputs(
    graph: &ResourceGraph,
    state: &StateFile,
) -> std::result::Result<BTreeMap<String, Value>, ConfigError> {
    let mut lookup = |address: &InstanceAddress, attribute: &str| {
        PlannedValue::Known(
            state
                .get(address)
                .and_then(|r| r.attributes.get(attribute))
                .cloned()
                .unwrap_or(Value::Null),
        )
    };
    let mut outputs = BTreeMap::new();
    for (name, expr) in graph.outputs() {
        let value = expr
            .evaluate(&mut |r| graph.resolve_reference(r, &mut lookup))
            .map_err(|message| ConfigError::InvalidExpression {
                from: format!("output.{}", name),
                message,
            })?;
        outputs.insert(name.clone(), value.as_known().cloned().unwrap_or(Value::Null));
    }
    Ok(outputs)
}
