//! Plan executor
//!
//! Walks the plan's partial order with bounded parallelism. Provider calls are
//! the only suspension points; the working state is owned by the scheduling
//! loop and only changes when a call has definitely succeeded (or a
//! reconciling read has told us what exists).

use crate::diff::{Action, DiffEntry, ReplaceOrder, attribute_changed};
use crate::error::EngineError;
use crate::expr::PlannedValue;
use crate::graph::{ResourceGraph, ResourceNode};
use crate::plan::{Plan, StepId, StepKind};
use crate::provider::{
    AttributeDelta, CreatedResource, Operation, Provider, ProviderError, ProviderErrorKind,
    ProviderResult,
};
use crate::resource::{Attributes, InstanceAddress};
use crate::state::{Lock, StateFile, StateRecord, StateStore};
use futures_util::future::{BoxFuture, FutureExt};
use futures_util::stream::{FuturesUnordered, StreamExt};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Executor settings
#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    /// Maximum concurrent provider operations
    pub parallelism: usize,

    /// Timeout for operations the provider gives none for
    pub default_timeout: Option<Duration>,

    /// Commit the working state after every completed step
    pub checkpoint: bool,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            parallelism: 10,
            default_timeout: None,
            checkpoint: true,
        }
    }
}

/// Requests cancellation of a running apply. Running provider calls finish;
/// nothing new starts.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
    Cancelled,
}

impl StepStatus {
    fn can_become(self, next: StepStatus) -> bool {
        use StepStatus::*;
        matches!(
            (self, next),
            (Pending, Running | Skipped | Cancelled) | (Running, Success | Failed)
        )
    }
}

fn advance(status: &mut StepStatus, next: StepStatus) {
    debug_assert!(
        status.can_become(next),
        "illegal step transition {:?} -> {:?}",
        status,
        next
    );
    *status = next;
}

/// Final result of a step or an entry
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success,
    Failed(ProviderError),
    /// Not started because an upstream step failed
    Skipped { upstream: String },
    /// Not started because the apply was cancelled or halted
    Cancelled,
}

impl Outcome {
    fn rank(&self) -> u8 {
        match self {
            Outcome::Success => 0,
            Outcome::Cancelled => 1,
            Outcome::Skipped { .. } => 2,
            Outcome::Failed(_) => 3,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Success => write!(f, "success"),
            Outcome::Failed(e) => write!(f, "failed ({})", e),
            Outcome::Skipped { upstream } => write!(f, "skipped (upstream {} did not succeed)", upstream),
            Outcome::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StepResult {
    pub step: StepId,
    pub outcome: Outcome,
    pub duration: Duration,
}

/// Result of one diff entry, folded over its steps
#[derive(Debug, Clone, PartialEq)]
pub struct EntryResult {
    pub address: InstanceAddress,
    pub deposed: Option<String>,
    pub action: Action,
    pub outcome: Outcome,
}

/// Progress notifications
#[derive(Debug, Clone, Copy)]
pub enum StepEvent<'e> {
    Started(&'e StepId),
    Finished(&'e StepId, &'e Outcome),
}

/// Everything an apply produced
#[derive(Debug)]
pub struct ApplyReport {
    /// Step results in completion order
    pub steps: Vec<StepResult>,

    /// Per-entry results, in plan order
    pub entries: Vec<EntryResult>,

    /// Working state at the end of the walk; committed unless `commit_error`
    pub state: StateFile,

    pub commit_error: Option<EngineError>,

    pub cancelled: bool,

    pub duration: Duration,
}

impl ApplyReport {
    pub fn is_success(&self) -> bool {
        self.commit_error.is_none() && self.entries.iter().all(|e| e.outcome.is_success())
    }

    /// Every failed step with its error, all of them rather than the first
    pub fn failures(&self) -> Vec<(&StepId, &ProviderError)> {
        self.steps
            .iter()
            .filter_map(|s| match &s.outcome {
                Outcome::Failed(e) => Some((&s.step, e)),
                _ => None,
            })
            .collect()
    }

    /// Failures whose real-world effect is unknown
    pub fn ambiguous(&self) -> Vec<(&StepId, &ProviderError)> {
        self.failures()
            .into_iter()
            .filter(|(_, e)| e.kind == ProviderErrorKind::Ambiguous)
            .collect()
    }

    /// [`EngineError::AmbiguousState`] naming every ambiguous step, if any
    pub fn ambiguity(&self) -> Option<EngineError> {
        let steps: Vec<String> = self.ambiguous().iter().map(|(s, _)| s.to_string()).collect();
        if steps.is_empty() {
            return None;
        }
        Some(EngineError::AmbiguousState(steps.join(", ")))
    }

    pub fn count(&self, pred: impl Fn(&Outcome) -> bool) -> usize {
        self.entries.iter().filter(|e| pred(&e.outcome)).count()
    }
}

type ProgressFn<'a> = Box<dyn Fn(StepEvent<'_>) + Send + Sync + 'a>;

/// Executes a plan under a held lock
pub struct Executor<'a> {
    provider: &'a dyn Provider,
    store: &'a dyn StateStore,
    lock: &'a Lock,
    options: ExecuteOptions,
    cancel: CancelHandle,
    progress: Option<ProgressFn<'a>>,
}

enum Job {
    Create {
        resource_type: String,
        attributes: Attributes,
    },
    Update {
        resource_type: String,
        id: String,
        delta: AttributeDelta,
    },
    Delete {
        resource_type: String,
        id: String,
    },
}

enum JobOutput {
    Created(CreatedResource),
    Updated(Attributes),
    Deleted,
    /// The call timed out; a reconciling read found `current`
    Reconciled {
        current: Option<Attributes>,
        error: ProviderError,
    },
}

enum Prepared {
    Call(Job),
    /// Nothing left to call the provider for
    Done,
}

/// Per-walk bookkeeping
struct Walk {
    state: StateFile,
    dirty: bool,
    /// Deposed keys of objects set aside by create-before-destroy
    set_aside: BTreeMap<InstanceAddress, String>,
    /// Record targeted by each running delete
    delete_targets: BTreeMap<usize, Option<String>>,
}

impl<'a> Executor<'a> {
    pub fn new(
        provider: &'a dyn Provider,
        store: &'a dyn StateStore,
        lock: &'a Lock,
        options: ExecuteOptions,
    ) -> Self {
        Self {
            provider,
            store,
            lock,
            options,
            cancel: CancelHandle::new(),
            progress: None,
        }
    }

    pub fn with_cancel(mut self, cancel: CancelHandle) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_progress(mut self, progress: impl Fn(StepEvent<'_>) + Send + Sync + 'a) -> Self {
        self.progress = Some(Box::new(progress));
        self
    }

    fn notify(&self, event: StepEvent<'_>) {
        if let Some(progress) = &self.progress {
            progress(event);
        }
    }

    /// Run `plan` against `state` (the state it was planned from) and commit
    /// whatever succeeded.
    #[tracing::instrument(skip_all, fields(steps = plan.steps().len(), parallelism = self.options.parallelism))]
    pub async fn execute(&self, plan: &Plan, graph: &ResourceGraph, state: StateFile) -> ApplyReport {
        let started = Instant::now();
        let steps = plan.steps();
        let n = steps.len();
        let index: BTreeMap<&StepId, usize> =
            steps.iter().enumerate().map(|(i, s)| (&s.id, i)).collect();
        let parallelism = self.options.parallelism.max(1);

        let mut status = vec![StepStatus::Pending; n];
        let mut outcomes: Vec<Option<Outcome>> = vec![None; n];
        let mut started_at: Vec<Option<Instant>> = vec![None; n];
        let mut results = Vec::with_capacity(n);
        let mut walk = Walk {
            state,
            dirty: false,
            set_aside: BTreeMap::new(),
            delete_targets: BTreeMap::new(),
        };
        let mut commit_error: Option<EngineError> = None;
        let mut running: FuturesUnordered<BoxFuture<'a, (usize, ProviderResult<JobOutput>)>> =
            FuturesUnordered::new();

        loop {
            let mut settled_now = false;
            if commit_error.is_none() && !self.cancel.is_cancelled() {
                for i in 0..n {
                    if running.len() >= parallelism {
                        break;
                    }
                    if status[i] != StepStatus::Pending {
                        continue;
                    }
                    let ready = steps[i]
                        .depends_on
                        .iter()
                        .all(|d| index.get(d).is_none_or(|j| status[*j] == StepStatus::Success));
                    if !ready {
                        continue;
                    }

                    let id = &steps[i].id;
                    let entry = plan.entry(&steps[i]);
                    advance(&mut status[i], StepStatus::Running);
                    started_at[i] = Some(Instant::now());
                    self.notify(StepEvent::Started(id));
                    tracing::info!(step = %id, "Starting");

                    match self.prepare(i, id, entry, graph, &mut walk) {
                        Ok(Prepared::Call(job)) => {
                            let timeout = self.timeout_for(id, &job);
                            let provider = self.provider;
                            running.push(run_job(provider, job, timeout).map(move |r| (i, r)).boxed());
                        }
                        Ok(Prepared::Done) => {
                            settled_now = true;
                            self.settle(i, id, Outcome::Success, &mut status, &mut outcomes, &started_at, &mut results);
                        }
                        Err(e) => {
                            settled_now = true;
                            self.settle(i, id, Outcome::Failed(e), &mut status, &mut outcomes, &started_at, &mut results);
                        }
                    }
                }
            }

            propagate_skips(plan, &index, &mut status, &mut outcomes, &mut results);

            if running.is_empty() {
                if settled_now {
                    self.checkpoint(&mut walk, &mut commit_error).await;
                    continue;
                }
                break;
            }

            let Some((i, result)) = running.next().await else {
                break;
            };
            let id = &steps[i].id;
            let outcome = self.finish(i, id, plan.entry(&steps[i]), graph, &mut walk, result);
            self.settle(i, id, outcome, &mut status, &mut outcomes, &started_at, &mut results);
            propagate_skips(plan, &index, &mut status, &mut outcomes, &mut results);
            self.checkpoint(&mut walk, &mut commit_error).await;
        }

        let cancelled = self.cancel.is_cancelled();
        for i in 0..n {
            if status[i] == StepStatus::Pending {
                advance(&mut status[i], StepStatus::Cancelled);
                outcomes[i] = Some(Outcome::Cancelled);
                results.push(StepResult {
                    step: steps[i].id.clone(),
                    outcome: Outcome::Cancelled,
                    duration: Duration::ZERO,
                });
            }
        }

        if walk.dirty && commit_error.is_none() {
            match self.store.commit(self.lock, &walk.state).await {
                Ok(next) => walk.state = next,
                Err(e) => commit_error = Some(e),
            }
        }
        if let Some(e) = &commit_error {
            tracing::error!(error = %e, "Failed to commit state");
        }

        let entries = plan
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.is_change())
            .map(|(entry_index, e)| {
                let outcome = steps
                    .iter()
                    .enumerate()
                    .filter(|(_, s)| s.entry == entry_index)
                    .filter_map(|(i, _)| outcomes[i].clone())
                    .max_by_key(|o| o.rank())
                    .unwrap_or(Outcome::Cancelled);
                EntryResult {
                    address: e.address.clone(),
                    deposed: e.deposed.clone(),
                    action: e.action,
                    outcome,
                }
            })
            .collect();

        ApplyReport {
            steps: results,
            entries,
            state: walk.state,
            commit_error,
            cancelled,
            duration: started.elapsed(),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn settle(
        &self,
        i: usize,
        id: &StepId,
        outcome: Outcome,
        status: &mut [StepStatus],
        outcomes: &mut [Option<Outcome>],
        started_at: &[Option<Instant>],
        results: &mut Vec<StepResult>,
    ) {
        let next = if outcome.is_success() {
            StepStatus::Success
        } else {
            StepStatus::Failed
        };
        advance(&mut status[i], next);
        match &outcome {
            Outcome::Failed(e) => tracing::warn!(step = %id, error = %e, "Step failed"),
            _ => tracing::info!(step = %id, "Step complete"),
        }
        self.notify(StepEvent::Finished(id, &outcome));
        results.push(StepResult {
            step: id.clone(),
            outcome: outcome.clone(),
            duration: started_at[i].map(|t| t.elapsed()).unwrap_or_default(),
        });
        outcomes[i] = Some(outcome);
    }

    async fn checkpoint(&self, walk: &mut Walk, commit_error: &mut Option<EngineError>) {
        if !self.options.checkpoint || !walk.dirty || commit_error.is_some() {
            return;
        }
        match self.store.commit(self.lock, &walk.state).await {
            Ok(next) => {
                tracing::debug!(serial = next.serial, "Checkpointed state");
                walk.state = next;
                walk.dirty = false;
            }
            Err(e) => {
                tracing::error!(error = %e, "Checkpoint failed, halting");
                *commit_error = Some(e);
            }
        }
    }

    fn timeout_for(&self, id: &StepId, job: &Job) -> Option<Duration> {
        let operation = match job {
            Job::Create { .. } => Operation::Create,
            Job::Update { .. } => Operation::Update,
            Job::Delete { .. } => Operation::Delete,
        };
        self.provider
            .operation_timeout(id.address.resource_type(), operation)
            .or(self.options.default_timeout)
    }

    fn prepare(
        &self,
        i: usize,
        id: &StepId,
        entry: &DiffEntry,
        graph: &ResourceGraph,
        walk: &mut Walk,
    ) -> ProviderResult<Prepared> {
        let address = &id.address;
        let resource_type = address.resource_type().to_string();
        match id.kind {
            StepKind::Create => {
                let node = node_for(graph, address)?;
                let attributes = evaluate(graph, node, &walk.state)?;
                if is_create_before_destroy(entry)
                    && let Some(mut old) = walk.state.remove(address, None)
                {
                    let key = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
                    tracing::debug!(address = %address, deposed = %key, "Setting old object aside");
                    old.deposed = Some(key.clone());
                    walk.state.upsert(old);
                    walk.set_aside.insert(address.clone(), key);
                    walk.dirty = true;
                }
                Ok(Prepared::Call(Job::Create {
                    resource_type,
                    attributes,
                }))
            }
            StepKind::Update => {
                let node = node_for(graph, address)?;
                let desired = evaluate(graph, node, &walk.state)?;
                let record = walk.state.get(address).ok_or_else(|| {
                    ProviderError::permanent(format!("{} has no state record to update", address))
                })?;
                let object_id = record_id(record)?;

                let mut merged = record.attributes.clone();
                let mut changed = BTreeSet::new();
                for (name, value) in desired {
                    if node.lifecycle.ignore_changes.contains(&name) {
                        continue;
                    }
                    let semantics = self.provider.collection_semantics(&resource_type, &name);
                    if attribute_changed(
                        record.attributes.get(&name),
                        &PlannedValue::Known(value.clone()),
                        semantics,
                    ) {
                        changed.insert(name.clone());
                    }
                    merged.insert(name, value);
                }
                Ok(Prepared::Call(Job::Update {
                    resource_type,
                    id: object_id,
                    delta: AttributeDelta {
                        prior: record.attributes.clone(),
                        desired: merged,
                        changed,
                    },
                }))
            }
            StepKind::Delete => {
                let deposed = id.deposed.clone().or_else(|| {
                    if is_create_before_destroy(entry) {
                        walk.set_aside.get(address).cloned()
                    } else {
                        None
                    }
                });
                let Some(record) = walk.state.find(address, deposed.as_deref()) else {
                    return Ok(Prepared::Done);
                };
                let Some(object_id) = record.id().map(str::to_string) else {
                    walk.state.remove(address, deposed.as_deref());
                    walk.dirty = true;
                    return Ok(Prepared::Done);
                };
                walk.delete_targets.insert(i, deposed);
                Ok(Prepared::Call(Job::Delete {
                    resource_type,
                    id: object_id,
                }))
            }
        }
    }

    fn finish(
        &self,
        i: usize,
        id: &StepId,
        entry: &DiffEntry,
        graph: &ResourceGraph,
        walk: &mut Walk,
        result: ProviderResult<JobOutput>,
    ) -> Outcome {
        let address = &id.address;
        match (id.kind, result) {
            (StepKind::Create, Ok(JobOutput::Created(created))) => {
                let mut record = StateRecord::new(address, created.attributes);
                record
                    .attributes
                    .insert("id".to_string(), Value::String(created.id));
                record.schema_version = self.provider.schema_version(address.resource_type());
                record.provider_private_data = created.private;
                record.dependencies = graph
                    .node(address)
                    .map(|n| n.dependencies.iter().cloned().collect())
                    .unwrap_or_default();
                walk.state.upsert(record);
                walk.dirty = true;
                Outcome::Success
            }
            (StepKind::Create, Err(e)) => {
                // Put a set-aside object back; nothing replaced it
                if is_create_before_destroy(entry)
                    && e.kind != ProviderErrorKind::Ambiguous
                    && let Some(key) = walk.set_aside.remove(address)
                    && let Some(mut old) = walk.state.remove(address, Some(&key))
                {
                    old.deposed = None;
                    walk.state.upsert(old);
                    walk.dirty = true;
                }
                Outcome::Failed(e)
            }
            (StepKind::Update, Ok(JobOutput::Updated(attributes))) => {
                if let Some(record) = walk.state.get_mut(address) {
                    let object_id = record.attributes.get("id").cloned();
                    record.attributes = attributes;
                    if let Some(object_id) = object_id {
                        record.attributes.entry("id".to_string()).or_insert(object_id);
                    }
                    record.dependencies = graph
                        .node(address)
                        .map(|n| n.dependencies.iter().cloned().collect())
                        .unwrap_or_default();
                    walk.dirty = true;
                }
                Outcome::Success
            }
            (StepKind::Delete, Ok(JobOutput::Deleted)) => {
                let deposed = walk.delete_targets.remove(&i).flatten();
                walk.state.remove(address, deposed.as_deref());
                walk.dirty = true;
                Outcome::Success
            }
            (StepKind::Delete, Err(e)) if e.kind == ProviderErrorKind::NotFound => {
                tracing::debug!(address = %address, "Already gone");
                let deposed = walk.delete_targets.remove(&i).flatten();
                walk.state.remove(address, deposed.as_deref());
                walk.dirty = true;
                Outcome::Success
            }
            (kind, Ok(JobOutput::Reconciled { current, error })) => {
                let deposed = if kind == StepKind::Delete {
                    walk.delete_targets.remove(&i).flatten()
                } else {
                    None
                };
                match current {
                    Some(attributes) => {
                        let record = match &deposed {
                            Some(key) => walk
                                .state
                                .resources
                                .iter_mut()
                                .find(|r| {
                                    r.deposed.as_deref() == Some(key.as_str())
                                        && r.address() == *address
                                }),
                            None => walk.state.get_mut(address),
                        };
                        if let Some(record) = record {
                            let object_id = record.attributes.get("id").cloned();
                            record.attributes = attributes;
                            if let Some(object_id) = object_id {
                                record.attributes.entry("id".to_string()).or_insert(object_id);
                            }
                        }
                    }
                    None => {
                        walk.state.remove(address, deposed.as_deref());
                    }
                }
                walk.dirty = true;
                Outcome::Failed(error)
            }
            (_, Err(e)) => {
                walk.delete_targets.remove(&i);
                Outcome::Failed(e)
            }
            (kind, Ok(_)) => Outcome::Failed(ProviderError::permanent(format!(
                "provider returned an unexpected result for {} {}",
                kind, address
            ))),
        }
    }
}

fn is_create_before_destroy(entry: &DiffEntry) -> bool {
    entry.action == Action::Replace && entry.replace_order == Some(ReplaceOrder::CreateBeforeDestroy)
}

fn node_for<'g>(graph: &'g ResourceGraph, address: &InstanceAddress) -> ProviderResult<&'g ResourceNode> {
    graph.node(address).ok_or_else(|| {
        ProviderError::permanent(format!("{} is not in the configuration", address))
    })
}

fn record_id(record: &StateRecord) -> ProviderResult<String> {
    record
        .id()
        .map(str::to_string)
        .ok_or_else(|| ProviderError::permanent(format!("{} has no recorded id", record.address())))
}

/// Evaluate a node's attributes against the working state. Every dependency
/// has been applied by now, so unknown values are an error.
fn evaluate(graph: &ResourceGraph, node: &ResourceNode, state: &StateFile) -> ProviderResult<Attributes> {
    let mut lookup = |address: &InstanceAddress, attribute: &str| {
        PlannedValue::Known(
            state
                .get(address)
                .and_then(|r| r.attributes.get(attribute))
                .cloned()
                .unwrap_or(Value::Null),
        )
    };
    let mut attributes = Attributes::new();
    for (name, expr) in &node.attributes {
        let value = expr
            .evaluate(&mut |r| graph.resolve_reference(r, &mut lookup))
            .map_err(|message| {
                ProviderError::permanent(format!("{}.{}: {}", node.address, name, message))
            })?;
        match value {
            PlannedValue::Known(v) => {
                attributes.insert(name.clone(), v);
            }
            PlannedValue::Unknown => {
                return Err(ProviderError::permanent(format!(
                    "{}.{} is still unknown",
                    node.address, name
                )));
            }
        }
    }
    Ok(attributes)
}

/// Mark pending steps downstream of a failure as skipped. Steps are in
/// topological order, so one pass reaches every transitive dependent.
fn propagate_skips(
    plan: &Plan,
    index: &BTreeMap<&StepId, usize>,
    status: &mut [StepStatus],
    outcomes: &mut [Option<Outcome>],
    results: &mut Vec<StepResult>,
) {
    for (i, step) in plan.steps().iter().enumerate() {
        if status[i] != StepStatus::Pending {
            continue;
        }
        let upstream = step.depends_on.iter().find(|d| {
            index
                .get(d)
                .is_some_and(|j| matches!(status[*j], StepStatus::Failed | StepStatus::Skipped))
        });
        if let Some(upstream) = upstream {
            let outcome = Outcome::Skipped {
                upstream: upstream.to_string(),
            };
            tracing::info!(step = %step.id, upstream = %upstream, "Skipping");
            advance(&mut status[i], StepStatus::Skipped);
            results.push(StepResult {
                step: step.id.clone(),
                outcome: outcome.clone(),
                duration: Duration::ZERO,
            });
            outcomes[i] = Some(outcome);
        }
    }
}

async fn with_timeout<T>(limit: Option<Duration>, fut: impl Future<Output = T>) -> Option<T> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut).await.ok(),
        None => Some(fut.await),
    }
}

async fn run_job(
    provider: &dyn Provider,
    job: Job,
    timeout: Option<Duration>,
) -> ProviderResult<JobOutput> {
    match job {
        Job::Create {
            resource_type,
            attributes,
        } => match with_timeout(timeout, provider.create(&resource_type, &attributes)).await {
            Some(result) => result.map(JobOutput::Created),
            // Without an id there is nothing to read back
            None => Err(ProviderError::ambiguous(format!(
                "create of {} timed out; the object may exist",
                resource_type
            ))),
        },
        Job::Update {
            resource_type,
            id,
            delta,
        } => match with_timeout(timeout, provider.update(&resource_type, &id, &delta)).await {
            Some(result) => result.map(JobOutput::Updated),
            None => reconcile(provider, &resource_type, &id, timeout, Operation::Update).await,
        },
        Job::Delete { resource_type, id } => {
            match with_timeout(timeout, provider.delete(&resource_type, &id)).await {
                Some(result) => result.map(|()| JobOutput::Deleted),
                None => reconcile(provider, &resource_type, &id, timeout, Operation::Delete).await,
            }
        }
    }
}

/// After a timeout, read the object back so the outcome is a definite
/// `Failed(timeout)`; if even that fails the outcome is ambiguous.
async fn reconcile(
    provider: &dyn Provider,
    resource_type: &str,
    id: &str,
    timeout: Option<Duration>,
    operation: Operation,
) -> ProviderResult<JobOutput> {
    tracing::warn!(resource_type, id, %operation, "Operation timed out, reading back");
    let read_timeout = provider
        .operation_timeout(resource_type, Operation::Read)
        .or(timeout);
    match with_timeout(read_timeout, provider.read(resource_type, id)).await {
        Some(Ok(current)) => Ok(JobOutput::Reconciled {
            current,
            error: ProviderError::timeout(format!("{} of {} {} timed out", operation, resource_type, id)),
        }),
        Some(Err(e)) => Err(ProviderError::ambiguous(format!(
            "{} of {} {} timed out and reading it back failed: {}",
            operation, resource_type, id, e
        ))),
        None => Err(ProviderError::ambiguous(format!(
            "{} of {} {} timed out and reading it back timed out",
            operation, resource_type, id
        ))),
    }
}
