//! Plan builder
//!
//! Decomposes diff entries into steps (a Replace becomes a delete and a
//! create) and orders them as a partial order the executor can parallelize.

use crate::diff::{Action, DiffEntry, ReplaceOrder};
use crate::error::{ConfigError, EngineError, Result};
use crate::graph::ResourceGraph;
use crate::resource::{InstanceAddress, Lifecycle};
use crate::state::{FORMAT_VERSION, StateFile, StateRecord};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StepKind {
    Delete,
    Create,
    Update,
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepKind::Delete => write!(f, "delete"),
            StepKind::Create => write!(f, "create"),
            StepKind::Update => write!(f, "update"),
        }
    }
}

/// Identity of one provider call in the plan
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StepId {
    pub address: InstanceAddress,
    pub deposed: Option<String>,
    pub kind: StepKind,
}

impl StepId {
    fn new(address: &InstanceAddress, deposed: Option<&String>, kind: StepKind) -> Self {
        Self {
            address: address.clone(),
            deposed: deposed.cloned(),
            kind,
        }
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.address)?;
        if let Some(deposed) = &self.deposed {
            write!(f, " (deposed {})", deposed)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlanStep {
    pub id: StepId,
    /// Index into [`Plan::entries`]
    pub entry: usize,
    /// Steps that must finish before this one starts
    pub depends_on: BTreeSet<StepId>,
}

/// Ordered diff entries plus the step partial order
#[derive(Debug, Clone)]
pub struct Plan {
    /// sha256 over the graph and the state the plan was computed from
    pub checksum: String,

    /// Entries in step order, no-ops last
    pub entries: Vec<DiffEntry>,

    /// Steps in a topological order of the partial order
    steps: Vec<PlanStep>,

    /// Whether the plan has any changes
    pub has_changes: bool,
}

impl Plan {
    /// Order `entries` against `graph` and the recorded dependencies in `state`.
    #[tracing::instrument(skip_all, fields(entries = entries.len()))]
    pub fn build(
        graph: &ResourceGraph,
        state: &StateFile,
        entries: Vec<DiffEntry>,
    ) -> std::result::Result<Self, ConfigError> {
        let checksum = checksum(graph, state);
        let mut steps = decompose(&entries);
        add_ordering(&mut steps, &entries, graph, state);
        let order = order_steps(&steps)?;

        // Entries follow the first position of their steps
        let mut position: BTreeMap<usize, usize> = BTreeMap::new();
        for (i, id) in order.iter().enumerate() {
            position.entry(steps[id].entry).or_insert(i);
        }
        let mut indices: Vec<usize> = (0..entries.len()).collect();
        indices.sort_by_key(|i| position.get(i).copied().unwrap_or(usize::MAX));
        let remap: BTreeMap<usize, usize> = indices
            .iter()
            .enumerate()
            .map(|(new, old)| (*old, new))
            .collect();

        let ordered_steps = order
            .into_iter()
            .filter_map(|id| steps.remove(&id))
            .map(|mut step| {
                step.entry = remap[&step.entry];
                step
            })
            .collect();

        let mut slots: Vec<Option<DiffEntry>> = entries.into_iter().map(Some).collect();
        let entries: Vec<DiffEntry> = indices.iter().filter_map(|i| slots[*i].take()).collect();
        let has_changes = entries.iter().any(|e| e.is_change());

        Ok(Self {
            checksum,
            entries,
            steps: ordered_steps,
            has_changes,
        })
    }

    /// Rebuild a saved plan, failing with [`EngineError::StalePlan`] unless the
    /// graph and state still match what it was computed from.
    pub fn from_artifact(
        artifact: PlanArtifact,
        graph: &ResourceGraph,
        state: &StateFile,
    ) -> Result<Self> {
        if artifact.format_version != FORMAT_VERSION {
            return Err(EngineError::UnsupportedFormatVersion(artifact.format_version));
        }
        if checksum(graph, state) != artifact.plan_checksum {
            return Err(EngineError::StalePlan);
        }
        Ok(Self::build(graph, state, artifact.entries)?)
    }

    pub fn steps(&self) -> &[PlanStep] {
        &self.steps
    }

    pub fn entry(&self, step: &PlanStep) -> &DiffEntry {
        &self.entries[step.entry]
    }

    /// Entries by action
    pub fn entries_by_action(&self, action: Action) -> Vec<&DiffEntry> {
        self.entries.iter().filter(|e| e.action == action).collect()
    }

    /// Summary of the plan
    pub fn summary(&self) -> PlanSummary {
        PlanSummary {
            create: self.entries_by_action(Action::Create).len(),
            update: self.entries_by_action(Action::Update).len(),
            replace: self.entries_by_action(Action::Replace).len(),
            delete: self.entries_by_action(Action::Delete).len(),
            no_change: self.entries_by_action(Action::NoOp).len(),
        }
    }

    pub fn to_artifact(&self) -> PlanArtifact {
        PlanArtifact {
            format_version: FORMAT_VERSION,
            plan_checksum: self.checksum.clone(),
            entries: self.entries.clone(),
        }
    }
}

/// Summary of planned actions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanSummary {
    pub create: usize,
    pub update: usize,
    pub replace: usize,
    pub delete: usize,
    pub no_change: usize,
}

impl fmt::Display for PlanSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} to create, {} to update, {} to replace, {} to delete, {} unchanged",
            self.create, self.update, self.replace, self.delete, self.no_change
        )
    }
}

/// Persisted plan, applied later with `apply <file>`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanArtifact {
    pub format_version: u32,
    pub plan_checksum: String,
    pub entries: Vec<DiffEntry>,
}

impl PlanArtifact {
    pub async fn write(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, content).await?;
        tracing::debug!(path = %path.display(), "Wrote plan artifact");
        Ok(())
    }

    pub async fn read(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        Ok(serde_json::from_str(&content)?)
    }
}

#[derive(Serialize)]
struct ChecksumNode<'a> {
    address: &'a InstanceAddress,
    attributes: &'a BTreeMap<String, crate::expr::Expr>,
    dependencies: &'a BTreeSet<InstanceAddress>,
    lifecycle: &'a Lifecycle,
}

#[derive(Serialize)]
struct ChecksumInput<'a> {
    nodes: Vec<ChecksumNode<'a>>,
    lineage: Option<&'a str>,
    serial: u64,
    resources: &'a [StateRecord],
}

/// Checksum over the graph's identities and attribute expressions plus the
/// state document. A state that was never committed has no stable lineage
/// yet, so it only contributes its (empty) contents.
pub fn checksum(graph: &ResourceGraph, state: &StateFile) -> String {
    let input = ChecksumInput {
        nodes: graph
            .nodes()
            .map(|n| ChecksumNode {
                address: &n.address,
                attributes: &n.attributes,
                dependencies: &n.dependencies,
                lifecycle: &n.lifecycle,
            })
            .collect(),
        lineage: (state.serial > 0).then_some(state.lineage.as_str()),
        serial: state.serial,
        resources: &state.resources,
    };
    // Serializing these types cannot fail: all map keys are strings
    let bytes = serde_json::to_vec(&input).unwrap_or_default();
    hex::encode(Sha256::digest(&bytes))
}

fn decompose(entries: &[DiffEntry]) -> BTreeMap<StepId, PlanStep> {
    let mut steps = BTreeMap::new();
    let mut add = |entry: usize, id: StepId| {
        steps.insert(
            id.clone(),
            PlanStep {
                id,
                entry,
                depends_on: BTreeSet::new(),
            },
        );
    };
    for (i, e) in entries.iter().enumerate() {
        let deposed = e.deposed.as_ref();
        match e.action {
            Action::NoOp => {}
            Action::Create => add(i, StepId::new(&e.address, None, StepKind::Create)),
            Action::Update => add(i, StepId::new(&e.address, None, StepKind::Update)),
            Action::Delete => add(i, StepId::new(&e.address, deposed, StepKind::Delete)),
            Action::Replace => {
                add(i, StepId::new(&e.address, None, StepKind::Delete));
                add(i, StepId::new(&e.address, None, StepKind::Create));
            }
        }
    }
    steps
}

fn add_ordering(
    steps: &mut BTreeMap<StepId, PlanStep>,
    entries: &[DiffEntry],
    graph: &ResourceGraph,
    state: &StateFile,
) {
    let step = |address: &InstanceAddress, kind| StepId::new(address, None, kind);
    let forward = |address: &InstanceAddress| -> Option<StepId> {
        [StepKind::Create, StepKind::Update]
            .into_iter()
            .map(|kind| step(address, kind))
            .find(|id| steps.contains_key(id))
    };

    // Nearest forward steps among dependencies, looking through no-op nodes
    let forward_ancestors = |address: &InstanceAddress| -> BTreeSet<StepId> {
        let mut found = BTreeSet::new();
        let mut seen = BTreeSet::new();
        let mut stack: Vec<&InstanceAddress> = graph.dependencies(address).collect();
        while let Some(dep) = stack.pop() {
            if !seen.insert(dep) {
                continue;
            }
            match forward(dep) {
                Some(id) => {
                    found.insert(id);
                }
                None => stack.extend(graph.dependencies(dep)),
            }
        }
        found
    };

    let replace_order = |address: &InstanceAddress| -> Option<ReplaceOrder> {
        entries
            .iter()
            .find(|e| e.deposed.is_none() && &e.address == address && e.action == Action::Replace)
            .and_then(|e| e.replace_order)
    };

    // Records being deleted outright (orphans and deposed objects)
    let doomed: Vec<&StateRecord> = state
        .records()
        .filter(|r| r.deposed.is_some() || !graph.contains(&r.address()))
        .collect();

    let mut edges: Vec<(StepId, StepId)> = Vec::new();
    for id in steps.keys() {
        let address = &id.address;
        match id.kind {
            StepKind::Create | StepKind::Update => {
                for dep in forward_ancestors(address) {
                    edges.push((id.clone(), dep));
                }
                if id.kind == StepKind::Create
                    && replace_order(address) == Some(ReplaceOrder::DestroyBeforeCreate)
                {
                    edges.push((id.clone(), step(address, StepKind::Delete)));
                }
            }
            StepKind::Delete => {
                let dependents: Vec<&InstanceAddress> = graph.dependents(address).collect();
                match (id.deposed.is_some(), replace_order(address)) {
                    (false, Some(ReplaceOrder::DestroyBeforeCreate)) => {
                        for dependent in &dependents {
                            if replace_order(dependent) == Some(ReplaceOrder::DestroyBeforeCreate) {
                                edges.push((id.clone(), step(dependent, StepKind::Delete)));
                            }
                        }
                    }
                    (false, Some(ReplaceOrder::CreateBeforeDestroy)) => {
                        edges.push((id.clone(), step(address, StepKind::Create)));
                        for dependent in &dependents {
                            if let Some(f) = forward(dependent) {
                                edges.push((id.clone(), f));
                            }
                            edges.push((id.clone(), step(dependent, StepKind::Delete)));
                        }
                    }
                    _ => {
                        // Orphan or deposed: let referencing records move first
                        if id.deposed.is_some() {
                            if let Some(f) = forward(address) {
                                edges.push((id.clone(), f));
                            }
                            for dependent in &dependents {
                                if let Some(f) = forward(dependent) {
                                    edges.push((id.clone(), f));
                                }
                            }
                        }
                        for record in state.records() {
                            if record.deposed.is_some() || !record.dependencies.contains(address) {
                                continue;
                            }
                            if let Some(f) = forward(&record.address()) {
                                edges.push((id.clone(), f));
                            }
                        }
                    }
                }
                // Deleted records that depended on this one go first
                for record in &doomed {
                    let target = StepId::new(&record.address(), record.deposed.as_ref(), StepKind::Delete);
                    if record.dependencies.contains(address) && target != *id {
                        edges.push((id.clone(), target));
                    }
                }
            }
        }
    }

    for (from, to) in edges {
        if from != to && steps.contains_key(&to)
            && let Some(step) = steps.get_mut(&from)
        {
            step.depends_on.insert(to);
        }
    }
}

/// Kahn's algorithm over the steps, ties broken by step id.
fn order_steps(steps: &BTreeMap<StepId, PlanStep>) -> std::result::Result<Vec<StepId>, ConfigError> {
    let mut in_degree: BTreeMap<&StepId, usize> =
        steps.iter().map(|(id, s)| (id, s.depends_on.len())).collect();
    let mut dependents: BTreeMap<&StepId, Vec<&StepId>> = BTreeMap::new();
    for (id, s) in steps {
        for dep in &s.depends_on {
            dependents.entry(dep).or_default().push(id);
        }
    }
    let mut ready: BTreeSet<&StepId> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(id, _)| *id)
        .collect();

    let mut order = Vec::with_capacity(steps.len());
    while let Some(next) = ready.pop_first() {
        order.push(next.clone());
        for dependent in dependents.get(next).into_iter().flatten() {
            if let Some(degree) = in_degree.get_mut(dependent) {
                *degree -= 1;
                if *degree == 0 {
                    ready.insert(dependent);
                }
            }
        }
    }

    if order.len() < steps.len() {
        let stuck = in_degree
            .into_iter()
            .filter(|(_, d)| *d > 0)
            .map(|(id, _)| id.to_string())
            .collect();
        return Err(ConfigError::Cycle(stuck));
    }
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::diff;
    use crate::diff::tests::SchemaProvider;
    use crate::expr::{Expr, Reference};
    use crate::resource::{Attributes, DataValues, ResourceConfig, ResourceSet};
    use serde_json::json;

    fn record(name: &str, attrs: serde_json::Value) -> StateRecord {
        let attributes: Attributes = serde_json::from_value(attrs).unwrap();
        StateRecord::new(&InstanceAddress::single("vm", name), attributes)
    }

    fn plan(set: &ResourceSet, state: &StateFile) -> Plan {
        let graph = ResourceGraph::build(set, &DataValues::new()).unwrap();
        let entries = diff(&graph, state, &SchemaProvider).unwrap();
        Plan::build(&graph, state, entries).unwrap()
    }

    fn step_names(plan: &Plan) -> Vec<String> {
        plan.steps().iter().map(|s| s.id.to_string()).collect()
    }

    fn step<'a>(plan: &'a Plan, name: &str) -> &'a PlanStep {
        plan.steps()
            .iter()
            .find(|s| s.id.to_string() == name)
            .unwrap()
    }

    fn a_and_b(a: ResourceConfig) -> ResourceSet {
        let mut set = ResourceSet::new();
        set.add(a).unwrap();
        set.add(ResourceConfig::new("vm", "b").with_attribute("size", Expr::reference(Reference::to("vm", "a", "id"))))
            .unwrap();
        set
    }

    #[test]
    fn test_create_dependency_order() {
        let plan = plan(&a_and_b(ResourceConfig::new("vm", "a")), &StateFile::new());
        assert_eq!(step_names(&plan), vec!["create vm.a", "create vm.b"]);
        assert!(step(&plan, "create vm.b")
            .depends_on
            .iter()
            .any(|d| d.to_string() == "create vm.a"));
        assert_eq!(plan.entries[0].address.resource.name, "a");
        assert_eq!(plan.summary().create, 2);
    }

    #[test]
    fn test_independent_steps_have_no_edges() {
        let mut set = ResourceSet::new();
        set.add(ResourceConfig::new("vm", "c")).unwrap();
        set.add(ResourceConfig::new("vm", "d")).unwrap();
        let plan = plan(&set, &StateFile::new());
        assert!(plan.steps().iter().all(|s| s.depends_on.is_empty()));
    }

    #[test]
    fn test_replace_destroy_first() {
        let mut state = StateFile::new();
        state.upsert(record("r", json!({"id": "1", "location": "west"})));
        let mut set = ResourceSet::new();
        set.add(ResourceConfig::new("vm", "r").with_literal("location", json!("east")))
            .unwrap();

        let plan = plan(&set, &state);
        assert_eq!(step_names(&plan), vec!["delete vm.r", "create vm.r"]);
        assert!(!step(&plan, "create vm.r").depends_on.is_empty());
    }

    #[test]
    fn test_replace_create_before_destroy() {
        let mut state = StateFile::new();
        state.upsert(record("a", json!({"id": "1", "location": "west"})));
        state.upsert(record("b", json!({"id": "2", "size": "1"})));
        let set = a_and_b(
            ResourceConfig::new("vm", "a")
                .with_literal("location", json!("east"))
                .create_before_destroy(),
        );

        let plan = plan(&set, &state);
        assert_eq!(
            step_names(&plan),
            vec!["create vm.a", "update vm.b", "delete vm.a"]
        );
        let delete = step(&plan, "delete vm.a");
        assert!(delete.depends_on.iter().any(|d| d.to_string() == "update vm.b"));
    }

    #[test]
    fn test_orphans_deleted_dependents_first() {
        let mut state = StateFile::new();
        state.upsert(record("base", json!({"id": "1"})));
        let mut top = record("top", json!({"id": "2"}));
        top.dependencies.push(InstanceAddress::single("vm", "base"));
        state.upsert(top);

        let plan = plan(&ResourceSet::new(), &state);
        assert_eq!(step_names(&plan), vec!["delete vm.top", "delete vm.base"]);
    }

    #[test]
    fn test_checksum_tracks_config_and_state() {
        let set = a_and_b(ResourceConfig::new("vm", "a"));
        let graph = ResourceGraph::build(&set, &DataValues::new()).unwrap();
        let mut state = StateFile::new();
        let first = checksum(&graph, &state);
        assert_eq!(first, checksum(&graph, &state));

        state.serial += 1;
        assert_ne!(first, checksum(&graph, &state));

        let other = ResourceGraph::build(
            &a_and_b(ResourceConfig::new("vm", "a").with_literal("size", json!(1))),
            &DataValues::new(),
        )
        .unwrap();
        assert_ne!(checksum(&graph, &state), checksum(&other, &state));
    }

    #[test]
    fn test_artifact_round_trip_and_stale_detection() {
        let set = a_and_b(ResourceConfig::new("vm", "a"));
        let graph = ResourceGraph::build(&set, &DataValues::new()).unwrap();
        let state = StateFile::new();
        let original = plan(&set, &state);

        let artifact = original.to_artifact();
        let json = serde_json::to_value(&artifact).unwrap();
        assert_eq!(json["formatVersion"], json!(1));
        assert_eq!(json["entries"][0]["identity"], json!("vm.a"));
        assert_eq!(json["entries"][0]["after"]["id"], json!({"unknown": true}));

        let restored = Plan::from_artifact(artifact.clone(), &graph, &state).unwrap();
        assert_eq!(restored.entries, original.entries);

        let mut moved = state.clone();
        moved.serial = 5;
        assert!(matches!(
            Plan::from_artifact(artifact, &graph, &moved),
            Err(EngineError::StalePlan)
        ));
    }
}
