//! Resource graph builder
//!
//! Expands `count`/`for_each` declarations into instances, binds iteration
//! and data values, turns references into edges and orders the instances
//! with Kahn's algorithm.

use crate::error::ConfigError;
use crate::expr::{Expr, IterationRef, PlannedValue, Reference};
use crate::resource::{
    DataValues, InstanceAddress, InstanceKey, IterationContext, Lifecycle, Repetition,
    ResourceConfig, ResourceId, ResourceSet,
};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;

/// One expanded resource instance
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceNode {
    pub address: InstanceAddress,

    /// Attribute expressions with iteration and data values bound
    pub attributes: BTreeMap<String, Expr>,

    /// Explicit `depends_on` declarations
    pub depends_on: BTreeSet<ResourceId>,

    /// Explicit and implicit dependencies, at instance level
    pub dependencies: BTreeSet<InstanceAddress>,

    pub lifecycle: Lifecycle,
}

/// Instances a reference points at
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReferenceTarget {
    Single(InstanceAddress),
    /// Unindexed reference to a repeated resource, in key order
    All(Vec<InstanceAddress>),
}

/// Acyclic graph of resource instances
#[derive(Debug, Clone, Default)]
pub struct ResourceGraph {
    nodes: BTreeMap<InstanceAddress, ResourceNode>,
    dependents: BTreeMap<InstanceAddress, BTreeSet<InstanceAddress>>,
    order: Vec<InstanceAddress>,
    instances: BTreeMap<ResourceId, Vec<InstanceAddress>>,
    repeated: BTreeSet<ResourceId>,
    /// Per declared resource, including ones that expand to no instances
    lifecycles: BTreeMap<ResourceId, Lifecycle>,
    outputs: BTreeMap<String, Expr>,
}

impl ResourceGraph {
    /// Build the graph. Fails without producing a partial graph.
    #[tracing::instrument(skip_all, fields(resources = set.len()))]
    pub fn build(set: &ResourceSet, data: &DataValues) -> Result<Self, ConfigError> {
        let mut graph = ResourceGraph::default();

        for config in set.iter() {
            let addresses = match &config.repetition {
                None => vec![InstanceAddress::new(config.id.clone(), None)],
                Some(repetition) => {
                    graph.repeated.insert(config.id.clone());
                    repetition
                        .expand()
                        .into_iter()
                        .map(|(key, _)| InstanceAddress::new(config.id.clone(), Some(key)))
                        .collect()
                }
            };
            graph.instances.insert(config.id.clone(), addresses);
            graph
                .lifecycles
                .insert(config.id.clone(), config.lifecycle.clone());
        }

        for config in set.iter() {
            check_declaration(set, config)?;
            let contexts: Vec<(Option<InstanceKey>, IterationContext)> =
                match &config.repetition {
                    None => vec![(None, IterationContext::default())],
                    Some(repetition) => repetition
                        .expand()
                        .into_iter()
                        .map(|(key, ctx)| (Some(key), ctx))
                        .collect(),
                };

            for (key, ctx) in contexts {
                let address = InstanceAddress::new(config.id.clone(), key);
                let node = graph.instantiate(config, address, &ctx, data)?;
                graph.nodes.insert(node.address.clone(), node);
            }
        }

        for (name, expr) in &set.outputs {
            let from = format!("output.{}", name);
            let bound = expr
                .bind_data(data)
                .map_err(|r| ConfigError::UnresolvedReference {
                    from: from.clone(),
                    reference: r.to_string(),
                })?;
            if let Some(it) = bound.iterations().first() {
                return Err(ConfigError::IterationOutsideRepetition {
                    from,
                    expression: it.to_string(),
                });
            }
            for reference in bound.references() {
                graph.reference_target(reference, &from)?;
            }
            graph.outputs.insert(name.clone(), bound);
        }

        for node in graph.nodes.values() {
            for dep in &node.dependencies {
                graph
                    .dependents
                    .entry(dep.clone())
                    .or_default()
                    .insert(node.address.clone());
            }
        }

        graph.order = graph.topological_order()?;
        tracing::debug!(instances = graph.order.len(), "Built resource graph");
        Ok(graph)
    }

    fn instantiate(
        &self,
        config: &ResourceConfig,
        address: InstanceAddress,
        ctx: &IterationContext,
        data: &DataValues,
    ) -> Result<ResourceNode, ConfigError> {
        let from = address.to_string();
        let mut attributes = BTreeMap::new();
        let mut dependencies = BTreeSet::new();

        for (name, expr) in &config.attributes {
            let bound = expr
                .bind_iteration(ctx)
                .map_err(|it| ConfigError::IterationOutsideRepetition {
                    from: from.clone(),
                    expression: it.to_string(),
                })?
                .bind_data(data)
                .map_err(|r| ConfigError::UnresolvedReference {
                    from: from.clone(),
                    reference: r.to_string(),
                })?;

            for reference in bound.references() {
                match self.reference_target(reference, &from)? {
                    ReferenceTarget::Single(target) => {
                        dependencies.insert(target);
                    }
                    ReferenceTarget::All(targets) => dependencies.extend(targets),
                }
            }
            attributes.insert(name.clone(), bound);
        }

        for dep in &config.depends_on {
            if let Some(targets) = self.instances.get(dep) {
                dependencies.extend(targets.iter().cloned());
            }
        }

        Ok(ResourceNode {
            address,
            attributes,
            depends_on: config.depends_on.clone(),
            dependencies,
            lifecycle: config.lifecycle.clone(),
        })
    }

    /// Resolve which instances a (non-data) reference points at.
    fn reference_target(
        &self,
        reference: &Reference,
        from: &str,
    ) -> Result<ReferenceTarget, ConfigError> {
        let Some(instances) = self.instances.get(&reference.resource) else {
            return Err(ConfigError::UnresolvedReference {
                from: from.to_string(),
                reference: reference.to_string(),
            });
        };
        match &reference.key {
            Some(key) => {
                let target = InstanceAddress::new(reference.resource.clone(), Some(key.clone()));
                if instances.contains(&target) {
                    Ok(ReferenceTarget::Single(target))
                } else {
                    Err(ConfigError::InvalidIndex {
                        from: from.to_string(),
                        reference: reference.to_string(),
                    })
                }
            }
            None if self.repeated.contains(&reference.resource) => {
                Ok(ReferenceTarget::All(instances.clone()))
            }
            None => Ok(ReferenceTarget::Single(InstanceAddress::new(
                reference.resource.clone(),
                None,
            ))),
        }
    }

    fn topological_order(&self) -> Result<Vec<InstanceAddress>, ConfigError> {
        let mut in_degree: BTreeMap<&InstanceAddress, usize> = self
            .nodes
            .values()
            .map(|n| (&n.address, n.dependencies.len()))
            .collect();
        let mut ready: BTreeSet<&InstanceAddress> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(a, _)| *a)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(next) = ready.pop_first() {
            order.push(next.clone());
            for dependent in self.dependents(next) {
                if let Some(degree) = in_degree.get_mut(dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.insert(dependent);
                    }
                }
            }
        }

        if order.len() < self.nodes.len() {
            let done: BTreeSet<&InstanceAddress> = order.iter().collect();
            return Err(ConfigError::Cycle(self.find_cycle(&done)));
        }
        Ok(order)
    }

    /// Every node left over by Kahn's algorithm has a dependency that is also
    /// left over, so following those edges must revisit a node.
    fn find_cycle(&self, done: &BTreeSet<&InstanceAddress>) -> Vec<String> {
        let remaining = |a: &&InstanceAddress| !done.contains(a);
        let Some(mut current) = self.nodes.keys().find(remaining) else {
            return Vec::new();
        };
        let mut path: Vec<&InstanceAddress> = Vec::new();
        loop {
            if let Some(start) = path.iter().position(|a| *a == current) {
                let mut cycle: Vec<String> = path[start..].iter().map(|a| a.to_string()).collect();
                cycle.push(current.to_string());
                return cycle;
            }
            path.push(current);
            match self.nodes[current].dependencies.iter().find(remaining) {
                Some(next) => current = next,
                None => return path.iter().map(|a| a.to_string()).collect(),
            }
        }
    }

    pub fn node(&self, address: &InstanceAddress) -> Option<&ResourceNode> {
        self.nodes.get(address)
    }

    pub fn contains(&self, address: &InstanceAddress) -> bool {
        self.nodes.contains_key(address)
    }

    /// Instances in topological order, ties broken by address
    pub fn order(&self) -> &[InstanceAddress] {
        &self.order
    }

    pub fn nodes(&self) -> impl Iterator<Item = &ResourceNode> {
        self.order.iter().filter_map(|a| self.nodes.get(a))
    }

    pub fn dependencies(&self, address: &InstanceAddress) -> impl Iterator<Item = &InstanceAddress> {
        self.nodes
            .get(address)
            .into_iter()
            .flat_map(|n| n.dependencies.iter())
    }

    pub fn dependents(&self, address: &InstanceAddress) -> impl Iterator<Item = &InstanceAddress> {
        self.dependents
            .get(address)
            .into_iter()
            .flat_map(|d| d.iter())
    }

    /// Lifecycle of a declared resource, `None` once it leaves the configuration
    pub fn lifecycle(&self, id: &ResourceId) -> Option<&Lifecycle> {
        self.lifecycles.get(id)
    }

    pub fn instances_of(&self, id: &ResourceId) -> &[InstanceAddress] {
        self.instances.get(id).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// Whether `address` depends on `ancestor`, directly or transitively
    pub fn depends_transitively(&self, address: &InstanceAddress, ancestor: &InstanceAddress) -> bool {
        let mut stack: Vec<&InstanceAddress> = self.dependencies(address).collect();
        let mut seen = BTreeSet::new();
        while let Some(current) = stack.pop() {
            if current == ancestor {
                return true;
            }
            if seen.insert(current) {
                stack.extend(self.dependencies(current));
            }
        }
        false
    }

    pub fn outputs(&self) -> &BTreeMap<String, Expr> {
        &self.outputs
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Value of `reference`, reading single instance attributes through `get`.
    /// An unindexed reference to a repeated resource yields a list.
    pub fn resolve_reference(
        &self,
        reference: &Reference,
        get: &mut dyn FnMut(&InstanceAddress, &str) -> PlannedValue,
    ) -> PlannedValue {
        match self.reference_target(reference, "") {
            Ok(ReferenceTarget::Single(target)) => get(&target, &reference.attribute),
            Ok(ReferenceTarget::All(targets)) => {
                let mut values = Vec::with_capacity(targets.len());
                for target in &targets {
                    match get(target, &reference.attribute) {
                        PlannedValue::Known(v) => values.push(v),
                        PlannedValue::Unknown => return PlannedValue::Unknown,
                    }
                }
                PlannedValue::Known(serde_json::Value::Array(values))
            }
            Err(_) => PlannedValue::Known(serde_json::Value::Null),
        }
    }

    /// Graphviz DOT rendering; edges point from dependent to dependency.
    pub fn to_dot(&self) -> String {
        let mut out = String::from("digraph stackflow {\n  rankdir = \"RL\";\n");
        for node in self.nodes() {
            let _ = writeln!(out, "  {:?};", node.address.to_string());
        }
        for node in self.nodes() {
            for dep in &node.dependencies {
                let _ = writeln!(
                    out,
                    "  {:?} -> {:?};",
                    node.address.to_string(),
                    dep.to_string()
                );
            }
        }
        out.push_str("}\n");
        out
    }
}

/// Declaration-level checks that do not need expansion.
fn check_declaration(set: &ResourceSet, config: &ResourceConfig) -> Result<(), ConfigError> {
    let from = config.id.to_string();
    for dep in &config.depends_on {
        if set.get(dep).is_none() {
            return Err(ConfigError::UnresolvedReference {
                from: from.clone(),
                reference: dep.to_string(),
            });
        }
    }

    for expr in config.attributes.values() {
        for it in expr.iterations() {
            let allowed = matches!(
                (it, &config.repetition),
                (IterationRef::CountIndex, Some(Repetition::Count(_)))
                    | (
                        IterationRef::EachKey | IterationRef::EachValue,
                        Some(Repetition::ForEach(_))
                    )
            );
            if !allowed {
                return Err(ConfigError::IterationOutsideRepetition {
                    from,
                    expression: it.to_string(),
                });
            }
        }
        for reference in expr.references() {
            if reference.data && !set.data.contains_key(&reference.resource) {
                return Err(ConfigError::UnresolvedReference {
                    from,
                    reference: reference.to_string(),
                });
            }
        }
    }
    Ok(())
}
