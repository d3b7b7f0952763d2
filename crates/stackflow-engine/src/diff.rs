//! Differ
//!
//! Compares each graph node against its state record and classifies it as
//! No-op, Create, Update, Replace or Delete. Records with no node, and deposed
//! records, become deletes.

use crate::error::ConfigError;
use crate::expr::PlannedValue;
use crate::graph::{ResourceGraph, ResourceNode};
use crate::provider::{CollectionSemantics, Provider, UpdateSemantics};
use crate::resource::{Attributes, InstanceAddress};
use crate::state::{StateFile, StateRecord};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Planned attribute values, some of which may only be known after apply
pub type PlannedAttributes = BTreeMap<String, PlannedValue>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Action {
    NoOp,
    Create,
    Update,
    Replace,
    Delete,
}

impl Action {
    pub fn symbol(&self) -> &'static str {
        match self {
            Action::NoOp => " ",
            Action::Create => "+",
            Action::Update => "~",
            Action::Replace => "-/+",
            Action::Delete => "-",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::NoOp => write!(f, "no-op"),
            Action::Create => write!(f, "create"),
            Action::Update => write!(f, "update"),
            Action::Replace => write!(f, "replace"),
            Action::Delete => write!(f, "delete"),
        }
    }
}

/// Ordering of the two halves of a replacement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReplaceOrder {
    #[default]
    DestroyBeforeCreate,
    CreateBeforeDestroy,
}

/// Classified change for one instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffEntry {
    #[serde(rename = "identity")]
    pub address: InstanceAddress,

    pub action: Action,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replace_order: Option<ReplaceOrder>,

    /// Changed attributes that forced the replacement
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub replace_reasons: Vec<String>,

    /// Deposed key when this entry deletes a deposed object
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deposed: Option<String>,

    pub before: Option<Attributes>,

    pub after: Option<PlannedAttributes>,
}

impl DiffEntry {
    fn new(address: InstanceAddress, action: Action) -> Self {
        Self {
            address,
            action,
            replace_order: None,
            replace_reasons: Vec::new(),
            deposed: None,
            before: None,
            after: None,
        }
    }

    pub fn is_change(&self) -> bool {
        self.action != Action::NoOp
    }

    /// Attributes whose planned value differs from the recorded one
    pub fn changed_attributes(&self) -> Vec<&str> {
        let (Some(before), Some(after)) = (&self.before, &self.after) else {
            return Vec::new();
        };
        let keys: BTreeSet<&String> = before.keys().chain(after.keys()).collect();
        keys.into_iter()
            .filter(|k| match after.get(*k) {
                Some(PlannedValue::Known(v)) => before.get(*k).unwrap_or(&Value::Null) != v,
                Some(PlannedValue::Unknown) => true,
                None => false,
            })
            .map(|k| k.as_str())
            .collect()
    }
}

/// Compare a recorded value with a planned one. Unknown values always count
/// as changed.
pub(crate) fn attribute_changed(
    prior: Option<&Value>,
    planned: &PlannedValue,
    semantics: CollectionSemantics,
) -> bool {
    let prior = prior.unwrap_or(&Value::Null);
    match planned {
        PlannedValue::Unknown => true,
        PlannedValue::Known(desired) => !values_equal(prior, desired, semantics),
    }
}

fn values_equal(a: &Value, b: &Value, semantics: CollectionSemantics) -> bool {
    match (a, b, semantics) {
        (Value::Array(x), Value::Array(y), CollectionSemantics::Unordered) => {
            if x.len() != y.len() {
                return false;
            }
            let mut x: Vec<String> = x.iter().map(|v| v.to_string()).collect();
            let mut y: Vec<String> = y.iter().map(|v| v.to_string()).collect();
            x.sort();
            y.sort();
            x == y
        }
        _ => a == b,
    }
}

struct Planned {
    attributes: PlannedAttributes,
    /// Object is (re)created, so unconfigured attributes are unknown
    fresh: bool,
}

/// Diff every node and state record.
#[tracing::instrument(skip_all, fields(nodes = graph.len(), records = state.len()))]
pub fn diff(
    graph: &ResourceGraph,
    state: &StateFile,
    provider: &dyn Provider,
) -> Result<Vec<DiffEntry>, ConfigError> {
    let mut planned: BTreeMap<InstanceAddress, Planned> = BTreeMap::new();
    let mut entries = Vec::new();

    for node in graph.nodes() {
        let desired = evaluate_node(graph, node, &planned)?;
        let (entry, next) = classify(node, desired, state.get(&node.address), provider)?;
        tracing::debug!(address = %node.address, action = %entry.action, "Classified");
        planned.insert(node.address.clone(), next);
        entries.push(entry);
    }

    for record in state.records() {
        let address = record.address();
        if record.deposed.is_none() && graph.contains(&address) {
            continue;
        }
        // Instances dropped by a shrinking count/for_each
        if record.deposed.is_none()
            && graph
                .lifecycle(&address.resource)
                .is_some_and(|l| l.prevent_destroy)
        {
            return Err(ConfigError::PreventDestroy {
                address: address.to_string(),
                action: Action::Delete.to_string(),
            });
        }
        let mut entry = DiffEntry::new(address, Action::Delete);
        entry.deposed = record.deposed.clone();
        entry.before = Some(record.attributes.clone());
        entries.push(entry);
    }

    entries.sort_by(|a, b| (&a.address, &a.deposed).cmp(&(&b.address, &b.deposed)));
    Ok(entries)
}

/// Evaluate a node's configured attributes against planned values of its
/// dependencies.
fn evaluate_node(
    graph: &ResourceGraph,
    node: &ResourceNode,
    planned: &BTreeMap<InstanceAddress, Planned>,
) -> Result<PlannedAttributes, ConfigError> {
    let mut lookup = |address: &InstanceAddress, attribute: &str| match planned.get(address) {
        Some(p) => p.attributes.get(attribute).cloned().unwrap_or(if p.fresh {
            PlannedValue::Unknown
        } else {
            PlannedValue::Known(Value::Null)
        }),
        None => PlannedValue::Unknown,
    };

    let mut desired = PlannedAttributes::new();
    for (name, expr) in &node.attributes {
        let value = expr
            .evaluate(&mut |r| graph.resolve_reference(r, &mut lookup))
            .map_err(|message| ConfigError::InvalidExpression {
                from: format!("{}.{}", node.address, name),
                message,
            })?;
        desired.insert(name.clone(), value);
    }
    Ok(desired)
}

fn classify(
    node: &ResourceNode,
    desired: PlannedAttributes,
    prior: Option<&StateRecord>,
    provider: &dyn Provider,
) -> Result<(DiffEntry, Planned), ConfigError> {
    let resource_type = node.address.resource_type();
    let schema = provider.schema(resource_type);
    let computed: BTreeSet<String> = schema
        .as_ref()
        .map(|s| {
            s.attributes
                .iter()
                .filter(|(_, a)| a.computed)
                .map(|(name, _)| name.clone())
                .collect()
        })
        .unwrap_or_default();

    let fresh_after = |desired: &PlannedAttributes| {
        let mut after = desired.clone();
        for name in computed.iter().map(String::as_str).chain(["id"]) {
            after
                .entry(name.to_string())
                .or_insert(PlannedValue::Unknown);
        }
        after
    };

    let Some(prior) = prior else {
        let mut entry = DiffEntry::new(node.address.clone(), Action::Create);
        let after = fresh_after(&desired);
        entry.after = Some(after.clone());
        return Ok((
            entry,
            Planned {
                attributes: after,
                fresh: true,
            },
        ));
    };

    let ignored = &node.lifecycle.ignore_changes;
    let mut compared: BTreeSet<&String> = desired.keys().collect();
    if let Some(schema) = &schema {
        compared.extend(
            prior
                .attributes
                .keys()
                .filter(|k| schema.attributes.get(*k).is_some_and(|a| !a.computed)),
        );
    }

    let null = PlannedValue::Known(Value::Null);
    let changed: Vec<String> = compared
        .into_iter()
        .filter(|k| !ignored.contains(*k))
        .filter(|k| {
            attribute_changed(
                prior.attributes.get(*k),
                desired.get(*k).unwrap_or(&null),
                provider.collection_semantics(resource_type, k),
            )
        })
        .cloned()
        .collect();

    let mut entry = DiffEntry::new(node.address.clone(), Action::NoOp);
    entry.before = Some(prior.attributes.clone());

    if changed.is_empty() {
        let known: PlannedAttributes = prior
            .attributes
            .iter()
            .map(|(k, v)| (k.clone(), PlannedValue::Known(v.clone())))
            .collect();
        entry.after = Some(known.clone());
        return Ok((
            entry,
            Planned {
                attributes: known,
                fresh: false,
            },
        ));
    }

    let reasons: Vec<String> = changed
        .iter()
        .filter(|k| provider.update_semantics(resource_type, k) == UpdateSemantics::ForcesReplacement)
        .cloned()
        .collect();

    if !reasons.is_empty() {
        if node.lifecycle.prevent_destroy {
            return Err(ConfigError::PreventDestroy {
                address: node.address.to_string(),
                action: Action::Replace.to_string(),
            });
        }
        let after = fresh_after(&desired);
        entry.action = Action::Replace;
        entry.replace_order = Some(if node.lifecycle.create_before_destroy {
            ReplaceOrder::CreateBeforeDestroy
        } else {
            ReplaceOrder::DestroyBeforeCreate
        });
        entry.replace_reasons = reasons;
        entry.after = Some(after.clone());
        return Ok((
            entry,
            Planned {
                attributes: after,
                fresh: true,
            },
        ));
    }

    let mut after: PlannedAttributes = prior
        .attributes
        .iter()
        .map(|(k, v)| (k.clone(), PlannedValue::Known(v.clone())))
        .collect();
    for (name, value) in desired {
        if !ignored.contains(&name) {
            after.insert(name, value);
        }
    }
    for name in computed.iter().filter(|n| n.as_str() != "id") {
        after.insert(name.clone(), PlannedValue::Unknown);
    }
    entry.action = Action::Update;
    entry.after = Some(after.clone());
    Ok((
        entry,
        Planned {
            attributes: after,
            fresh: false,
        },
    ))
}
