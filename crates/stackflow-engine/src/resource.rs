//! Resource identities and declarations
//!
//! A [`ResourceSet`] is the typed configuration object the engine consumes.
//! The concrete configuration language lives outside this crate and only
//! has to produce these types.

use crate::error::ConfigError;
use crate::expr::Expr;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

/// Concrete attribute values, as recorded in state and returned by providers.
pub type Attributes = BTreeMap<String, serde_json::Value>;

/// Attributes of data lookups, resolved before the graph is built.
pub type DataValues = BTreeMap<ResourceId, Attributes>;

/// Identity of a declared resource: `(type, local name)`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceId {
    pub resource_type: String,
    pub name: String,
}

impl ResourceId {
    pub fn new(resource_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.resource_type, self.name)
    }
}

impl FromStr for ResourceId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('.') {
            Some((resource_type, name))
                if !resource_type.is_empty() && !name.is_empty() && !name.contains('.') =>
            {
                Ok(Self::new(resource_type, name))
            }
            _ => Err(format!("expected <type>.<name>, got '{}'", s)),
        }
    }
}

/// Key of one expanded instance of a `count`/`for_each` resource
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InstanceKey {
    Index(usize),
    Key(String),
}

impl InstanceKey {
    pub fn to_value(&self) -> serde_json::Value {
        match self {
            InstanceKey::Index(i) => serde_json::Value::from(*i),
            InstanceKey::Key(k) => serde_json::Value::from(k.clone()),
        }
    }
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceKey::Index(i) => write!(f, "[{}]", i),
            InstanceKey::Key(k) => write!(f, "[\"{}\"]", k),
        }
    }
}

/// Address of a single resource instance, e.g. `local_file.page[2]`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct InstanceAddress {
    pub resource: ResourceId,
    pub key: Option<InstanceKey>,
}

impl InstanceAddress {
    pub fn new(resource: ResourceId, key: Option<InstanceKey>) -> Self {
        Self { resource, key }
    }

    pub fn single(resource_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(ResourceId::new(resource_type, name), None)
    }

    pub fn indexed(resource_type: impl Into<String>, name: impl Into<String>, index: usize) -> Self {
        Self::new(
            ResourceId::new(resource_type, name),
            Some(InstanceKey::Index(index)),
        )
    }

    pub fn keyed(
        resource_type: impl Into<String>,
        name: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        Self::new(
            ResourceId::new(resource_type, name),
            Some(InstanceKey::Key(key.into())),
        )
    }

    pub fn resource_type(&self) -> &str {
        &self.resource.resource_type
    }
}

impl fmt::Display for InstanceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.resource)?;
        if let Some(key) = &self.key {
            write!(f, "{}", key)?;
        }
        Ok(())
    }
}

impl FromStr for InstanceAddress {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some(open) = s.find('[') else {
            return Ok(Self::new(s.parse()?, None));
        };
        let resource: ResourceId = s[..open].parse()?;
        let inner = s[open..]
            .strip_prefix('[')
            .and_then(|rest| rest.strip_suffix(']'))
            .ok_or_else(|| format!("malformed instance key in '{}'", s))?;
        let key = if let Some(quoted) = inner
            .strip_prefix('"')
            .and_then(|rest| rest.strip_suffix('"'))
        {
            InstanceKey::Key(quoted.to_string())
        } else {
            InstanceKey::Index(
                inner
                    .parse()
                    .map_err(|_| format!("malformed instance index in '{}'", s))?,
            )
        };
        Ok(Self::new(resource, Some(key)))
    }
}

impl TryFrom<String> for InstanceAddress {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<InstanceAddress> for String {
    fn from(value: InstanceAddress) -> Self {
        value.to_string()
    }
}

/// Repetition construct of a declaration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Repetition {
    Count(usize),
    ForEach(BTreeMap<String, serde_json::Value>),
}

/// Values bound to `count.index` / `each.key` / `each.value` for one instance
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IterationContext {
    pub index: Option<usize>,
    pub each_key: Option<String>,
    pub each_value: Option<serde_json::Value>,
}

impl Repetition {
    /// Expand into instance keys, in key order.
    pub fn expand(&self) -> Vec<(InstanceKey, IterationContext)> {
        match self {
            Repetition::Count(n) => (0..*n)
                .map(|i| {
                    (
                        InstanceKey::Index(i),
                        IterationContext {
                            index: Some(i),
                            ..Default::default()
                        },
                    )
                })
                .collect(),
            Repetition::ForEach(items) => items
                .iter()
                .map(|(k, v)| {
                    (
                        InstanceKey::Key(k.clone()),
                        IterationContext {
                            each_key: Some(k.clone()),
                            each_value: Some(v.clone()),
                            ..Default::default()
                        },
                    )
                })
                .collect(),
        }
    }
}

/// Lifecycle meta-arguments
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lifecycle {
    /// Replace by creating the new instance before destroying the old one
    #[serde(default)]
    pub create_before_destroy: bool,

    /// Refuse any plan that deletes or replaces this resource
    #[serde(default)]
    pub prevent_destroy: bool,

    /// Attributes excluded from diffing
    #[serde(default)]
    pub ignore_changes: BTreeSet<String>,
}

/// A declared resource, before expansion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceConfig {
    pub id: ResourceId,

    /// Attribute expressions
    pub attributes: BTreeMap<String, Expr>,

    /// Explicit dependencies
    #[serde(default)]
    pub depends_on: BTreeSet<ResourceId>,

    #[serde(default)]
    pub repetition: Option<Repetition>,

    #[serde(default)]
    pub lifecycle: Lifecycle,
}

impl ResourceConfig {
    pub fn new(resource_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: ResourceId::new(resource_type, name),
            attributes: BTreeMap::new(),
            depends_on: BTreeSet::new(),
            repetition: None,
            lifecycle: Lifecycle::default(),
        }
    }

    pub fn with_attribute(mut self, name: impl Into<String>, expr: Expr) -> Self {
        self.attributes.insert(name.into(), expr);
        self
    }

    pub fn with_literal(self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.with_attribute(name, Expr::Literal(value))
    }

    pub fn depends_on(mut self, id: ResourceId) -> Self {
        self.depends_on.insert(id);
        self
    }

    pub fn with_count(mut self, count: usize) -> Self {
        self.repetition = Some(Repetition::Count(count));
        self
    }

    pub fn with_for_each(mut self, items: BTreeMap<String, serde_json::Value>) -> Self {
        self.repetition = Some(Repetition::ForEach(items));
        self
    }

    pub fn with_lifecycle(mut self, lifecycle: Lifecycle) -> Self {
        self.lifecycle = lifecycle;
        self
    }

    pub fn create_before_destroy(mut self) -> Self {
        self.lifecycle.create_before_destroy = true;
        self
    }

    /// Number of instances this declaration expands into
    pub fn expansion_count(&self) -> usize {
        match &self.repetition {
            None => 1,
            Some(Repetition::Count(n)) => *n,
            Some(Repetition::ForEach(items)) => items.len(),
        }
    }
}

/// A data lookup declaration; its query is literal only
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataConfig {
    pub id: ResourceId,
    pub query: Attributes,
}

impl DataConfig {
    pub fn new(data_type: impl Into<String>, name: impl Into<String>, query: Attributes) -> Self {
        Self {
            id: ResourceId::new(data_type, name),
            query,
        }
    }
}

/// The complete desired configuration
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceSet {
    /// Resources indexed by identity
    pub resources: BTreeMap<ResourceId, ResourceConfig>,

    /// Data lookups indexed by identity
    pub data: BTreeMap<ResourceId, DataConfig>,

    /// Named output expressions
    pub outputs: BTreeMap<String, Expr>,
}

impl ResourceSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, resource: ResourceConfig) -> Result<(), ConfigError> {
        if self.resources.contains_key(&resource.id) {
            return Err(ConfigError::DuplicateResource(resource.id.to_string()));
        }
        self.resources.insert(resource.id.clone(), resource);
        Ok(())
    }

    pub fn add_data(&mut self, data: DataConfig) -> Result<(), ConfigError> {
        if self.data.contains_key(&data.id) {
            return Err(ConfigError::DuplicateResource(format!("data.{}", data.id)));
        }
        self.data.insert(data.id.clone(), data);
        Ok(())
    }

    pub fn add_output(&mut self, name: impl Into<String>, value: Expr) {
        self.outputs.insert(name.into(), value);
    }

    pub fn get(&self, id: &ResourceId) -> Option<&ResourceConfig> {
        self.resources.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ResourceConfig> {
        self.resources.values()
    }

    pub fn by_type(&self, resource_type: &str) -> Vec<&ResourceConfig> {
        self.resources
            .values()
            .filter(|r| r.id.resource_type == resource_type)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}
