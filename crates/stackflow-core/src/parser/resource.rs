//! resource / data / output nodes

use super::value::{constant, entry_expr, first_string, labels, node_expr};
use crate::error::{Result, StackError};
use crate::expression::Variables;
use kdl::KdlNode;
use serde_json::Value;
use stackflow_engine::{Attributes, DataConfig, Expr, Lifecycle, Repetition, ResourceConfig, ResourceId};
use std::collections::BTreeMap;

/// Parse a `resource "<type>" "<name>" { ... }` block.
pub fn parse_resource(node: &KdlNode, variables: &Variables) -> Result<ResourceConfig> {
    let (resource_type, name) = labels(node, "resource")?;
    let mut resource = ResourceConfig::new(resource_type, name);
    let location = format!("resource.{}", resource.id);

    let Some(children) = node.children() else {
        return Ok(resource);
    };

    for child in children.nodes() {
        let key = child.name().value();
        let child_location = format!("{}.{}", location, key);
        match key {
            "count" => {
                let value = node_expr(child, &child_location, variables)?;
                let count = constant(&value)
                    .and_then(|v| v.as_u64())
                    .ok_or_else(|| {
                        StackError::InvalidConfig(format!(
                            "{} must be a non-negative integer known before planning",
                            child_location
                        ))
                    })?;
                set_repetition(&mut resource, Repetition::Count(count as usize), &location)?;
            }
            "for_each" => {
                let items = parse_for_each(child, &child_location, variables)?;
                set_repetition(&mut resource, Repetition::ForEach(items), &location)?;
            }
            "depends_on" => {
                for entry in child.entries() {
                    let target = entry.value().as_string().ok_or_else(|| {
                        StackError::InvalidConfig(format!(
                            "{} expects quoted \"<type>.<name>\" strings",
                            child_location
                        ))
                    })?;
                    let id: ResourceId = target.parse().map_err(|e: String| {
                        StackError::InvalidConfig(format!("{}: {}", child_location, e))
                    })?;
                    resource.depends_on.insert(id);
                }
            }
            "lifecycle" => {
                resource.lifecycle = parse_lifecycle(child, &child_location)?;
            }
            _ => {
                if resource.attributes.contains_key(key) {
                    return Err(StackError::InvalidConfig(format!(
                        "{} is set more than once",
                        child_location
                    )));
                }
                let value = node_expr(child, &child_location, variables)?;
                resource.attributes.insert(key.to_string(), value);
            }
        }
    }

    Ok(resource)
}

fn set_repetition(resource: &mut ResourceConfig, repetition: Repetition, location: &str) -> Result<()> {
    if resource.repetition.is_some() {
        return Err(StackError::InvalidConfig(format!(
            "{} cannot use both count and for_each",
            location
        )));
    }
    resource.repetition = Some(repetition);
    Ok(())
}

/// `for_each "a" "b"` binds each.key and each.value to the same string;
/// `for_each { a "x"; b "y" }` binds each.value to the map value.
fn parse_for_each(
    node: &KdlNode,
    location: &str,
    variables: &Variables,
) -> Result<BTreeMap<String, Value>> {
    let value = constant(&node_expr(node, location, variables)?).ok_or_else(|| {
        StackError::InvalidConfig(format!("{} must be known before planning", location))
    })?;

    let mut items = BTreeMap::new();
    match value {
        Value::Object(map) => items.extend(map),
        Value::Array(list) => {
            for item in list {
                let Value::String(key) = item else {
                    return Err(StackError::InvalidConfig(format!(
                        "{} lists must contain strings",
                        location
                    )));
                };
                items.insert(key.clone(), Value::String(key));
            }
        }
        Value::String(key) => {
            items.insert(key.clone(), Value::String(key));
        }
        _ => {
            return Err(StackError::InvalidConfig(format!(
                "{} expects a list of strings or a map",
                location
            )));
        }
    }
    Ok(items)
}

fn parse_lifecycle(node: &KdlNode, location: &str) -> Result<Lifecycle> {
    let mut lifecycle = Lifecycle::default();
    let Some(children) = node.children() else {
        return Ok(lifecycle);
    };

    for child in children.nodes() {
        let flag = || {
            // A bare flag node means true
            match child.entries().first() {
                None => Ok(true),
                Some(e) => e.value().as_bool().ok_or_else(|| {
                    StackError::InvalidConfig(format!(
                        "{}.{} expects #true or #false",
                        location,
                        child.name().value()
                    ))
                }),
            }
        };
        match child.name().value() {
            "create_before_destroy" => lifecycle.create_before_destroy = flag()?,
            "prevent_destroy" => lifecycle.prevent_destroy = flag()?,
            "ignore_changes" => {
                lifecycle.ignore_changes.extend(
                    child
                        .entries()
                        .iter()
                        .filter_map(|e| e.value().as_string().map(str::to_string)),
                );
            }
            other => {
                return Err(StackError::InvalidConfig(format!(
                    "{}: unknown lifecycle setting '{}'",
                    location, other
                )));
            }
        }
    }
    Ok(lifecycle)
}

/// Parse a `data "<type>" "<name>" { ... }` block. Query arguments must be
/// constant.
pub fn parse_data(node: &KdlNode, variables: &Variables) -> Result<DataConfig> {
    let (data_type, name) = labels(node, "data")?;
    let location = format!("data.{}.{}", data_type, name);
    let mut query = Attributes::new();

    if let Some(children) = node.children() {
        for child in children.nodes() {
            let key = child.name().value();
            let child_location = format!("{}.{}", location, key);
            let value = constant(&node_expr(child, &child_location, variables)?).ok_or_else(|| {
                StackError::InvalidConfig(format!(
                    "{} cannot refer to resources; data is read before planning",
                    child_location
                ))
            })?;
            query.insert(key.to_string(), value);
        }
    }

    Ok(DataConfig::new(data_type, name, query))
}

/// Parse `output "<name>" { value "..." }` or `output "<name>" "..."`.
pub fn parse_output(node: &KdlNode, variables: &Variables) -> Result<(String, Expr)> {
    let name = first_string(node)
        .ok_or_else(|| StackError::InvalidConfig("output requires a name".to_string()))?
        .to_string();
    let location = format!("output.{}", name);

    if let Some(inline) = node.entries().get(1) {
        return Ok((name, entry_expr(inline.value(), &location, variables)?));
    }

    let value_node = node
        .children()
        .and_then(|c| c.nodes().iter().find(|n| n.name().value() == "value"))
        .ok_or_else(|| StackError::InvalidConfig(format!("{} requires a value", location)))?;
    let value = node_expr(value_node, &location, variables)?;
    Ok((name, value))
}
