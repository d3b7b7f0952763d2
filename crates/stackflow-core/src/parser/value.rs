//! Attribute node values

use crate::error::{Result, StackError};
use crate::expression::{Variables, parse_template};
use kdl::{KdlNode, KdlValue};
use serde_json::Value;
use stackflow_engine::{Expr, PlannedValue, Reference};
use std::collections::BTreeMap;

/// Convert a KDL value to JSON
pub fn kdl_value_to_json(value: &KdlValue) -> Value {
    if let Some(s) = value.as_string() {
        Value::String(s.to_string())
    } else if let Some(i) = value.as_integer() {
        Value::Number((i as i64).into())
    } else if let Some(f) = value.as_float() {
        serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    } else if let Some(b) = value.as_bool() {
        Value::Bool(b)
    } else {
        Value::Null
    }
}

/// A single entry value; strings are templates.
pub fn entry_expr(value: &KdlValue, location: &str, variables: &Variables) -> Result<Expr> {
    match value.as_string() {
        Some(s) => parse_template(s, variables).map_err(|source| StackError::Expression {
            location: location.to_string(),
            source,
        }),
        None => Ok(Expr::Literal(kdl_value_to_json(value))),
    }
}

/// The value of an attribute node.
///
/// - `size 2` is a scalar, `ports 80 443` a list
/// - `tags env="prod" team="ops"` is a map
/// - a child block is a map, or a list when every child is named `-`
pub fn node_expr(node: &KdlNode, location: &str, variables: &Variables) -> Result<Expr> {
    if let Some(children) = node.children() {
        if !node.entries().is_empty() {
            return Err(StackError::InvalidConfig(format!(
                "{}: use either arguments or a child block, not both",
                location
            )));
        }
        let nodes = children.nodes();
        if !nodes.is_empty() && nodes.iter().all(|n| n.name().value() == "-") {
            return nodes
                .iter()
                .enumerate()
                .map(|(i, n)| node_expr(n, &format!("{}[{}]", location, i), variables))
                .collect::<Result<Vec<_>>>()
                .map(Expr::List);
        }
        let mut map = BTreeMap::new();
        for child in nodes {
            let key = child.name().value().to_string();
            let value = node_expr(child, &format!("{}.{}", location, key), variables)?;
            if map.insert(key.clone(), value).is_some() {
                return Err(StackError::InvalidConfig(format!(
                    "{}: duplicate key '{}'",
                    location, key
                )));
            }
        }
        return Ok(Expr::Map(map));
    }

    let entries = node.entries();
    let named = entries.iter().filter(|e| e.name().is_some()).count();
    if named > 0 {
        if named != entries.len() {
            return Err(StackError::InvalidConfig(format!(
                "{}: mixes positional arguments and properties",
                location
            )));
        }
        let mut map = BTreeMap::new();
        for entry in entries {
            if let Some(key) = entry.name() {
                let key = key.value().to_string();
                let value = entry_expr(entry.value(), &format!("{}.{}", location, key), variables)?;
                map.insert(key, value);
            }
        }
        return Ok(Expr::Map(map));
    }

    match entries {
        [] => Err(StackError::InvalidConfig(format!("{} has no value", location))),
        [single] => entry_expr(single.value(), location, variables),
        many => many
            .iter()
            .map(|e| entry_expr(e.value(), location, variables))
            .collect::<Result<Vec<_>>>()
            .map(Expr::List),
    }
}

/// The value of `expr` when it contains no references or iteration bindings.
pub fn constant(expr: &Expr) -> Option<Value> {
    match expr {
        Expr::Literal(v) => Some(v.clone()),
        Expr::List(items) => items.iter().map(constant).collect::<Option<Vec<_>>>().map(Value::Array),
        Expr::Map(entries) => entries
            .iter()
            .map(|(k, v)| constant(v).map(|v| (k.clone(), v)))
            .collect::<Option<serde_json::Map<_, _>>>()
            .map(Value::Object),
        Expr::Call { .. } => {
            if !expr.references().is_empty() || !expr.iterations().is_empty() {
                return None;
            }
            expr.evaluate(&mut |_: &Reference| PlannedValue::Unknown)
                .ok()
                .and_then(|v| v.as_known().cloned())
        }
        Expr::Reference(_) | Expr::Iteration(_) => None,
    }
}

/// First argument as a string
pub fn first_string(node: &KdlNode) -> Option<&str> {
    node.entries().first().and_then(|e| e.value().as_string())
}

/// The two string labels of `resource "<type>" "<name>"`
pub fn labels<'n>(node: &'n KdlNode, kind: &str) -> Result<(&'n str, &'n str)> {
    let mut strings = node.entries().iter().filter_map(|e| e.value().as_string());
    match (strings.next(), strings.next(), strings.next()) {
        (Some(resource_type), Some(name), None) => {
            for label in [resource_type, name] {
                if label.is_empty() || !label.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '-') {
                    return Err(StackError::InvalidConfig(format!(
                        "{} label '{}' may only contain letters, digits, '_' and '-'",
                        kind, label
                    )));
                }
            }
            Ok((resource_type, name))
        }
        _ => Err(StackError::InvalidConfig(format!(
            "{} requires a type and a name, e.g. {} \"local_file\" \"config\"",
            kind, kind
        ))),
    }
}
