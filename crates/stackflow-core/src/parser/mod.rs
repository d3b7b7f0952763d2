//! KDL stack parser
//!
//! Top-level nodes: `project`, `variables`, `resource`, `data` and `output`.
//! Variables are read first so every expression can use them.

mod resource;
mod value;

pub use resource::{parse_data, parse_output, parse_resource};
pub use value::{constant, kdl_value_to_json, node_expr};

use crate::error::Result;
use crate::expression::Variables;
use crate::model::Stack;
use kdl::{KdlDocument, KdlNode};
use stackflow_engine::ResourceSet;
use std::fs;
use std::path::Path;

/// Parse a stack file. The project name defaults to the directory name.
pub fn parse_stack_file<P: AsRef<Path>>(path: P, overrides: &Variables) -> Result<Stack> {
    let content = fs::read_to_string(path.as_ref())?;
    let name = path
        .as_ref()
        .canonicalize()
        .ok()
        .and_then(|p| {
            p.ancestors()
                .skip(1)
                .find(|dir| dir.file_name().is_some_and(|n| n != ".stackflow"))
                .and_then(|dir| dir.file_name())
                .and_then(|n| n.to_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| "unnamed".to_string());
    tracing::debug!(path = %path.as_ref().display(), "Parsing stack file");
    parse_stack_string_with_variables(&content, name, overrides)
}

/// Parse stack source
pub fn parse_stack_string(content: &str, default_name: String) -> Result<Stack> {
    parse_stack_string_with_variables(content, default_name, &Variables::new())
}

/// Parse stack source; `overrides` replace declared variables.
pub fn parse_stack_string_with_variables(
    content: &str,
    default_name: String,
    overrides: &Variables,
) -> Result<Stack> {
    let doc: KdlDocument = content.parse()?;

    let mut name = default_name;
    let mut variables = Variables::new();
    for node in doc.nodes() {
        match node.name().value() {
            "project" => {
                if let Some(project_name) = value::first_string(node) {
                    name = project_name.to_string();
                }
            }
            "variables" => collect_variables(node, &mut variables),
            _ => {}
        }
    }
    for (key, value) in overrides {
        variables.insert(key.clone(), value.clone());
    }

    let mut resources = ResourceSet::new();
    for node in doc.nodes() {
        match node.name().value() {
            "resource" => resources.add(parse_resource(node, &variables)?)?,
            "data" => resources.add_data(parse_data(node, &variables)?)?,
            "output" => {
                let (output_name, expr) = parse_output(node, &variables)?;
                resources.add_output(output_name, expr);
            }
            "project" | "variables" => {}
            other => {
                tracing::warn!(node = other, "Ignoring unknown top-level node");
            }
        }
    }

    tracing::debug!(
        project = %name,
        resources = resources.len(),
        data = resources.data.len(),
        outputs = resources.outputs.len(),
        "Parsed stack"
    );
    Ok(Stack {
        name,
        variables,
        resources,
    })
}

fn collect_variables(node: &KdlNode, variables: &mut Variables) {
    if let Some(vars) = node.children() {
        for var in vars.nodes() {
            let key = var.name().value().to_string();
            let value = var
                .entries()
                .first()
                .map(|e| kdl_value_to_json(e.value()))
                .unwrap_or(serde_json::Value::Null);
            variables.insert(key, value);
        }
    }
}

#[cfg(test)]
mod tests;
