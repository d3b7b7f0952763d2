//! Parsed stack

use crate::expression::Variables;
use stackflow_engine::ResourceSet;

/// One stack file: project name, variables and the declared resources
#[derive(Debug, Clone, Default)]
pub struct Stack {
    pub name: String,

    /// Variables after overrides were applied
    pub variables: Variables,

    pub resources: ResourceSet,
}

impl Stack {
    pub fn resource_count(&self) -> usize {
        self.resources.len()
    }
}
