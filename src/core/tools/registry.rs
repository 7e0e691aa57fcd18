use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

use super::{ToolDefinition, ToolHandler};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Tool already registered: {0}")]
pub struct DuplicateToolError(pub String);

#[derive(Clone)]
pub struct RegisteredTool {
    pub definition: ToolDefinition,
    pub handler: Arc<dyn ToolHandler>,
    /// Refused under [`super::ApprovalPolicy::SafeOnly`].
    pub dangerous: bool,
}

impl std::fmt::Debug for RegisteredTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredTool")
            .field("name", &self.definition.name)
            .field("dangerous", &self.dangerous)
            .finish()
    }
}

/// Named tools available to a session, in registration order.
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, RegisteredTool>,
    order: Vec<String>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        definition: ToolDefinition,
        handler: Arc<dyn ToolHandler>,
    ) -> Result<(), DuplicateToolError> {
        self.insert(definition, handler, false)
    }

    /// Register a tool that the safe-only approval policy refuses.
    pub fn register_dangerous(
        &mut self,
        definition: ToolDefinition,
        handler: Arc<dyn ToolHandler>,
    ) -> Result<(), DuplicateToolError> {
        self.insert(definition, handler, true)
    }

    fn insert(
        &mut self,
        definition: ToolDefinition,
        handler: Arc<dyn ToolHandler>,
        dangerous: bool,
    ) -> Result<(), DuplicateToolError> {
        if self.tools.contains_key(&definition.name) {
            return Err(DuplicateToolError(definition.name));
        }
        let name = definition.name.clone();
        self.tools.insert(
            name.clone(),
            RegisteredTool {
                definition,
                handler,
                dangerous,
            },
        );
        self.order.push(name);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&RegisteredTool> {
        self.tools.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Definitions in registration order, as advertised to the provider.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.order
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|tool| tool.definition.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
