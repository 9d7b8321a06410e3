use std::collections::HashMap;
use std::sync::Arc;
use serde_json::{json, Value};
use taskgate_core::{Error, Result};
use tracing::{debug, warn};

use crate::browser_task::tool::{
    AuthCredentialsTool, BrowserUseAuthTaskTool, BrowserUseTaskTool, BrowserUseVisionTaskTool,
};
use crate::{Tool, ToolContext};

#[derive(Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    pub fn with_defaults() -> Self {
        let mut registry = Self::new();

        // Browser tasks
        registry.register(Arc::new(BrowserUseTaskTool));
        registry.register(Arc::new(BrowserUseAuthTaskTool));
        registry.register(Arc::new(BrowserUseVisionTaskTool));

        // Stored website logins
        registry.register(Arc::new(AuthCredentialsTool));

        registry
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let schema = tool.schema();
        debug!(name = schema.name, "Registering tool");
        self.tools.insert(schema.name.to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    /// OpenAI function-calling schemas, sorted by name.
    pub fn get_tool_schemas(&self) -> Vec<Value> {
        let mut names = self.tool_names();
        names.sort();
        names
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|tool| {
                let schema = tool.schema();
                json!({
                    "type": "function",
                    "function": {
                        "name": schema.name,
                        "description": schema.description,
                        "parameters": schema.parameters
                    }
                })
            })
            .collect()
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    pub async fn execute(&self, name: &str, ctx: ToolContext, params: Value) -> Result<Value> {
        let tool = self
            .get(name)
            .ok_or_else(|| Error::Tool(format!("Unknown tool: {}", name)))?;

        if let Err(e) = tool.validate(&params) {
            warn!(tool = name, error = %e, "Tool validation failed");
            return Err(e);
        }

        debug!(tool = name, "Executing tool");
        tool.execute(ctx, params).await
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
