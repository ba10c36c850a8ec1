//! Tool registry: per-tool schemas and handler dispatch.
//!
//! Input is validated against the tool's input schema before dispatch;
//! output is filtered by the output schema's allowlist before it reaches
//! the transport.

use crate::error::{Error, Result};
use crate::tools::schema::{sanitize, validate};
use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// A tool definition: name, description and both schemas.
#[derive(Debug, Clone)]
pub struct ToolDef {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    pub output_schema: Value,
}

impl ToolDef {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema: Value::Object(Default::default()),
            output_schema: Value::Object(Default::default()),
        }
    }

    pub fn with_input_schema(mut self, schema: Value) -> Self {
        self.input_schema = schema;
        self
    }

    pub fn with_output_schema(mut self, schema: Value) -> Self {
        self.output_schema = schema;
        self
    }
}

/// Async tool handler.
pub type ToolHandler = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// Registry of tools exposed over the stdio transport.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, (ToolDef, ToolHandler)>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: ToolDef, handler: ToolHandler) {
        self.tools.insert(tool.name.clone(), (tool, handler));
    }

    pub fn get_tool(&self, name: &str) -> Option<&ToolDef> {
        self.tools.get(name).map(|(tool, _)| tool)
    }

    pub fn tool_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(|s| s.as_str()).collect();
        names.sort();
        names
    }

    pub fn count(&self) -> usize {
        self.tools.len()
    }

    /// Validate, dispatch and sanitize one call. Invalid input fails
    /// before the handler runs, so the call has no side effects.
    pub async fn execute(&self, name: &str, params: Value) -> Result<Value> {
        let (tool, handler) = self
            .tools
            .get(name)
            .ok_or_else(|| Error::invalid_input("tool", "a registered tool"))?;

        validate(&tool.input_schema, &params)?;
        let output = handler(params).await?;
        Ok(sanitize(&tool.output_schema, output))
    }
}
