// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::Arc;

use arbor_model::ToolSchema;
use serde_json::json;

use crate::Tool;

/// Central registry holding the tools available to one agent.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Produce schemas for all registered tools, sorted by name.  The
    /// `required` list is folded into the parameters object so the schema
    /// matches what JSON-Schema-consuming backends expect.
    pub fn schemas(&self) -> Vec<ToolSchema> {
        let mut schemas: Vec<ToolSchema> = self
            .tools
            .values()
            .map(|t| {
                let mut parameters = t.parameters_schema();
                let required = t.required();
                if !required.is_empty() && parameters.is_object() {
                    if let Some(obj) = parameters.as_object_mut() {
                        obj.entry("required").or_insert_with(|| json!(required));
                    }
                }
                ToolSchema {
                    name: t.name().to_string(),
                    description: t.description().to_string(),
                    parameters,
                }
            })
            .collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.names())
            .finish()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::Value;

    use super::*;
    use crate::{ToolContext, ToolResult};

    struct NamedTool {
        name: &'static str,
        required: Vec<String>,
    }

    #[async_trait]
    impl Tool for NamedTool {
        fn name(&self) -> &str {
            self.name
        }
        fn description(&self) -> &str {
            "a test tool"
        }
        fn parameters_schema(&self) -> Value {
            json!({ "type": "object", "properties": {} })
        }
        fn required(&self) -> Vec<String> {
            self.required.clone()
        }
        async fn execute(&self, _input: &str, _ctx: &ToolContext) -> anyhow::Result<ToolResult> {
            Ok(ToolResult::ok("ok"))
        }
    }

    fn tool(name: &'static str) -> Arc<dyn Tool> {
        Arc::new(NamedTool {
            name,
            required: vec![],
        })
    }

    #[test]
    fn register_and_get() {
        let mut reg = ToolRegistry::new();
        reg.register(tool("echo"));
        assert!(reg.get("echo").is_some());
        assert!(reg.get("missing").is_none());
    }

    #[test]
    fn names_are_sorted() {
        let mut reg = ToolRegistry::new();
        reg.register(tool("b"));
        reg.register(tool("a"));
        assert_eq!(reg.names(), vec!["a", "b"]);
    }

    #[test]
    fn schemas_sorted_and_include_required() {
        let mut reg = ToolRegistry::new();
        reg.register(Arc::new(NamedTool {
            name: "t",
            required: vec!["x".into()],
        }));
        let schemas = reg.schemas();
        assert_eq!(schemas[0].name, "t");
        assert_eq!(schemas[0].parameters["required"][0], "x");
    }

    #[test]
    fn registering_same_name_twice_overwrites() {
        let mut reg = ToolRegistry::new();
        reg.register(tool("t"));
        reg.register(tool("t"));
        assert_eq!(reg.names().len(), 1);
    }
}
