use std::collections::HashMap;
use std::sync::Arc;

use vigil_core::config::ToolsConfig;
use vigil_core::error::ToolError;
use vigil_core::traits::Tool;
use vigil_core::types::{ToolDefinition, ToolOutcome};

/// Registry of available tools.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool.
    pub fn register(&mut self, tool: impl Tool) {
        let name = tool.name().to_string();
        self.tools.insert(name, Arc::new(tool));
    }

    /// Register an already shared tool.
    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        self.tools.insert(name, tool);
    }

    /// Unregister a tool by name.
    pub fn unregister(&mut self, name: &str) -> bool {
        self.tools.remove(name).is_some()
    }

    /// Get a tool by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// List all registered tools, sorted by name.
    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Get tool definitions for advertising to analyzers.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .values()
            .map(|t| ToolDefinition {
                name: t.name().to_string(),
                description: t.description().to_string(),
                input_schema: t.input_schema(),
            })
            .collect()
    }

    /// Execute a tool by name.
    pub async fn execute(
        &self,
        name: &str,
        args: serde_json::Map<String, serde_json::Value>,
    ) -> Result<ToolOutcome, ToolError> {
        let tool = self
            .get(name)
            .ok_or_else(|| ToolError::UnknownTool(name.to_string()))?;

        let timeout = std::time::Duration::from_secs(tool.timeout_secs());

        match tokio::time::timeout(timeout, tool.execute(args)).await {
            Ok(result) => result,
            Err(_) => Err(ToolError::CallFailed {
                tool: name.to_string(),
                message: format!("timed out after {}s", tool.timeout_secs()),
            }),
        }
    }

    /// Create a registry with the built-in tools enabled by the configuration.
    pub fn with_builtins(config: &ToolsConfig) -> Self {
        let mut registry = Self::new();

        if let Some(ref flag) = config.flag_route {
            registry.register(crate::builtin::FlagRouteTool::new(flag.clone()));
        }

        registry
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::BoxFuture;

    struct EchoTool;

    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }

        fn description(&self) -> &str {
            "Echo the `text` argument."
        }

        fn input_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object", "properties": {"text": {"type": "string"}}})
        }

        fn execute(
            &self,
            args: serde_json::Map<String, serde_json::Value>,
        ) -> BoxFuture<'_, Result<ToolOutcome, ToolError>> {
            Box::pin(async move {
                let text = args
                    .get("text")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| ToolError::InvalidArguments {
                        tool: "echo".into(),
                        message: "missing text".into(),
                    })?;
                Ok(ToolOutcome::text(text))
            })
        }
    }

    struct SlowTool;

    impl Tool for SlowTool {
        fn name(&self) -> &str {
            "slow"
        }

        fn description(&self) -> &str {
            "Never finishes in time."
        }

        fn input_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object"})
        }

        fn execute(
            &self,
            _args: serde_json::Map<String, serde_json::Value>,
        ) -> BoxFuture<'_, Result<ToolOutcome, ToolError>> {
            Box::pin(async move {
                tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
                Ok(ToolOutcome::text("late"))
            })
        }

        fn timeout_secs(&self) -> u64 {
            1
        }
    }

    fn args(value: serde_json::Value) -> serde_json::Map<String, serde_json::Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[tokio::test]
    async fn test_register_and_execute() {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);
        assert_eq!(registry.list(), vec!["echo"]);
        assert_eq!(registry.definitions().len(), 1);

        let out = registry
            .execute("echo", args(serde_json::json!({"text": "hi"})))
            .await
            .unwrap();
        assert_eq!(out.content, "hi");
    }

    #[tokio::test]
    async fn test_unknown_tool() {
        let registry = ToolRegistry::new();
        let err = registry.execute("nope", Default::default()).await.unwrap_err();
        assert_eq!(err, ToolError::UnknownTool("nope".into()));
    }

    #[tokio::test]
    async fn test_invalid_arguments() {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);
        let err = registry.execute("echo", Default::default()).await.unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_becomes_call_failure() {
        let mut registry = ToolRegistry::new();
        registry.register(SlowTool);
        let err = registry.execute("slow", Default::default()).await.unwrap_err();
        assert!(matches!(err, ToolError::CallFailed { ref tool, .. } if tool == "slow"));
    }

    #[test]
    fn test_unregister() {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);
        assert!(registry.unregister("echo"));
        assert!(!registry.unregister("echo"));
        assert!(registry.get("echo").is_none());
    }

    #[test]
    fn test_builtins_follow_config() {
        let registry = ToolRegistry::with_builtins(&ToolsConfig::default());
        assert!(registry.list().is_empty());

        let config = ToolsConfig {
            flag_route: Some(Default::default()),
        };
        let registry = ToolRegistry::with_builtins(&config);
        assert_eq!(registry.list(), vec!["flag_route"]);
    }
}
