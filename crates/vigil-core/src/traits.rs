use futures::future::BoxFuture;

use crate::error::{AnalyzerError, StoreError, ToolError};
use crate::state::ConversationState;
use crate::types::*;

/// Analyzer: an external scoring or proposing capability (model call, rules engine, ...).
pub trait Analyzer: Send + Sync + 'static {
    /// Capability name (what graph nodes reference).
    fn name(&self) -> &str;

    /// Analyze the given view of conversation state.
    fn invoke(&self, ctx: PromptContext) -> BoxFuture<'_, Result<AnalyzerOutput, AnalyzerError>>;
}

/// Router: produces a decision value that selects one outgoing edge.
pub trait Router: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn decide(&self, ctx: PromptContext) -> BoxFuture<'_, Result<Decision, AnalyzerError>>;
}

/// Tool: a side-effecting action.
pub trait Tool: Send + Sync + 'static {
    /// Tool name (used in tool calls).
    fn name(&self) -> &str;

    /// Human-readable description.
    fn description(&self) -> &str;

    /// JSON Schema for tool arguments.
    fn input_schema(&self) -> serde_json::Value;

    /// Execute the tool with the given arguments.
    fn execute(
        &self,
        args: serde_json::Map<String, serde_json::Value>,
    ) -> BoxFuture<'_, Result<ToolOutcome, ToolError>>;

    /// Timeout in seconds for this tool.
    fn timeout_secs(&self) -> u64 {
        30
    }
}

/// State store: conversation persistence backend.
pub trait StateStore: Send + Sync + 'static {
    /// Load the state for a conversation, creating an empty one if absent.
    fn load(&self, id: &ConversationId) -> BoxFuture<'_, Result<ConversationState, StoreError>>;

    /// Persist the state for a conversation.
    fn save(
        &self,
        id: &ConversationId,
        state: &ConversationState,
    ) -> BoxFuture<'_, Result<(), StoreError>>;
}
