use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Opaque conversation identifier (a room, a route, a chat).
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct ConversationId(pub String);

impl ConversationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_str(s: &str) -> Self {
        Self(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ConversationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One entry of a conversation's append-only history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Turn {
    /// A message pushed by a participant.
    Message {
        author: String,
        content: String,
        timestamp: DateTime<Utc>,
    },
    /// The outcome of a tool call made during a loop pass.
    ToolResult(ToolResult),
}

impl Turn {
    pub fn message(author: impl Into<String>, content: impl Into<String>) -> Self {
        Self::Message {
            author: author.into(),
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    /// Message text, if this is a message turn.
    pub fn text(&self) -> Option<&str> {
        match self {
            Self::Message { content, .. } => Some(content),
            Self::ToolResult(_) => None,
        }
    }
}

/// A side-effecting action requested by a node's output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub args: serde_json::Map<String, serde_json::Value>,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, args: serde_json::Map<String, serde_json::Value>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            args,
        }
    }

    /// Build a call from a JSON object literal. Non-object values yield empty args.
    pub fn from_json(name: impl Into<String>, args: serde_json::Value) -> Self {
        let args = match args {
            serde_json::Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        Self::new(name, args)
    }
}

/// Result of a tool execution, matched to its call by id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub call_id: String,
    pub tool: String,
    pub content: String,
    pub is_error: bool,
}

impl ToolResult {
    pub fn success(call: &ToolCall, content: impl Into<String>) -> Self {
        Self {
            call_id: call.id.clone(),
            tool: call.name.clone(),
            content: content.into(),
            is_error: false,
        }
    }

    pub fn failure(call: &ToolCall, content: impl Into<String>) -> Self {
        Self {
            call_id: call.id.clone(),
            tool: call.name.clone(),
            content: content.into(),
            is_error: true,
        }
    }
}

/// Opaque success payload returned by a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub content: String,
}

impl ToolOutcome {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
        }
    }
}

/// Tool definition, as advertised to analyzers that can request actions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// Inclusive range a node's score must fall into.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreRange {
    pub min: f64,
    pub max: f64,
}

impl ScoreRange {
    pub const UNIT: ScoreRange = ScoreRange { min: 0.0, max: 1.0 };

    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, score: f64) -> bool {
        score.is_finite() && score >= self.min && score <= self.max
    }
}

impl std::fmt::Display for ScoreRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {}]", self.min, self.max)
    }
}

/// Fixed-shape analyzer verdict: a score plus a short justification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredResult {
    pub score: f64,
    pub justification: String,
}

impl StructuredResult {
    pub fn new(score: f64, justification: impl Into<String>) -> Self {
        Self {
            score,
            justification: justification.into(),
        }
    }
}

/// Free-text analyzer output that may request tool calls.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    pub text: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
}

impl Proposal {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            tool_calls: vec![],
        }
    }

    pub fn with_call(mut self, call: ToolCall) -> Self {
        self.tool_calls.push(call);
        self
    }

    pub fn requests_action(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// What an analyzer capability returns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AnalyzerOutput {
    Scored(StructuredResult),
    Proposal(Proposal),
}

/// A node's output slot content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeOutput {
    Scored(StructuredResult),
    Proposal(Proposal),
    ToolBatch { results: Vec<ToolResult> },
}

impl NodeOutput {
    pub fn as_score(&self) -> Option<&StructuredResult> {
        match self {
            Self::Scored(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_proposal(&self) -> Option<&Proposal> {
        match self {
            Self::Proposal(p) => Some(p),
            _ => None,
        }
    }
}

impl From<AnalyzerOutput> for NodeOutput {
    fn from(out: AnalyzerOutput) -> Self {
        match out {
            AnalyzerOutput::Scored(s) => Self::Scored(s),
            AnalyzerOutput::Proposal(p) => Self::Proposal(p),
        }
    }
}

/// In-flight control message kept in the loop-mode scratch list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    Proposal { node: String, proposal: Proposal },
    ToolResult(ToolResult),
}

/// A router's decision value, matched against outgoing edge guards.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Decision(pub String);

impl Decision {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Decision {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The view of state handed to a capability when its node runs:
/// the declared predecessors' outputs, the shared history, and the loop scratch.
#[derive(Debug, Clone, Serialize)]
pub struct PromptContext {
    pub conversation_id: ConversationId,
    pub node_id: String,
    pub inputs: BTreeMap<String, NodeOutput>,
    pub history: Vec<Turn>,
    pub scratch: Vec<ControlMessage>,
    /// Tripped when the run has failed elsewhere and this call's result will be discarded.
    #[serde(skip)]
    pub cancel: CancellationToken,
}

impl PromptContext {
    pub fn new(conversation_id: ConversationId, node_id: impl Into<String>) -> Self {
        Self {
            conversation_id,
            node_id: node_id.into(),
            inputs: BTreeMap::new(),
            history: vec![],
            scratch: vec![],
            cancel: CancellationToken::new(),
        }
    }

    /// Latest message turn, i.e. the one that triggered this pass.
    pub fn latest_message(&self) -> Option<&str> {
        self.history.iter().rev().find_map(|t| t.text())
    }

    /// Scores of all predecessors that produced one.
    pub fn input_scores(&self) -> impl Iterator<Item = (&str, &StructuredResult)> {
        self.inputs
            .iter()
            .filter_map(|(k, v)| v.as_score().map(|s| (k.as_str(), s)))
    }

    /// Most recent proposal in the loop scratch.
    pub fn latest_proposal(&self) -> Option<&Proposal> {
        self.scratch.iter().rev().find_map(|m| match m {
            ControlMessage::Proposal { proposal, .. } => Some(proposal),
            ControlMessage::ToolResult(_) => None,
        })
    }
}

/// Graph execution event broadcast to all subscribers.
#[derive(Debug, Clone)]
pub enum GraphEvent {
    /// A pass started for a conversation.
    RunStarted { conversation: ConversationId, graph: String },
    /// A node's capability was dispatched.
    NodeStarted { node: String },
    /// A node wrote its output (or decision).
    NodeCompleted { node: String, elapsed_ms: u64 },
    /// A node's capability failed; the run is aborting.
    NodeFailed { node: String, error: String },
    /// A router chose an edge.
    Routed { node: String, decision: String, target: String },
    /// A single tool call finished.
    ToolExecuted { result: ToolResult },
    /// A loop-back edge cleared downstream slots and re-entered a node.
    LoopReentered { node: String, loop_count: usize },
    /// The pass reached END.
    RunComplete { conversation: ConversationId, elapsed_ms: u64 },
    /// The pass ended with a terminal error.
    RunFailed { conversation: ConversationId, error: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_score_range() {
        let unit = ScoreRange::UNIT;
        assert!(unit.contains(0.0));
        assert!(unit.contains(1.0));
        assert!(!unit.contains(1.01));
        assert!(!unit.contains(f64::NAN));
        assert_eq!(ScoreRange::new(1.0, 10.0).to_string(), "[1, 10]");
    }

    #[test]
    fn test_tool_call_from_json() {
        let call = ToolCall::from_json("flag", serde_json::json!({"id": "r1"}));
        assert_eq!(call.name, "flag");
        assert_eq!(call.args.get("id"), Some(&serde_json::json!("r1")));
        assert!(!call.id.is_empty());

        let call = ToolCall::from_json("flag", serde_json::json!("not an object"));
        assert!(call.args.is_empty());
    }

    #[test]
    fn test_analyzer_output_wire_format() {
        let json = r#"{"type":"scored","score":0.4,"justification":"tense tone"}"#;
        let out: AnalyzerOutput = serde_json::from_str(json).unwrap();
        assert_eq!(out, AnalyzerOutput::Scored(StructuredResult::new(0.4, "tense tone")));

        let json = r#"{"type":"proposal","text":"Surveillance Clean"}"#;
        let out: AnalyzerOutput = serde_json::from_str(json).unwrap();
        match out {
            AnalyzerOutput::Proposal(p) => {
                assert_eq!(p.text, "Surveillance Clean");
                assert!(!p.requests_action());
            }
            other => panic!("unexpected output: {:?}", other),
        }
    }

    #[test]
    fn test_prompt_context_accessors() {
        let mut ctx = PromptContext::new(ConversationId::from_str("room-1"), "judge");
        ctx.history.push(Turn::message("u1", "hello"));
        ctx.history.push(Turn::message("u2", "stop texting me"));
        ctx.inputs.insert(
            "sentiment".into(),
            NodeOutput::Scored(StructuredResult::new(0.2, "hostile")),
        );
        ctx.scratch.push(ControlMessage::Proposal {
            node: "analyst".into(),
            proposal: Proposal::text("checking"),
        });

        assert_eq!(ctx.latest_message(), Some("stop texting me"));
        assert_eq!(ctx.input_scores().count(), 1);
        assert_eq!(ctx.latest_proposal().map(|p| p.text.as_str()), Some("checking"));
    }
}
