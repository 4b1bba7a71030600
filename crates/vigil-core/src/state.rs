use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ExecutionError;
use crate::types::{ControlMessage, ConversationId, NodeOutput, Proposal, StructuredResult, ToolResult, Turn};

/// Persisted state of one conversation.
///
/// History is append-only. Output slots are write-once within a pass; a new
/// pass (or a loop re-entry) must clear a slot before its node may write again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationState {
    conversation_id: ConversationId,
    #[serde(default)]
    history: Vec<Turn>,
    #[serde(default)]
    outputs: BTreeMap<String, Option<NodeOutput>>,
    #[serde(default)]
    scratch: Vec<ControlMessage>,
    /// Number of passes run against this conversation.
    #[serde(default)]
    passes: u64,
    #[serde(default)]
    updated_at: Option<DateTime<Utc>>,
}

impl ConversationState {
    pub fn new(conversation_id: ConversationId) -> Self {
        Self {
            conversation_id,
            history: vec![],
            outputs: BTreeMap::new(),
            scratch: vec![],
            passes: 0,
            updated_at: None,
        }
    }

    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    pub fn history(&self) -> &[Turn] {
        &self.history
    }

    pub fn append_turn(&mut self, turn: Turn) {
        self.history.push(turn);
        self.updated_at = Some(Utc::now());
    }

    pub fn outputs(&self) -> &BTreeMap<String, Option<NodeOutput>> {
        &self.outputs
    }

    /// Output of a node, if it produced one.
    pub fn output(&self, node: &str) -> Option<&NodeOutput> {
        self.outputs.get(node).and_then(|slot| slot.as_ref())
    }

    pub fn score(&self, node: &str) -> Option<&StructuredResult> {
        self.output(node).and_then(NodeOutput::as_score)
    }

    pub fn has_output(&self, node: &str) -> bool {
        self.output(node).is_some()
    }

    /// Write a node's output. Fails if the slot is already filled in this pass.
    pub fn record_output(&mut self, node: &str, output: NodeOutput) -> Result<(), ExecutionError> {
        let slot = self.outputs.entry(node.to_string()).or_insert(None);
        if slot.is_some() {
            return Err(ExecutionError::SlotOccupied {
                node: node.to_string(),
            });
        }
        *slot = Some(output);
        self.updated_at = Some(Utc::now());
        Ok(())
    }

    /// Empty the given slots (loop re-entry).
    pub fn clear_outputs<'a>(&mut self, nodes: impl IntoIterator<Item = &'a str>) {
        for node in nodes {
            if let Some(slot) = self.outputs.get_mut(node) {
                *slot = None;
            }
        }
    }

    /// Start a new pass: reserve one empty slot per node and reset the scratch list.
    pub fn begin_pass<'a>(&mut self, slots: impl IntoIterator<Item = &'a str>) {
        self.outputs.clear();
        for node in slots {
            self.outputs.insert(node.to_string(), None);
        }
        self.scratch.clear();
        self.passes += 1;
    }

    pub fn passes(&self) -> u64 {
        self.passes
    }

    pub fn scratch(&self) -> &[ControlMessage] {
        &self.scratch
    }

    pub fn push_control(&mut self, msg: ControlMessage) {
        self.scratch.push(msg);
    }

    /// Most recent proposal in the scratch list.
    pub fn latest_proposal(&self) -> Option<&Proposal> {
        self.scratch.iter().rev().find_map(|m| match m {
            ControlMessage::Proposal { proposal, .. } => Some(proposal),
            ControlMessage::ToolResult(_) => None,
        })
    }

    /// All tool results recorded in history.
    pub fn tool_results(&self) -> impl Iterator<Item = &ToolResult> {
        self.history.iter().filter_map(|t| match t {
            Turn::ToolResult(r) => Some(r),
            Turn::Message { .. } => None,
        })
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }
}
