use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info, warn};

use vigil_core::error::ExecutionError;
use vigil_core::event::EventBus;
use vigil_core::state::ConversationState;
use vigil_core::traits::StateStore;
use vigil_core::types::{ConversationId, NodeOutput, Turn};

use crate::graph::{CompiledGraph, GraphExecutor};
use crate::lane::LaneManager;

/// What a caller gets back from one request.
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub conversation: ConversationId,
    pub result: MergedResult,
    /// Pass number within the conversation.
    pub pass: u64,
    pub elapsed_ms: u64,
}

/// The merged result of a pass, read from the nodes feeding `END`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MergedResult {
    /// Final judgment plus every score produced on the way.
    Scored {
        node: String,
        score: f64,
        justification: String,
        scores: BTreeMap<String, f64>,
    },
    /// Free-text status of a proposing node (e.g. a finished tool loop).
    Status { node: String, message: String },
}

impl MergedResult {
    fn from_state(graph: &CompiledGraph, state: &ConversationState) -> Option<Self> {
        let scores: BTreeMap<String, f64> = graph
            .slot_ids()
            .filter_map(|id| state.score(id).map(|s| (id.to_string(), s.score)))
            .collect();

        graph.result_nodes().into_iter().find_map(|id| match state.output(id)? {
            NodeOutput::Scored(s) => Some(Self::Scored {
                node: id.to_string(),
                score: s.score,
                justification: s.justification.clone(),
                scores: scores.clone(),
            }),
            NodeOutput::Proposal(p) => Some(Self::Status {
                node: id.to_string(),
                message: p.text.clone(),
            }),
            NodeOutput::ToolBatch { results } => Some(Self::Status {
                node: id.to_string(),
                message: format!("{} tool call(s) executed", results.len()),
            }),
        })
    }
}

/// Request entry point: serializes requests per conversation, loads state,
/// runs one pass, and persists the result.
pub struct Orchestrator {
    graph: Arc<CompiledGraph>,
    executor: GraphExecutor,
    store: Arc<dyn StateStore>,
    lanes: LaneManager,
}

impl Orchestrator {
    pub fn new(
        graph: Arc<CompiledGraph>,
        executor: GraphExecutor,
        store: Arc<dyn StateStore>,
        lanes: LaneManager,
    ) -> Self {
        Self {
            graph,
            executor,
            store,
            lanes,
        }
    }

    /// Attach an event bus to the underlying executor.
    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.executor = self.executor.with_event_bus(bus);
        self
    }

    pub fn graph(&self) -> &CompiledGraph {
        &self.graph
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    /// Handle one request: append `input` to the conversation's history and run
    /// a pass. On failure the stored state is left untouched.
    pub async fn handle(
        &self,
        conversation: &ConversationId,
        author: &str,
        input: &str,
    ) -> Result<RunOutcome, ExecutionError> {
        let started = Instant::now();
        let _lane = self.lanes.acquire(conversation).await?;
        debug!(conversation = %conversation, "Lane acquired");

        let mut state = self.store.load(conversation).await?;
        state.append_turn(Turn::message(author, input));

        let state = self.executor.run(&self.graph, state).await?;
        let result = self.commit(conversation, &state).await?;

        let elapsed_ms = started.elapsed().as_millis() as u64;
        info!(
            conversation = %conversation,
            pass = state.passes(),
            elapsed_ms,
            "Request handled"
        );

        Ok(RunOutcome {
            conversation: conversation.clone(),
            result,
            pass: state.passes(),
            elapsed_ms,
        })
    }

    /// Merge the finished pass and persist it. Nothing is saved unless a
    /// result could be merged.
    async fn commit(
        &self,
        conversation: &ConversationId,
        state: &ConversationState,
    ) -> Result<MergedResult, ExecutionError> {
        let result = MergedResult::from_state(&self.graph, state).ok_or_else(|| {
            warn!(conversation = %conversation, "Pass reached END without a result node output");
            ExecutionError::Stalled {
                pending: self
                    .graph
                    .result_nodes()
                    .into_iter()
                    .map(String::from)
                    .collect(),
            }
        })?;
        self.store.save(conversation, state).await?;
        Ok(result)
    }

    /// Current persisted state of a conversation.
    pub async fn state(&self, conversation: &ConversationId) -> Result<ConversationState, ExecutionError> {
        Ok(self.store.load(conversation).await?)
    }
}
