use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;

use vigil_core::error::{AnalyzerError, ExecutionError};
use vigil_core::traits::{Analyzer, Router};
use vigil_core::types::{AnalyzerOutput, Decision, PromptContext, StructuredResult};
use vigil_tools::ToolRegistry;

use crate::graph::{CompiledGraph, NodeKind};

/// Decision values of [`PendingToolCalls`].
pub const CALL_TOOL: &str = "call_tool";
pub const FINISH: &str = "end";

/// Capability objects injected into an executor at construction.
/// Nothing here is process-global; every run sees exactly this set.
#[derive(Clone)]
pub struct Capabilities {
    analyzers: HashMap<String, Arc<dyn Analyzer>>,
    routers: HashMap<String, Arc<dyn Router>>,
    tools: Arc<ToolRegistry>,
}

impl Capabilities {
    pub fn new(tools: Arc<ToolRegistry>) -> Self {
        Self {
            analyzers: HashMap::new(),
            routers: HashMap::new(),
            tools,
        }
    }

    /// Capabilities with the local reducers (`min`, `max`, `mean`) and the
    /// `pending_tool_calls` router registered.
    pub fn with_builtins(tools: Arc<ToolRegistry>) -> Self {
        Self::new(tools)
            .with_analyzer(ScoreReducer::new("min", Reduce::Min))
            .with_analyzer(ScoreReducer::new("max", Reduce::Max))
            .with_analyzer(ScoreReducer::new("mean", Reduce::Mean))
            .with_router(PendingToolCalls)
    }

    /// Register an analyzer under its own name.
    pub fn with_analyzer(mut self, analyzer: impl Analyzer) -> Self {
        let name = analyzer.name().to_string();
        self.analyzers.insert(name, Arc::new(analyzer));
        self
    }

    /// Register a shared analyzer under an explicit capability name.
    pub fn insert_analyzer(&mut self, name: impl Into<String>, analyzer: Arc<dyn Analyzer>) {
        self.analyzers.insert(name.into(), analyzer);
    }

    pub fn with_router(mut self, router: impl Router) -> Self {
        let name = router.name().to_string();
        self.routers.insert(name, Arc::new(router));
        self
    }

    pub fn insert_router(&mut self, name: impl Into<String>, router: Arc<dyn Router>) {
        self.routers.insert(name.into(), router);
    }

    pub fn analyzer(&self, name: &str) -> Option<Arc<dyn Analyzer>> {
        self.analyzers.get(name).cloned()
    }

    pub fn router(&self, name: &str) -> Option<Arc<dyn Router>> {
        self.routers.get(name).cloned()
    }

    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }

    /// Sorted analyzer names.
    pub fn analyzer_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.analyzers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Verify every node of `graph` resolves to a registered capability.
    pub fn check(&self, graph: &CompiledGraph) -> Result<(), ExecutionError> {
        for node in graph.nodes() {
            let capability = node.capability();
            let (role, found) = match node.kind {
                NodeKind::IndependentWorker | NodeKind::Aggregator => {
                    ("analyzer", self.analyzers.contains_key(capability))
                }
                NodeKind::Router => ("router", self.routers.contains_key(capability)),
                NodeKind::ToolExecutor => continue,
            };
            if !found {
                return Err(ExecutionError::MissingCapability {
                    node: node.id.clone(),
                    role: role.to_string(),
                    capability: capability.to_string(),
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reduce {
    Min,
    Max,
    Mean,
}

/// Local aggregator that combines its predecessors' scores.
pub struct ScoreReducer {
    name: String,
    reduce: Reduce,
}

impl ScoreReducer {
    pub fn new(name: impl Into<String>, reduce: Reduce) -> Self {
        Self {
            name: name.into(),
            reduce,
        }
    }

    fn combine(&self, ctx: &PromptContext) -> Result<StructuredResult, AnalyzerError> {
        let scores: Vec<(&str, &StructuredResult)> = ctx.input_scores().collect();
        let Some((&first, rest)) = scores.split_first() else {
            return Err(AnalyzerError::MalformedOutput(format!(
                "{} reducer at '{}' received no scores",
                self.name, ctx.node_id
            )));
        };

        Ok(match self.reduce {
            Reduce::Min | Reduce::Max => {
                let mut chosen = first;
                for &cur in rest {
                    let better = match self.reduce {
                        Reduce::Min => cur.1.score < chosen.1.score,
                        _ => cur.1.score > chosen.1.score,
                    };
                    if better {
                        chosen = cur;
                    }
                }
                let (node, s) = chosen;
                StructuredResult::new(s.score, format!("{}: {}", node, s.justification))
            }
            Reduce::Mean => {
                let total: f64 = scores.iter().map(|(_, s)| s.score).sum();
                let justification = scores
                    .iter()
                    .map(|(node, s)| format!("{}: {}", node, s.justification))
                    .collect::<Vec<_>>()
                    .join("; ");
                StructuredResult::new(total / scores.len() as f64, justification)
            }
        })
    }
}

impl Analyzer for ScoreReducer {
    fn name(&self) -> &str {
        &self.name
    }

    fn invoke(&self, ctx: PromptContext) -> BoxFuture<'_, Result<AnalyzerOutput, AnalyzerError>> {
        Box::pin(async move { self.combine(&ctx).map(AnalyzerOutput::Scored) })
    }
}

/// Routes on the latest proposal: `call_tool` while it requests actions,
/// `end` otherwise.
pub struct PendingToolCalls;

impl Router for PendingToolCalls {
    fn name(&self) -> &str {
        "pending_tool_calls"
    }

    fn decide(&self, ctx: PromptContext) -> BoxFuture<'_, Result<Decision, AnalyzerError>> {
        Box::pin(async move {
            let pending = ctx
                .latest_proposal()
                .is_some_and(|p| p.requests_action());
            Ok(Decision::from(if pending { CALL_TOOL } else { FINISH }))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_core::types::{ControlMessage, ConversationId, NodeOutput, Proposal, ToolCall};

    fn ctx_with_scores(scores: &[(&str, f64)]) -> PromptContext {
        let mut ctx = PromptContext::new(ConversationId::from_str("room-1"), "g");
        for (node, score) in scores {
            ctx.inputs.insert(
                node.to_string(),
                NodeOutput::Scored(StructuredResult::new(*score, format!("{} says", node))),
            );
        }
        ctx
    }

    #[tokio::test]
    async fn test_min_reducer() {
        let reducer = ScoreReducer::new("min", Reduce::Min);
        let out = reducer
            .invoke(ctx_with_scores(&[("a", 0.9), ("b", 0.1), ("c", 0.0)]))
            .await
            .unwrap();
        match out {
            AnalyzerOutput::Scored(s) => {
                assert_eq!(s.score, 0.0);
                assert!(s.justification.starts_with("c:"));
            }
            other => panic!("unexpected output: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_max_and_mean_reducers() {
        let ctx = ctx_with_scores(&[("a", 0.2), ("b", 0.8)]);

        let max = ScoreReducer::new("max", Reduce::Max).combine(&ctx).unwrap();
        assert_eq!(max.score, 0.8);

        let mean = ScoreReducer::new("mean", Reduce::Mean).combine(&ctx).unwrap();
        assert!((mean.score - 0.5).abs() < 1e-9);
        assert!(mean.justification.contains("a: a says"));
        assert!(mean.justification.contains("b: b says"));
    }

    #[test]
    fn test_reducer_without_inputs_is_malformed() {
        let err = ScoreReducer::new("min", Reduce::Min)
            .combine(&ctx_with_scores(&[]))
            .unwrap_err();
        assert!(matches!(err, AnalyzerError::MalformedOutput(_)));
    }

    #[tokio::test]
    async fn test_pending_tool_calls_router() {
        let mut ctx = PromptContext::new(ConversationId::from_str("route-9"), "route");
        let decision = PendingToolCalls.decide(ctx.clone()).await.unwrap();
        assert_eq!(decision.as_str(), FINISH);

        ctx.scratch.push(ControlMessage::Proposal {
            node: "analyst".into(),
            proposal: Proposal::text("flag it")
                .with_call(ToolCall::from_json("flag", serde_json::json!({"id": "r1"}))),
        });
        let decision = PendingToolCalls.decide(ctx.clone()).await.unwrap();
        assert_eq!(decision.as_str(), CALL_TOOL);

        ctx.scratch.push(ControlMessage::Proposal {
            node: "analyst".into(),
            proposal: Proposal::text("Surveillance Clean"),
        });
        let decision = PendingToolCalls.decide(ctx).await.unwrap();
        assert_eq!(decision.as_str(), FINISH);
    }

    #[test]
    fn test_builtins_registered() {
        let caps = Capabilities::with_builtins(Arc::new(ToolRegistry::new()));
        assert_eq!(caps.analyzer_names(), vec!["max", "mean", "min"]);
        assert!(caps.router("pending_tool_calls").is_some());
        assert!(caps.router("missing").is_none());
    }
}
