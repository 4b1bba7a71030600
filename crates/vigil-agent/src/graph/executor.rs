use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use vigil_core::config::EngineConfig;
use vigil_core::error::{AnalyzerError, ExecutionError};
use vigil_core::event::EventBus;
use vigil_core::state::ConversationState;
use vigil_core::types::{
    AnalyzerOutput, ControlMessage, Decision, GraphEvent, NodeOutput, PromptContext, ScoreRange,
    ToolCall, ToolResult, Turn,
};
use vigil_tools::ToolRegistry;

use super::compiler::CompiledGraph;
use super::node::{Node, NodeKind};
use super::{END, START};
use crate::capabilities::Capabilities;

/// Number of recent turns an aggregator sees.
pub const HISTORY_WINDOW: usize = 10;

/// Run-level limits.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Applied to every analyzer and router call unless the node overrides it.
    pub node_timeout: Duration,
    /// Bound on tool-loop iterations (tool batches and loop re-entries) per run.
    pub max_loops: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            node_timeout: Duration::from_secs(30),
            max_loops: 10,
        }
    }
}

impl From<&EngineConfig> for ExecutorConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            node_timeout: Duration::from_secs(config.node_timeout_secs),
            max_loops: config.max_tool_loops,
        }
    }
}

/// What a node task hands back to the scheduler.
enum TaskOutput {
    Analyzed(Result<AnalyzerOutput, AnalyzerError>),
    Decided(Result<Decision, AnalyzerError>),
    Tools(Vec<ToolResult>),
    Panicked,
}

struct TaskResult {
    node: String,
    epoch: u64,
    elapsed_ms: u64,
    output: TaskOutput,
}

/// Scheduling bookkeeping for one pass.
struct Pass<'g> {
    graph: &'g CompiledGraph,
    /// Forward edges whose source has completed (and, for routers, chose them).
    fired: HashSet<usize>,
    /// Nodes dispatched since their slot was last cleared.
    dispatched: HashSet<String>,
    /// Bumped when a loop re-entry clears a node; older task results are stale.
    epochs: HashMap<String, u64>,
    reentries: usize,
    tool_batches: usize,
}

impl<'g> Pass<'g> {
    fn new(graph: &'g CompiledGraph) -> Self {
        Self {
            graph,
            fired: graph.outgoing(START).iter().copied().collect(),
            dispatched: HashSet::new(),
            epochs: HashMap::new(),
            reentries: 0,
            tool_batches: 0,
        }
    }

    fn all_fired(&self, id: &str) -> bool {
        let incoming = self.graph.incoming(id);
        !incoming.is_empty() && incoming.iter().all(|i| self.fired.contains(i))
    }

    /// Nodes whose every incoming forward edge has fired, in declaration order.
    fn ready(&self) -> Vec<&'g Node> {
        self.graph
            .nodes()
            .iter()
            .filter(|n| !self.dispatched.contains(&n.id) && self.all_fired(&n.id))
            .collect()
    }

    fn reached_end(&self) -> bool {
        self.all_fired(END)
    }

    fn epoch(&self, id: &str) -> u64 {
        self.epochs.get(id).copied().unwrap_or(0)
    }

    /// Nodes left waiting on a predecessor when the pass ran dry.
    fn pending(&self) -> Vec<String> {
        let waiting: Vec<String> = self
            .graph
            .nodes()
            .iter()
            .filter(|n| !self.dispatched.contains(&n.id))
            .filter(|n| self.graph.incoming(&n.id).iter().any(|i| self.fired.contains(i)))
            .map(|n| n.id.clone())
            .collect();
        if waiting.is_empty() {
            vec![END.to_string()]
        } else {
            waiting
        }
    }
}

/// Executes compiled graphs against conversation state.
///
/// Each call to [`GraphExecutor::run`] is one pass: ready nodes are dispatched
/// concurrently onto a `JoinSet`, results are folded into the state by the
/// scheduler alone, and the first capability failure cancels the siblings,
/// drains them, and ends the pass with that error.
pub struct GraphExecutor {
    capabilities: Arc<Capabilities>,
    config: ExecutorConfig,
    event_bus: Option<Arc<EventBus>>,
}

impl GraphExecutor {
    pub fn new(capabilities: Arc<Capabilities>, config: ExecutorConfig) -> Self {
        Self {
            capabilities,
            config,
            event_bus: None,
        }
    }

    /// Publish graph events on `bus`.
    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    pub fn capabilities(&self) -> &Arc<Capabilities> {
        &self.capabilities
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    fn publish(&self, event: GraphEvent) {
        if let Some(ref bus) = self.event_bus {
            bus.publish(event);
        }
    }

    /// Run one pass of `graph` over `state`. Returns the full updated state,
    /// or the single error that ended the pass.
    pub async fn run(
        &self,
        graph: &CompiledGraph,
        mut state: ConversationState,
    ) -> Result<ConversationState, ExecutionError> {
        self.capabilities.check(graph)?;

        let started = Instant::now();
        let conversation = state.conversation_id().clone();
        state.begin_pass(graph.slot_ids());

        self.publish(GraphEvent::RunStarted {
            conversation: conversation.clone(),
            graph: graph.name().to_string(),
        });
        info!(
            conversation = %conversation,
            graph = %graph.name(),
            pass = state.passes(),
            "Run started"
        );

        let cancel = CancellationToken::new();
        let mut pass = Pass::new(graph);
        let mut tasks: JoinSet<TaskResult> = JoinSet::new();
        let mut failure: Option<ExecutionError> = None;

        loop {
            if failure.is_none() {
                for node in pass.ready() {
                    if let Err(e) = self.dispatch(node, &state, &mut pass, &mut tasks, &cancel) {
                        failure = Some(e);
                        cancel.cancel();
                        break;
                    }
                }
            }

            let Some(joined) = tasks.join_next().await else {
                break;
            };

            let result = match joined {
                Ok(result) => result,
                Err(join_error) => {
                    // Panics are caught inside the task, so this is an abort.
                    if failure.is_none() {
                        failure = Some(ExecutionError::Aborted {
                            node: "<task>".to_string(),
                            message: join_error.to_string(),
                        });
                        cancel.cancel();
                    }
                    continue;
                }
            };

            if failure.is_some() {
                debug!(node_id = %result.node, "Discarding result after run failure");
                continue;
            }
            if result.epoch != pass.epoch(&result.node) {
                debug!(node_id = %result.node, "Discarding result from before loop re-entry");
                continue;
            }

            if let Err(e) = self.complete(result, &mut state, &mut pass) {
                failure = Some(e);
                cancel.cancel();
            }
        }

        let elapsed_ms = started.elapsed().as_millis() as u64;

        let failure = failure.or_else(|| {
            (!pass.reached_end()).then(|| ExecutionError::Stalled {
                pending: pass.pending(),
            })
        });
        if let Some(err) = failure {
            error!(
                conversation = %conversation,
                node_id = err.node().unwrap_or("-"),
                kind = ?err.kind(),
                elapsed_ms,
                error = %err,
                "Run failed"
            );
            self.publish(GraphEvent::RunFailed {
                conversation,
                error: err.to_string(),
            });
            return Err(err);
        }

        info!(
            conversation = %conversation,
            elapsed_ms,
            loop_count = pass.reentries,
            "Run complete"
        );
        self.publish(GraphEvent::RunComplete {
            conversation,
            elapsed_ms,
        });
        Ok(state)
    }

    fn dispatch(
        &self,
        node: &Node,
        state: &ConversationState,
        pass: &mut Pass<'_>,
        tasks: &mut JoinSet<TaskResult>,
        cancel: &CancellationToken,
    ) -> Result<(), ExecutionError> {
        let epoch = pass.epoch(&node.id);
        let id = node.id.clone();

        match node.kind {
            NodeKind::IndependentWorker | NodeKind::Aggregator => {
                let analyzer = self
                    .capabilities
                    .analyzer(node.capability())
                    .ok_or_else(|| missing(node, "analyzer"))?;
                let ctx = build_context(pass.graph, node, state, cancel);
                let timeout = self.timeout_for(node);
                let range = node.score_range;
                spawn_node(tasks, id, epoch, async move {
                    let out = match tokio::time::timeout(timeout, analyzer.invoke(ctx)).await {
                        Ok(out) => out,
                        Err(_) => Err(AnalyzerError::Timeout {
                            timeout_ms: timeout.as_millis() as u64,
                        }),
                    };
                    TaskOutput::Analyzed(out.and_then(|o| check_score(o, range)))
                });
            }
            NodeKind::Router => {
                let router = self
                    .capabilities
                    .router(node.capability())
                    .ok_or_else(|| missing(node, "router"))?;
                let ctx = build_context(pass.graph, node, state, cancel);
                let timeout = self.timeout_for(node);
                spawn_node(tasks, id, epoch, async move {
                    let out = match tokio::time::timeout(timeout, router.decide(ctx)).await {
                        Ok(out) => out,
                        Err(_) => Err(AnalyzerError::Timeout {
                            timeout_ms: timeout.as_millis() as u64,
                        }),
                    };
                    TaskOutput::Decided(out)
                });
            }
            NodeKind::ToolExecutor => {
                pass.tool_batches += 1;
                if pass.tool_batches > self.config.max_loops {
                    warn!(
                        node_id = %node.id,
                        limit = self.config.max_loops,
                        "Tool loop limit reached"
                    );
                    return Err(ExecutionError::LoopLimitExceeded {
                        node: node.id.clone(),
                        limit: self.config.max_loops,
                    });
                }
                let calls = state
                    .latest_proposal()
                    .map(|p| p.tool_calls.clone())
                    .unwrap_or_default();
                let tools = self.capabilities.tools().clone();
                spawn_node(tasks, id, epoch, async move {
                    TaskOutput::Tools(run_tools(&tools, calls).await)
                });
            }
        }

        pass.dispatched.insert(node.id.clone());
        self.publish(GraphEvent::NodeStarted {
            node: node.id.clone(),
        });
        debug!(node_id = %node.id, kind = %node.kind, "Node dispatched");
        Ok(())
    }

    fn complete(
        &self,
        result: TaskResult,
        state: &mut ConversationState,
        pass: &mut Pass<'_>,
    ) -> Result<(), ExecutionError> {
        let TaskResult {
            node,
            elapsed_ms,
            output,
            ..
        } = result;

        match output {
            TaskOutput::Analyzed(Ok(out)) => {
                let out = NodeOutput::from(out);
                if let NodeOutput::Proposal(ref proposal) = out {
                    state.push_control(ControlMessage::Proposal {
                        node: node.clone(),
                        proposal: proposal.clone(),
                    });
                }
                state.record_output(&node, out)?;
                self.node_completed(&node, elapsed_ms);
                self.fire_all(&node, state, pass)
            }
            TaskOutput::Decided(Ok(decision)) => {
                let graph = pass.graph;
                let chosen = graph
                    .outgoing(&node)
                    .iter()
                    .copied()
                    .find(|&i| graph.edge(i).accepts(decision.as_str()));

                let Some(edge) = chosen else {
                    warn!(node_id = %node, decision = %decision, "No guard matched router decision");
                    return Err(ExecutionError::Routing {
                        node,
                        decision: decision.0,
                    });
                };

                self.node_completed(&node, elapsed_ms);
                let target = graph.edge(edge).to.clone();
                debug!(node_id = %node, decision = %decision, target = %target, "Routed");
                self.publish(GraphEvent::Routed {
                    node,
                    decision: decision.0,
                    target,
                });
                self.fire(edge, state, pass)
            }
            TaskOutput::Tools(results) => {
                let failed = results.iter().filter(|r| r.is_error).count();
                for r in &results {
                    state.append_turn(Turn::ToolResult(r.clone()));
                    state.push_control(ControlMessage::ToolResult(r.clone()));
                    self.publish(GraphEvent::ToolExecuted { result: r.clone() });
                }
                info!(
                    node_id = %node,
                    calls = results.len(),
                    failed,
                    "Tool batch executed"
                );
                state.record_output(&node, NodeOutput::ToolBatch { results })?;
                self.node_completed(&node, elapsed_ms);
                self.fire_all(&node, state, pass)
            }
            TaskOutput::Analyzed(Err(e)) | TaskOutput::Decided(Err(e)) => {
                error!(node_id = %node, elapsed_ms, error = %e, "Node failed");
                self.publish(GraphEvent::NodeFailed {
                    node: node.clone(),
                    error: e.to_string(),
                });
                Err(ExecutionError::NodeFailed { node, source: e })
            }
            TaskOutput::Panicked => {
                error!(node_id = %node, "Node task panicked");
                self.publish(GraphEvent::NodeFailed {
                    node: node.clone(),
                    error: "capability panicked".to_string(),
                });
                Err(ExecutionError::Aborted {
                    node,
                    message: "capability panicked".to_string(),
                })
            }
        }
    }

    fn node_completed(&self, node: &str, elapsed_ms: u64) {
        debug!(node_id = %node, elapsed_ms, "Node completed");
        self.publish(GraphEvent::NodeCompleted {
            node: node.to_string(),
            elapsed_ms,
        });
    }

    /// Fire every outgoing edge of a non-router node.
    fn fire_all(
        &self,
        node: &str,
        state: &mut ConversationState,
        pass: &mut Pass<'_>,
    ) -> Result<(), ExecutionError> {
        for &edge in pass.graph.outgoing(node) {
            self.fire(edge, state, pass)?;
        }
        Ok(())
    }

    /// Fire one edge. A back edge re-enters its loop: the loop counter moves,
    /// every slot downstream of the target is cleared, and the target becomes
    /// ready again.
    fn fire(
        &self,
        edge: usize,
        state: &mut ConversationState,
        pass: &mut Pass<'_>,
    ) -> Result<(), ExecutionError> {
        let graph = pass.graph;
        let edge_ref = graph.edge(edge);
        if !edge_ref.back {
            pass.fired.insert(edge);
            return Ok(());
        }

        let target = edge_ref.to.as_str();
        pass.reentries += 1;
        if pass.reentries > self.config.max_loops {
            warn!(node_id = %target, limit = self.config.max_loops, "Loop limit reached");
            return Err(ExecutionError::LoopLimitExceeded {
                node: target.to_string(),
                limit: self.config.max_loops,
            });
        }

        if let Some(downstream) = graph.downstream(target) {
            state.clear_outputs(downstream.iter().map(String::as_str));
            for id in downstream {
                pass.dispatched.remove(id);
                *pass.epochs.entry(id.clone()).or_default() += 1;
            }
            pass.fired
                .retain(|&i| !downstream.contains(&graph.edge(i).from));
        }

        info!(node_id = %target, loop_count = pass.reentries, "Loop re-entered");
        self.publish(GraphEvent::LoopReentered {
            node: target.to_string(),
            loop_count: pass.reentries,
        });
        Ok(())
    }

    fn timeout_for(&self, node: &Node) -> Duration {
        node.timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.config.node_timeout)
    }
}

fn missing(node: &Node, role: &str) -> ExecutionError {
    ExecutionError::MissingCapability {
        node: node.id.clone(),
        role: role.to_string(),
        capability: node.capability().to_string(),
    }
}

/// Spawn a node task. Panics inside the capability become `Panicked`.
fn spawn_node<F>(tasks: &mut JoinSet<TaskResult>, node: String, epoch: u64, fut: F)
where
    F: Future<Output = TaskOutput> + Send + 'static,
{
    tasks.spawn(async move {
        let started = Instant::now();
        let output = AssertUnwindSafe(fut)
            .catch_unwind()
            .await
            .unwrap_or(TaskOutput::Panicked);
        TaskResult {
            node,
            epoch,
            elapsed_ms: started.elapsed().as_millis() as u64,
            output,
        }
    });
}

/// The node's view of state: its forward predecessors' outputs, the shared
/// history (the recent window for aggregators), and the loop scratch.
fn build_context(
    graph: &CompiledGraph,
    node: &Node,
    state: &ConversationState,
    cancel: &CancellationToken,
) -> PromptContext {
    let mut ctx = PromptContext::new(state.conversation_id().clone(), node.id.clone());
    for pred in graph.predecessors(&node.id) {
        if let Some(out) = state.output(pred) {
            ctx.inputs.insert(pred.to_string(), out.clone());
        }
    }

    let history = state.history();
    ctx.history = match node.kind {
        NodeKind::Aggregator => history[history.len().saturating_sub(HISTORY_WINDOW)..].to_vec(),
        _ => history.to_vec(),
    };
    ctx.scratch = state.scratch().to_vec();
    ctx.cancel = cancel.child_token();
    ctx
}

fn check_score(
    out: AnalyzerOutput,
    range: Option<ScoreRange>,
) -> Result<AnalyzerOutput, AnalyzerError> {
    if let AnalyzerOutput::Scored(ref s) = out {
        if !s.score.is_finite() {
            return Err(AnalyzerError::MalformedOutput(format!(
                "score {} is not a finite number",
                s.score
            )));
        }
        if let Some(range) = range {
            if !range.contains(s.score) {
                return Err(AnalyzerError::MalformedOutput(format!(
                    "score {} outside {}",
                    s.score, range
                )));
            }
        }
    }
    Ok(out)
}

/// Execute tool calls strictly in order. Failures are recorded, never raised.
async fn run_tools(tools: &ToolRegistry, calls: Vec<ToolCall>) -> Vec<ToolResult> {
    let mut results = Vec::with_capacity(calls.len());
    for call in calls {
        let result = match tools.execute(&call.name, call.args.clone()).await {
            Ok(out) => ToolResult::success(&call, out.content),
            Err(e) => {
                warn!(tool = %call.name, call_id = %call.id, error = %e, "Tool call failed");
                ToolResult::failure(&call, e.to_string())
            }
        };
        results.push(result);
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::Capabilities;
    use crate::graph::{Edge, GraphBuilder};
    use vigil_core::error::ErrorKind;
    use vigil_core::types::{ConversationId, Proposal, StructuredResult};
    use vigil_test_utils::{
        FailingAnalyzer, FixedAnalyzer, FixedRouter, HangingAnalyzer, RecordingTool,
        ScriptedAnalyst,
    };

    fn fan_in_graph() -> CompiledGraph {
        GraphBuilder::new("fan_in")
            .node(Node::worker("a"))
            .node(Node::worker("b"))
            .node(Node::worker("c"))
            .node(Node::aggregator("g").with_capability("min"))
            .connect(START, "a")
            .connect(START, "b")
            .connect(START, "c")
            .connect("a", "g")
            .connect("b", "g")
            .connect("c", "g")
            .connect("g", END)
            .compile()
            .unwrap()
    }

    fn loop_graph() -> CompiledGraph {
        GraphBuilder::new("loop")
            .node(Node::worker("analyst"))
            .node(Node::router("route").with_capability("pending_tool_calls"))
            .node(Node::tool_executor("tools"))
            .connect(START, "analyst")
            .connect("analyst", "route")
            .edge(Edge::when("route", "tools", "call_tool"))
            .edge(Edge::when("route", END, "end"))
            .connect("tools", "analyst")
            .compile()
            .unwrap()
    }

    fn executor(caps: Capabilities) -> GraphExecutor {
        GraphExecutor::new(Arc::new(caps), ExecutorConfig::default())
    }

    fn state(id: &str) -> ConversationState {
        let mut state = ConversationState::new(ConversationId::from_str(id));
        state.append_turn(Turn::message("user", "hello"));
        state
    }

    #[tokio::test]
    async fn test_fan_in_takes_minimum() {
        let caps = Capabilities::with_builtins(Arc::new(ToolRegistry::new()))
            .with_analyzer(FixedAnalyzer::new("a", 0.9))
            .with_analyzer(FixedAnalyzer::new("b", 0.1))
            .with_analyzer(FixedAnalyzer::new("c", 0.0));

        let out = executor(caps)
            .run(&fan_in_graph(), ConversationState::new(ConversationId::from_str("room-1")))
            .await
            .unwrap();

        assert_eq!(out.score("g").map(|s| s.score), Some(0.0));
        assert_eq!(out.score("a").map(|s| s.score), Some(0.9));
        assert!(out.history().is_empty());
        assert_eq!(out.passes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_aggregator_waits_for_slowest_predecessor() {
        let judge = FixedAnalyzer::new("g", 5.0);
        let caps = Capabilities::new(Arc::new(ToolRegistry::new()))
            .with_analyzer(FixedAnalyzer::new("a", 0.5).with_delay(Duration::from_millis(300)))
            .with_analyzer(FixedAnalyzer::new("b", 0.5))
            .with_analyzer(FixedAnalyzer::new("c", 0.5).with_delay(Duration::from_millis(100)))
            .with_analyzer(judge.clone());

        let graph = GraphBuilder::new("fan_in")
            .node(Node::worker("a"))
            .node(Node::worker("b"))
            .node(Node::worker("c"))
            .node(Node::aggregator("g"))
            .connect(START, "a")
            .connect(START, "b")
            .connect(START, "c")
            .connect("a", "g")
            .connect("b", "g")
            .connect("c", "g")
            .connect("g", END)
            .compile()
            .unwrap();

        executor(caps).run(&graph, state("room-1")).await.unwrap();

        assert_eq!(judge.calls(), 1);
        let seen = judge.log().contexts();
        let inputs: Vec<&str> = seen[0].inputs.keys().map(String::as_str).collect();
        assert_eq!(inputs, vec!["a", "b", "c"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_cancels_siblings_and_skips_aggregator() {
        let judge = FixedAnalyzer::new("g", 5.0);
        let slow = HangingAnalyzer::new("a");
        let caps = Capabilities::new(Arc::new(ToolRegistry::new()))
            .with_analyzer(slow.clone())
            .with_analyzer(FailingAnalyzer::new("b", AnalyzerError::http(503, "unavailable")))
            .with_analyzer(FixedAnalyzer::new("c", 0.5))
            .with_analyzer(judge.clone());

        let graph = GraphBuilder::new("fan_in")
            .node(Node::worker("a"))
            .node(Node::worker("b"))
            .node(Node::worker("c"))
            .node(Node::aggregator("g"))
            .connect(START, "a")
            .connect(START, "b")
            .connect(START, "c")
            .connect("a", "g")
            .connect("b", "g")
            .connect("c", "g")
            .connect("g", END)
            .compile()
            .unwrap();

        let err = executor(caps).run(&graph, state("room-1")).await.unwrap_err();
        assert_eq!(err.node(), Some("b"));
        assert_eq!(err.kind(), ErrorKind::Analyzer);
        assert_eq!(slow.calls(), 1);
        assert_eq!(judge.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fails_node() {
        let caps = Capabilities::with_builtins(Arc::new(ToolRegistry::new()))
            .with_analyzer(HangingAnalyzer::new("a"))
            .with_analyzer(FixedAnalyzer::new("b", 0.1))
            .with_analyzer(FixedAnalyzer::new("c", 0.2));
        let exec = GraphExecutor::new(
            Arc::new(caps),
            ExecutorConfig {
                node_timeout: Duration::from_secs(2),
                max_loops: 10,
            },
        );

        let err = exec.run(&fan_in_graph(), state("room-1")).await.unwrap_err();
        match err {
            ExecutionError::NodeFailed { node, source } => {
                assert_eq!(node, "a");
                assert_eq!(source, AnalyzerError::Timeout { timeout_ms: 2000 });
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_score_out_of_range_is_malformed() {
        let caps = Capabilities::new(Arc::new(ToolRegistry::new()))
            .with_analyzer(FixedAnalyzer::new("a", 1.5))
            .with_analyzer(FixedAnalyzer::new("b", 2.0));
        let graph = GraphBuilder::new("range")
            .node(Node::worker("a").with_score_range(0.0, 1.0))
            .node(Node::worker("b"))
            .connect(START, "a")
            .connect("a", "b")
            .connect("b", END)
            .compile()
            .unwrap();

        let err = executor(caps).run(&graph, state("room-1")).await.unwrap_err();
        assert!(matches!(
            err,
            ExecutionError::NodeFailed { ref node, source: AnalyzerError::MalformedOutput(_) } if node == "a"
        ));
    }

    #[tokio::test]
    async fn test_missing_capability_reported_before_dispatch() {
        let a = FixedAnalyzer::new("a", 0.1);
        let caps = Capabilities::new(Arc::new(ToolRegistry::new())).with_analyzer(a.clone());
        let err = executor(caps).run(&fan_in_graph(), state("room-1")).await.unwrap_err();
        assert!(matches!(err, ExecutionError::MissingCapability { ref node, .. } if node == "b"));
        assert_eq!(a.calls(), 0);
    }

    #[tokio::test]
    async fn test_tool_loop_runs_once_and_finishes() {
        let tool = RecordingTool::new("flag");
        let mut registry = ToolRegistry::new();
        registry.register(tool.clone());

        let analyst = ScriptedAnalyst::new(
            "analyst",
            vec![Proposal::text("flagging r1")
                .with_call(ToolCall::from_json("flag", serde_json::json!({"id": "r1"})))],
            Proposal::text("Surveillance Clean"),
        );
        let caps = Capabilities::with_builtins(Arc::new(registry)).with_analyzer(analyst.clone());

        let out = executor(caps)
            .run(&loop_graph(), ConversationState::new(ConversationId::from_str("route-9")))
            .await
            .unwrap();

        assert_eq!(analyst.calls(), 2);
        assert_eq!(tool.calls(), 1);
        assert_eq!(tool.invocations()[0]["id"], "r1");
        assert_eq!(out.tool_results().count(), 1);
        assert_eq!(
            out.output("analyst").and_then(NodeOutput::as_proposal).map(|p| p.text.as_str()),
            Some("Surveillance Clean")
        );

        // Second analyst turn saw the tool result
        let second = &analyst.log().contexts()[1];
        assert!(second
            .scratch
            .iter()
            .any(|m| matches!(m, ControlMessage::ToolResult(r) if !r.is_error)));
    }

    #[tokio::test]
    async fn test_loop_limit_is_exact() {
        let tool = RecordingTool::new("flag");
        let mut registry = ToolRegistry::new();
        registry.register(tool.clone());
        let analyst = ScriptedAnalyst::always_requesting("analyst", "flag", serde_json::json!({"id": "r1"}));
        let caps = Capabilities::with_builtins(Arc::new(registry)).with_analyzer(analyst.clone());
        let exec = GraphExecutor::new(
            Arc::new(caps),
            ExecutorConfig {
                node_timeout: Duration::from_secs(30),
                max_loops: 3,
            },
        );

        let err = exec.run(&loop_graph(), state("route-9")).await.unwrap_err();
        assert!(matches!(
            err,
            ExecutionError::LoopLimitExceeded { ref node, limit: 3 } if node == "tools"
        ));
        assert_eq!(tool.calls(), 3);
        assert_eq!(analyst.calls(), 4);
    }

    #[tokio::test]
    async fn test_unknown_tool_fails_closed() {
        let analyst = ScriptedAnalyst::new(
            "analyst",
            vec![Proposal::text("try")
                .with_call(ToolCall::from_json("missing", serde_json::json!({})))
                .with_call(ToolCall::from_json("flag", serde_json::json!({"id": "r2"})))],
            Proposal::text("done"),
        );
        let tool = RecordingTool::new("flag");
        let mut registry = ToolRegistry::new();
        registry.register(tool.clone());
        let caps = Capabilities::with_builtins(Arc::new(registry)).with_analyzer(analyst);

        let out = executor(caps).run(&loop_graph(), state("route-9")).await.unwrap();
        let results: Vec<&ToolResult> = out.tool_results().collect();
        assert_eq!(results.len(), 2);
        assert!(results[0].is_error);
        assert_eq!(results[0].tool, "missing");
        assert!(!results[1].is_error);
        assert_eq!(tool.calls(), 1);
    }

    #[tokio::test]
    async fn test_unmatched_decision_is_routing_error() {
        let caps = Capabilities::new(Arc::new(ToolRegistry::new()))
            .with_analyzer(ScriptedAnalyst::new("analyst", vec![], Proposal::text("x")))
            .with_router(FixedRouter::new("pending_tool_calls", "maybe"));

        let err = executor(caps).run(&loop_graph(), state("route-9")).await.unwrap_err();
        match err {
            ExecutionError::Routing { node, decision } => {
                assert_eq!(node, "route");
                assert_eq!(decision, "maybe");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_aggregator_sees_recent_window() {
        let judge = FixedAnalyzer::new("g", 1.0);
        let caps = Capabilities::new(Arc::new(ToolRegistry::new()))
            .with_analyzer(FixedAnalyzer::new("a", 0.1))
            .with_analyzer(FixedAnalyzer::new("b", 0.1))
            .with_analyzer(FixedAnalyzer::new("c", 0.1))
            .with_analyzer(judge.clone());
        let graph = GraphBuilder::new("fan_in")
            .node(Node::worker("a"))
            .node(Node::worker("b"))
            .node(Node::worker("c"))
            .node(Node::aggregator("g"))
            .connect(START, "a")
            .connect(START, "b")
            .connect(START, "c")
            .connect("a", "g")
            .connect("b", "g")
            .connect("c", "g")
            .connect("g", END)
            .compile()
            .unwrap();

        let mut st = ConversationState::new(ConversationId::from_str("room-1"));
        for i in 0..15 {
            st.append_turn(Turn::message("user", format!("msg {}", i)));
        }
        executor(caps).run(&graph, st).await.unwrap();

        let ctx = &judge.log().contexts()[0];
        assert_eq!(ctx.history.len(), HISTORY_WINDOW);
        assert_eq!(ctx.latest_message(), Some("msg 14"));
    }

    #[tokio::test]
    async fn test_events_published_in_order() {
        let bus = Arc::new(EventBus::new(64));
        let mut rx = bus.subscribe();
        let caps = Capabilities::with_builtins(Arc::new(ToolRegistry::new()))
            .with_analyzer(FixedAnalyzer::new("a", 0.9))
            .with_analyzer(FixedAnalyzer::new("b", 0.1))
            .with_analyzer(FixedAnalyzer::new("c", 0.0));
        let exec = executor(caps).with_event_bus(bus);

        exec.run(&fan_in_graph(), state("room-1")).await.unwrap();

        let first = rx.recv().await.unwrap();
        assert!(matches!(first, GraphEvent::RunStarted { ref graph, .. } if graph == "fan_in"));
        let mut last = first;
        while let Ok(event) = rx.try_recv() {
            last = event;
        }
        assert!(matches!(last, GraphEvent::RunComplete { .. }));
    }

    #[test]
    fn test_check_score() {
        let scored = |s| AnalyzerOutput::Scored(StructuredResult::new(s, "x"));
        assert!(check_score(scored(0.5), Some(ScoreRange::UNIT)).is_ok());
        assert!(check_score(scored(7.0), None).is_ok());
        assert!(check_score(scored(f64::NAN), None).is_err());
        assert!(check_score(scored(11.0), Some(ScoreRange::new(1.0, 10.0))).is_err());
    }
}
