//! Built-in pipelines.

use vigil_core::error::GraphValidationError;

use crate::capabilities::{CALL_TOOL, FINISH};
use crate::graph::{CompiledGraph, Edge, GraphBuilder, GraphSpec, Node, END, START};

/// Names accepted by [`preset`].
pub const PRESETS: &[&str] = &["triage", "surveillance"];

/// Conversation triage: three independent analyzers score the latest message
/// in [0, 1] and a judge folds them into a final score in [1, 10].
pub fn triage_spec() -> GraphSpec {
    let analyzers = ["analyze_sentiment", "analyze_urgency", "analyze_severity"];

    let mut builder = GraphBuilder::new("triage");
    for id in analyzers {
        builder = builder
            .node(Node::worker(id).with_score_range(0.0, 1.0))
            .connect(START, id)
            .connect(id, "final_judge");
    }
    builder
        .node(Node::aggregator("final_judge").with_score_range(1.0, 10.0))
        .connect("final_judge", END)
        .build()
}

pub fn triage() -> Result<CompiledGraph, GraphValidationError> {
    triage_spec().compile()
}

/// Route surveillance: an analyst inspects sensor readings and may flag
/// routes; flagged batches run through the tool executor and back to the
/// analyst until it stops requesting actions.
pub fn surveillance_spec() -> GraphSpec {
    GraphBuilder::new("surveillance")
        .node(Node::worker("analyst"))
        .node(Node::router("route").with_capability("pending_tool_calls"))
        .node(Node::tool_executor("tools"))
        .connect(START, "analyst")
        .connect("analyst", "route")
        .edge(Edge::when("route", "tools", CALL_TOOL))
        .edge(Edge::when("route", END, FINISH))
        .connect("tools", "analyst")
        .build()
}

pub fn surveillance() -> Result<CompiledGraph, GraphValidationError> {
    surveillance_spec().compile()
}

/// Look up a built-in pipeline declaration by name.
pub fn preset(name: &str) -> Option<GraphSpec> {
    match name {
        "triage" => Some(triage_spec()),
        "surveillance" => Some(surveillance_spec()),
        _ => None,
    }
}
