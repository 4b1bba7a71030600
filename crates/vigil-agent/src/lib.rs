pub mod capabilities;
pub mod graph;
pub mod lane;
pub mod orchestrator;
pub mod pipelines;

pub use capabilities::{Capabilities, PendingToolCalls, Reduce, ScoreReducer};
pub use graph::{
    CompiledGraph, Edge, ExecutorConfig, GraphBuilder, GraphExecutor, GraphSpec, Guard, Node,
    NodeKind, END, START,
};
pub use lane::{LaneGuard, LaneManager};
pub use orchestrator::{MergedResult, Orchestrator, RunOutcome};
