//! Graph model: declarations, compilation, and execution.
//!
//! A pipeline is declared as `Node`s connected by `Edge`s between the virtual
//! `START` and `END` markers. `GraphSpec::compile` validates the declaration and
//! produces an immutable `CompiledGraph` that any number of runs may share.
//!
//! The `GraphExecutor` drives one pass over a compiled graph: every node whose
//! incoming edges have all fired is dispatched concurrently, routers pick one
//! outgoing edge by guard, and back edges re-enter a loop after clearing the
//! output slots downstream of the loop point.

pub mod compiler;
pub mod edge;
pub mod executor;
pub mod node;

pub use compiler::{CompiledEdge, CompiledGraph, GraphBuilder, GraphSpec};
pub use edge::{Edge, Guard};
pub use executor::{ExecutorConfig, GraphExecutor};
pub use node::{Node, NodeKind};

/// Virtual entry marker. Never a real node.
pub const START: &str = "START";

/// Virtual terminal marker. Never a real node.
pub const END: &str = "END";

/// Whether an identifier is one of the virtual markers.
pub fn is_reserved(id: &str) -> bool {
    id == START || id == END
}
