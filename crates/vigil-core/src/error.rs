use std::fmt;

use thiserror::Error;

/// The structural rule a graph declaration violated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValidationRule {
    /// Exactly one entry point, with at least one outgoing edge.
    EntryPoint,
    /// Every node reachable from the entry point.
    Reachability,
    /// Cycles must pass through a guarded router edge.
    GuardedCycle,
    /// Every non-entry node has a predecessor.
    Predecessor,
    /// Per-kind edge arity (routers branch, aggregators join, ...).
    KindArity,
    /// Node identities and edge endpoints resolve.
    Reference,
    /// Guards are well-formed, mutually exclusive, and only on router edges.
    Guard,
    /// The terminal node is targeted by at least one edge.
    Terminal,
}

impl fmt::Display for ValidationRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::EntryPoint => "entry-point",
            Self::Reachability => "reachability",
            Self::GuardedCycle => "guarded-cycle",
            Self::Predecessor => "predecessor",
            Self::KindArity => "kind-arity",
            Self::Reference => "reference",
            Self::Guard => "guard",
            Self::Terminal => "terminal",
        };
        f.write_str(name)
    }
}

/// Compile-time graph errors. Never produced while a run is in flight.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum GraphValidationError {
    #[error("graph has no entry point: no edge leaves START")]
    MissingEntry,

    #[error("START must not have predecessors (edge from '{from}')")]
    EntryHasPredecessor { from: String },

    #[error("reserved identifier used as a node id: {0}")]
    ReservedId(String),

    #[error("duplicate node id: {0}")]
    DuplicateNode(String),

    #[error("edge {from} -> {to} references unknown node '{missing}'")]
    UnknownNode {
        from: String,
        to: String,
        missing: String,
    },

    #[error("node '{0}' is not reachable from START")]
    Unreachable(String),

    #[error("node '{0}' has no predecessor")]
    NoPredecessor(String),

    #[error("cycle does not pass through a guarded router edge: {}", .nodes.join(" -> "))]
    UnguardedCycle { nodes: Vec<String> },

    #[error("{kind} node '{node}' {requirement}")]
    Arity {
        node: String,
        kind: String,
        requirement: String,
    },

    #[error("edge {from} -> {to}: {reason}")]
    InvalidGuard {
        from: String,
        to: String,
        reason: String,
    },

    #[error("graph has no terminal: no edge targets END")]
    MissingTerminal,
}

impl GraphValidationError {
    /// The rule this error reports.
    pub fn rule(&self) -> ValidationRule {
        match self {
            Self::MissingEntry | Self::EntryHasPredecessor { .. } => ValidationRule::EntryPoint,
            Self::ReservedId(_) | Self::DuplicateNode(_) | Self::UnknownNode { .. } => {
                ValidationRule::Reference
            }
            Self::Unreachable(_) => ValidationRule::Reachability,
            Self::NoPredecessor(_) => ValidationRule::Predecessor,
            Self::UnguardedCycle { .. } => ValidationRule::GuardedCycle,
            Self::Arity { .. } => ValidationRule::KindArity,
            Self::InvalidGuard { .. } => ValidationRule::Guard,
            Self::MissingTerminal => ValidationRule::Terminal,
        }
    }
}

/// Failures of an external analyzer (or router) capability.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum AnalyzerError {
    #[error("analyzer timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("malformed analyzer output: {0}")]
    MalformedOutput(String),

    /// `status` is the HTTP status when the upstream answered, `None` when
    /// it could not be reached.
    #[error("analyzer upstream unavailable: {message}")]
    Unavailable { status: Option<u16>, message: String },

    #[error("analyzer call cancelled")]
    Cancelled,
}

impl AnalyzerError {
    /// The upstream answered with a non-success status.
    pub fn http(status: u16, body: impl Into<String>) -> Self {
        Self::Unavailable {
            status: Some(status),
            message: format!("HTTP {}: {}", status, body.into()),
        }
    }

    /// The upstream could not be reached at all.
    pub fn unreachable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            status: None,
            message: message.into(),
        }
    }
}

/// Failures of an external tool capability. Recorded, never fatal to a run.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("invalid arguments for {tool}: {message}")]
    InvalidArguments { tool: String, message: String },

    #[error("tool call failed: {tool}: {message}")]
    CallFailed { tool: String, message: String },
}

/// State store failures.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),

    #[error("state serialization error: {0}")]
    Serialization(String),
}

/// Coarse classification of a terminal run error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Analyzer,
    Routing,
    LoopLimit,
    Store,
    Busy,
    Internal,
}

/// Terminal run-time error. A run returns either a full state or exactly one of these.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("node '{node}' failed: {source}")]
    NodeFailed {
        node: String,
        #[source]
        source: AnalyzerError,
    },

    #[error("router '{node}' decision '{decision}' matched no outgoing guard")]
    Routing { node: String, decision: String },

    #[error("node '{node}' exceeded the tool loop limit of {limit}")]
    LoopLimitExceeded { node: String, limit: usize },

    #[error("no {role} capability registered as '{capability}' (node '{node}')")]
    MissingCapability {
        node: String,
        role: String,
        capability: String,
    },

    #[error("output slot for '{node}' already written in this pass")]
    SlotOccupied { node: String },

    #[error("run stalled before reaching END; waiting on: {}", .pending.join(", "))]
    Stalled { pending: Vec<String> },

    #[error("node '{node}' task aborted: {message}")]
    Aborted { node: String, message: String },

    #[error("conversation '{conversation}' already has a run in flight")]
    Busy { conversation: String },

    #[error("state store error: {0}")]
    Store(#[from] StoreError),
}

impl ExecutionError {
    /// Identity of the node the run failed at, when there is one.
    pub fn node(&self) -> Option<&str> {
        match self {
            Self::NodeFailed { node, .. }
            | Self::Routing { node, .. }
            | Self::LoopLimitExceeded { node, .. }
            | Self::MissingCapability { node, .. }
            | Self::SlotOccupied { node }
            | Self::Aborted { node, .. } => Some(node),
            Self::Stalled { .. } | Self::Busy { .. } | Self::Store(_) => None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NodeFailed { .. } => ErrorKind::Analyzer,
            Self::Routing { .. } => ErrorKind::Routing,
            Self::LoopLimitExceeded { .. } => ErrorKind::LoopLimit,
            Self::Store(_) => ErrorKind::Store,
            Self::Busy { .. } => ErrorKind::Busy,
            Self::MissingCapability { .. }
            | Self::SlotOccupied { .. }
            | Self::Stalled { .. }
            | Self::Aborted { .. } => ErrorKind::Internal,
        }
    }
}

#[derive(Debug, Error)]
pub enum VigilError {
    #[error("Graph validation failed ({rule}): {0}", rule = .0.rule())]
    Validation(#[from] GraphValidationError),

    #[error("Run failed: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    #[error("Analyzer error: {0}")]
    Analyzer(#[from] AnalyzerError),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, VigilError>;
