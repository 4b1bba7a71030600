use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use vigil_core::error::{GraphValidationError, VigilError};

use super::edge::{CompiledGuard, Edge, Guard};
use super::node::{Node, NodeKind};
use super::{is_reserved, END, START};

/// A graph declaration: nodes plus the edges between them and the
/// `START`/`END` markers. Deserializable from TOML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphSpec {
    pub name: String,
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

impl GraphSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: vec![],
            edges: vec![],
        }
    }

    /// Parse a declaration from TOML text.
    pub fn from_toml(text: &str) -> vigil_core::Result<Self> {
        toml::from_str(text).map_err(|e| VigilError::Config(format!("invalid graph declaration: {}", e)))
    }

    /// Load a declaration from a TOML file.
    pub fn load(path: &Path) -> vigil_core::Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|_| VigilError::ConfigNotFound(path.display().to_string()))?;
        Self::from_toml(&text)
    }

    /// Validate and compile. Pure: the same declaration always yields an
    /// equivalent graph.
    pub fn compile(&self) -> Result<CompiledGraph, GraphValidationError> {
        compile(self)
    }
}

/// Fluent construction of a [`GraphSpec`].
pub struct GraphBuilder {
    spec: GraphSpec,
}

impl GraphBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            spec: GraphSpec::new(name),
        }
    }

    pub fn node(mut self, node: Node) -> Self {
        self.spec.nodes.push(node);
        self
    }

    pub fn edge(mut self, edge: Edge) -> Self {
        self.spec.edges.push(edge);
        self
    }

    /// Unconditional edge shorthand.
    pub fn connect(self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.edge(Edge::always(from, to))
    }

    pub fn build(self) -> GraphSpec {
        self.spec
    }

    pub fn compile(self) -> Result<CompiledGraph, GraphValidationError> {
        self.spec.compile()
    }
}

/// A validated edge.
#[derive(Debug, Clone)]
pub struct CompiledEdge {
    pub from: String,
    pub to: String,
    pub guard: Option<Guard>,
    /// Closes a cycle; traversing it re-enters a loop.
    pub back: bool,
    matcher: Option<CompiledGuard>,
}

impl CompiledEdge {
    /// Whether a router following this edge accepts `decision`.
    pub fn accepts(&self, decision: &str) -> bool {
        self.matcher.as_ref().map_or(true, |g| g.matches(decision))
    }
}

/// Immutable, validated graph. Shared read-only by every run.
#[derive(Debug, Clone)]
pub struct CompiledGraph {
    name: String,
    nodes: Vec<Node>,
    index: HashMap<String, usize>,
    edges: Vec<CompiledEdge>,
    /// Edge indices by source, in declaration order. Includes `START`.
    outgoing: HashMap<String, Vec<usize>>,
    /// Forward (non-back) edge indices by target. Includes `END`.
    incoming: HashMap<String, Vec<usize>>,
    /// For each loop target, every node forward-reachable from it (itself included).
    downstream: HashMap<String, BTreeSet<String>>,
    /// Real nodes in topological order of the forward edges.
    order: Vec<String>,
}

const NO_EDGES: &[usize] = &[];

impl CompiledGraph {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Nodes in declaration order.
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }

    pub fn edges(&self) -> &[CompiledEdge] {
        &self.edges
    }

    pub fn edge(&self, index: usize) -> &CompiledEdge {
        &self.edges[index]
    }

    /// Outgoing edge indices of a node (or `START`), in declaration order.
    pub fn outgoing(&self, id: &str) -> &[usize] {
        self.outgoing.get(id).map_or(NO_EDGES, Vec::as_slice)
    }

    /// Incoming forward edge indices of a node (or `END`).
    pub fn incoming(&self, id: &str) -> &[usize] {
        self.incoming.get(id).map_or(NO_EDGES, Vec::as_slice)
    }

    /// Forward predecessors of a node, in edge declaration order.
    pub fn predecessors(&self, id: &str) -> Vec<&str> {
        self.incoming(id)
            .iter()
            .map(|&i| self.edges[i].from.as_str())
            .collect()
    }

    /// Slots cleared when a loop re-enters `target`.
    pub fn downstream(&self, target: &str) -> Option<&BTreeSet<String>> {
        self.downstream.get(target)
    }

    pub fn back_edges(&self) -> impl Iterator<Item = &CompiledEdge> {
        self.edges.iter().filter(|e| e.back)
    }

    /// Topological order of the forward edges.
    pub fn order(&self) -> &[String] {
        &self.order
    }

    /// Nodes that own an output slot.
    pub fn slot_ids(&self) -> impl Iterator<Item = &str> {
        self.nodes
            .iter()
            .filter(|n| n.kind.has_slot())
            .map(|n| n.id.as_str())
    }

    /// Nodes whose output is the pass result: the direct predecessors of `END`,
    /// looking through routers to what they routed on.
    pub fn result_nodes(&self) -> Vec<&str> {
        let mut result = Vec::new();
        let mut queue: VecDeque<&str> = self.predecessors(END).into_iter().collect();
        let mut seen = BTreeSet::new();

        while let Some(id) = queue.pop_front() {
            if !seen.insert(id) || id == START {
                continue;
            }
            match self.node(id).map(|n| n.kind) {
                Some(NodeKind::Router) => queue.extend(self.predecessors(id)),
                Some(_) => result.push(id),
                None => {}
            }
        }
        result
    }
}

impl fmt::Display for CompiledGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "graph {} ({} nodes, {} edges)",
            self.name,
            self.nodes.len(),
            self.edges.len()
        )?;
        for id in &self.order {
            if let Some(node) = self.node(id) {
                writeln!(f, "  [{}] {} -> {}", node.kind, node.id, node.capability())?;
            }
        }
        for edge in &self.edges {
            write!(f, "  {} -> {}", edge.from, edge.to)?;
            if let Some(ref guard) = edge.guard {
                write!(f, " when {}", guard)?;
            }
            if edge.back {
                write!(f, " (loop)")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

fn compile(spec: &GraphSpec) -> Result<CompiledGraph, GraphValidationError> {
    // Node identities and edge endpoints
    let mut index = HashMap::new();
    for (i, node) in spec.nodes.iter().enumerate() {
        if is_reserved(&node.id) {
            return Err(GraphValidationError::ReservedId(node.id.clone()));
        }
        if index.insert(node.id.clone(), i).is_some() {
            return Err(GraphValidationError::DuplicateNode(node.id.clone()));
        }
    }
    for edge in &spec.edges {
        for end in [&edge.from, &edge.to] {
            if !is_reserved(end) && !index.contains_key(end) {
                return Err(GraphValidationError::UnknownNode {
                    from: edge.from.clone(),
                    to: edge.to.clone(),
                    missing: end.clone(),
                });
            }
        }
    }

    // Entry point
    if let Some(edge) = spec.edges.iter().find(|e| e.to == START) {
        return Err(GraphValidationError::EntryHasPredecessor {
            from: edge.from.clone(),
        });
    }
    if !spec.edges.iter().any(|e| e.from == START) {
        return Err(GraphValidationError::MissingEntry);
    }

    // Terminal
    if spec.edges.iter().any(|e| e.from == END) {
        return Err(GraphValidationError::Arity {
            node: END.to_string(),
            kind: "terminal".to_string(),
            requirement: "must not have outgoing edges".to_string(),
        });
    }
    if !spec.edges.iter().any(|e| e.to == END) {
        return Err(GraphValidationError::MissingTerminal);
    }

    let kind_of = |id: &str| index.get(id).map(|&i| spec.nodes[i].kind);
    let matchers = compile_guards(spec, &kind_of)?;

    let mut outgoing: HashMap<String, Vec<usize>> = HashMap::new();
    for (i, edge) in spec.edges.iter().enumerate() {
        outgoing.entry(edge.from.clone()).or_default().push(i);
    }

    // Predecessors
    for node in &spec.nodes {
        if !spec.edges.iter().any(|e| e.to == node.id) {
            return Err(GraphValidationError::NoPredecessor(node.id.clone()));
        }
    }

    // Reachability and loop classification
    let mut dfs = Dfs::new(&spec.edges, &outgoing);
    dfs.visit(START);
    for node in &spec.nodes {
        if !dfs.visited(&node.id) {
            return Err(GraphValidationError::Unreachable(node.id.clone()));
        }
    }
    let back = dfs.back;

    // Every cycle must pass an edge whose guard can reject
    let roots = std::iter::once(START).chain(spec.nodes.iter().map(|n| n.id.as_str()));
    if let Some(nodes) = CycleSearch::new(&spec.edges, &matchers, &outgoing).find(roots) {
        return Err(GraphValidationError::UnguardedCycle { nodes });
    }

    let mut incoming: HashMap<String, Vec<usize>> = HashMap::new();
    for (i, edge) in spec.edges.iter().enumerate() {
        if !back[i] {
            incoming.entry(edge.to.clone()).or_default().push(i);
        }
    }

    check_arity(spec, &outgoing, &incoming)?;

    let edges: Vec<CompiledEdge> = spec
        .edges
        .iter()
        .zip(matchers)
        .zip(back.iter().copied())
        .map(|((edge, matcher), back)| CompiledEdge {
            from: edge.from.clone(),
            to: edge.to.clone(),
            guard: edge.guard.clone(),
            back,
            matcher,
        })
        .collect();

    let order = topological_order(&edges, &outgoing, &incoming);

    let mut downstream = HashMap::new();
    for edge in edges.iter().filter(|e| e.back) {
        downstream
            .entry(edge.to.clone())
            .or_insert_with(|| forward_reachable(&edge.to, &edges, &outgoing));
    }

    debug!(
        graph = %spec.name,
        nodes = spec.nodes.len(),
        edges = edges.len(),
        loops = downstream.len(),
        "Graph compiled"
    );

    Ok(CompiledGraph {
        name: spec.name.clone(),
        nodes: spec.nodes.clone(),
        index,
        edges,
        outgoing,
        incoming,
        downstream,
        order,
    })
}

/// Guards only on router edges, every router edge guarded, and no two
/// branches of one router accepting the same literal decision.
fn compile_guards(
    spec: &GraphSpec,
    kind_of: &impl Fn(&str) -> Option<NodeKind>,
) -> Result<Vec<Option<CompiledGuard>>, GraphValidationError> {
    let invalid = |edge: &Edge, reason: String| GraphValidationError::InvalidGuard {
        from: edge.from.clone(),
        to: edge.to.clone(),
        reason,
    };

    let mut matchers = Vec::with_capacity(spec.edges.len());
    let mut claimed: HashMap<(&str, String), &Edge> = HashMap::new();

    for edge in &spec.edges {
        let is_router = kind_of(&edge.from) == Some(NodeKind::Router);
        match (&edge.guard, is_router) {
            (None, false) => matchers.push(None),
            (None, true) => {
                return Err(invalid(edge, "router edges must carry a guard".to_string()));
            }
            (Some(_), false) => {
                return Err(invalid(edge, "only router edges may carry a guard".to_string()));
            }
            (Some(guard), true) => {
                let compiled = guard.compile().map_err(|reason| invalid(edge, reason))?;
                if let Some(literals) = compiled.literals() {
                    for value in literals {
                        if let Some(other) = claimed.insert((edge.from.as_str(), value.to_string()), edge) {
                            return Err(invalid(
                                edge,
                                format!(
                                    "decision '{}' is also accepted by {} -> {}",
                                    value, other.from, other.to
                                ),
                            ));
                        }
                    }
                }
                matchers.push(Some(compiled));
            }
        }
    }
    Ok(matchers)
}

fn check_arity(
    spec: &GraphSpec,
    outgoing: &HashMap<String, Vec<usize>>,
    incoming: &HashMap<String, Vec<usize>>,
) -> Result<(), GraphValidationError> {
    let count = |map: &HashMap<String, Vec<usize>>, id: &str| map.get(id).map_or(0, Vec::len);
    let arity = |id: &str, kind: String, requirement: &str| GraphValidationError::Arity {
        node: id.to_string(),
        kind,
        requirement: requirement.to_string(),
    };

    for node in &spec.nodes {
        let out = count(outgoing, &node.id);
        let preds = count(incoming, &node.id);
        let kind = node.kind.to_string();

        match node.kind {
            NodeKind::IndependentWorker => {
                if preds != 1 {
                    return Err(arity(
                        &node.id,
                        kind,
                        "must have exactly one forward predecessor (join with an aggregator)",
                    ));
                }
                if out == 0 {
                    return Err(arity(&node.id, kind, "must have at least one outgoing edge"));
                }
            }
            NodeKind::Aggregator => {
                if preds < 2 {
                    return Err(arity(&node.id, kind, "must join at least two predecessors"));
                }
                if out == 0 {
                    return Err(arity(&node.id, kind, "must have at least one outgoing edge"));
                }
            }
            NodeKind::Router => {
                if out < 2 {
                    return Err(arity(&node.id, kind, "must have at least two outgoing edges"));
                }
            }
            NodeKind::ToolExecutor => {
                if out != 1 {
                    return Err(arity(&node.id, kind, "must have exactly one outgoing edge"));
                }
            }
        }
    }

    // A router branch target runs only when that branch is taken, so it
    // cannot also wait on other predecessors.
    let targets = spec
        .nodes
        .iter()
        .map(|n| (n.id.as_str(), n.kind.to_string()))
        .chain(std::iter::once((END, "terminal".to_string())));
    for (id, kind) in targets {
        let edges = incoming.get(id).map_or(NO_EDGES, Vec::as_slice);
        let guarded = edges.iter().any(|&i| spec.edges[i].guard.is_some());
        if guarded && edges.len() > 1 {
            return Err(arity(
                id,
                kind,
                "is the target of a router branch and must have no other predecessor",
            ));
        }
    }

    Ok(())
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    Open,
    Done,
}

/// Depth-first walk from `START` in declaration order. Edges that reach a
/// node still on the stack close a cycle and are marked as back edges.
struct Dfs<'a> {
    edges: &'a [Edge],
    outgoing: &'a HashMap<String, Vec<usize>>,
    color: HashMap<&'a str, Color>,
    back: Vec<bool>,
}

impl<'a> Dfs<'a> {
    fn new(edges: &'a [Edge], outgoing: &'a HashMap<String, Vec<usize>>) -> Self {
        Self {
            edges,
            outgoing,
            color: HashMap::new(),
            back: vec![false; edges.len()],
        }
    }

    fn visited(&self, id: &str) -> bool {
        self.color.contains_key(id)
    }

    fn visit(&mut self, node: &'a str) {
        let edges: &'a [Edge] = self.edges;
        let outgoing: &'a HashMap<String, Vec<usize>> = self.outgoing;

        self.color.insert(node, Color::Open);
        for &ei in outgoing.get(node).map_or(NO_EDGES, Vec::as_slice) {
            let to = edges[ei].to.as_str();
            match self.color.get(to).copied() {
                None => self.visit(to),
                Some(Color::Open) => self.back[ei] = true,
                Some(Color::Done) => {}
            }
        }
        self.color.insert(node, Color::Done);
    }
}

/// Searches the subgraph of edges that can always be taken for a cycle.
/// An edge blocks a cycle only when its guard can reject some decision.
struct CycleSearch<'a> {
    edges: &'a [Edge],
    matchers: &'a [Option<CompiledGuard>],
    outgoing: &'a HashMap<String, Vec<usize>>,
    color: HashMap<&'a str, Color>,
    path: Vec<&'a str>,
}

impl<'a> CycleSearch<'a> {
    fn new(
        edges: &'a [Edge],
        matchers: &'a [Option<CompiledGuard>],
        outgoing: &'a HashMap<String, Vec<usize>>,
    ) -> Self {
        Self {
            edges,
            matchers,
            outgoing,
            color: HashMap::new(),
            path: vec![],
        }
    }

    fn passable(&self, ei: usize) -> bool {
        self.matchers[ei]
            .as_ref()
            .map_or(true, CompiledGuard::accepts_everything)
    }

    /// First unguarded cycle, as the node path that closes it.
    fn find<I>(mut self, roots: I) -> Option<Vec<String>>
    where
        I: IntoIterator<Item = &'a str>,
    {
        for root in roots {
            if !self.color.contains_key(root) {
                if let Some(cycle) = self.visit(root) {
                    return Some(cycle);
                }
            }
        }
        None
    }

    fn visit(&mut self, node: &'a str) -> Option<Vec<String>> {
        let edges: &'a [Edge] = self.edges;
        let outgoing: &'a HashMap<String, Vec<usize>> = self.outgoing;

        self.color.insert(node, Color::Open);
        self.path.push(node);

        for &ei in outgoing.get(node).map_or(NO_EDGES, Vec::as_slice) {
            if !self.passable(ei) {
                continue;
            }
            let to = edges[ei].to.as_str();
            match self.color.get(to).copied() {
                None => {
                    if let Some(cycle) = self.visit(to) {
                        return Some(cycle);
                    }
                }
                Some(Color::Open) => {
                    let pos = self.path.iter().position(|n| *n == to).unwrap_or(0);
                    let mut nodes: Vec<String> =
                        self.path[pos..].iter().map(|s| s.to_string()).collect();
                    nodes.push(to.to_string());
                    return Some(nodes);
                }
                Some(Color::Done) => {}
            }
        }

        self.path.pop();
        self.color.insert(node, Color::Done);
        None
    }
}

/// Kahn's algorithm over the forward edges, seeded from `START`.
fn topological_order(
    edges: &[CompiledEdge],
    outgoing: &HashMap<String, Vec<usize>>,
    incoming: &HashMap<String, Vec<usize>>,
) -> Vec<String> {
    let mut remaining: HashMap<&str, usize> = incoming
        .iter()
        .map(|(id, preds)| (id.as_str(), preds.len()))
        .collect();
    let mut queue = VecDeque::from([START]);
    let mut order = Vec::new();

    while let Some(id) = queue.pop_front() {
        if !is_reserved(id) {
            order.push(id.to_string());
        }
        for &ei in outgoing.get(id).map_or(NO_EDGES, Vec::as_slice) {
            let edge = &edges[ei];
            if edge.back {
                continue;
            }
            if let Some(n) = remaining.get_mut(edge.to.as_str()) {
                *n -= 1;
                if *n == 0 {
                    queue.push_back(edge.to.as_str());
                }
            }
        }
    }
    order
}

fn forward_reachable(
    from: &str,
    edges: &[CompiledEdge],
    outgoing: &HashMap<String, Vec<usize>>,
) -> BTreeSet<String> {
    let mut seen = BTreeSet::new();
    let mut queue = VecDeque::from([from.to_string()]);
    while let Some(id) = queue.pop_front() {
        if !seen.insert(id.clone()) {
            continue;
        }
        for &ei in outgoing.get(&id).map_or(NO_EDGES, Vec::as_slice) {
            if !edges[ei].back {
                queue.push_back(edges[ei].to.clone());
            }
        }
    }
    seen
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_core::error::ValidationRule;

    fn fan_in() -> GraphBuilder {
        GraphBuilder::new("fan_in")
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
    }

    fn tool_loop() -> GraphBuilder {
        GraphBuilder::new("tool_loop")
            .node(Node::worker("analyst"))
            .node(Node::router("route"))
            .node(Node::tool_executor("tools"))
            .connect(START, "analyst")
            .connect("analyst", "route")
            .edge(Edge::when("route", "tools", "call_tool"))
            .edge(Edge::when("route", END, "end"))
            .connect("tools", "analyst")
    }

    fn rule_of(builder: GraphBuilder) -> ValidationRule {
        builder.compile().unwrap_err().rule()
    }

    #[test]
    fn test_fan_in_compiles() {
        let graph = fan_in().compile().unwrap();
        assert_eq!(graph.order(), &["a", "b", "c", "g"]);
        assert_eq!(graph.predecessors("g"), vec!["a", "b", "c"]);
        assert_eq!(graph.predecessors(END), vec!["g"]);
        assert_eq!(graph.back_edges().count(), 0);
        assert_eq!(graph.result_nodes(), vec!["g"]);
        assert_eq!(graph.slot_ids().count(), 4);
    }

    #[test]
    fn test_tool_loop_compiles_with_back_edge() {
        let graph = tool_loop().compile().unwrap();
        let back: Vec<_> = graph.back_edges().map(|e| (e.from.as_str(), e.to.as_str())).collect();
        assert_eq!(back, vec![("tools", "analyst")]);

        let downstream = graph.downstream("analyst").unwrap();
        assert!(downstream.contains("analyst"));
        assert!(downstream.contains("route"));
        assert!(downstream.contains("tools"));

        // Looking through the router to what it routed on
        assert_eq!(graph.result_nodes(), vec!["analyst"]);
        assert_eq!(graph.predecessors("analyst"), vec![START]);
    }

    #[test]
    fn test_compile_is_deterministic() {
        let a = tool_loop().compile().unwrap();
        let b = tool_loop().compile().unwrap();
        assert_eq!(a.to_string(), b.to_string());
        assert!(a.to_string().contains("tools -> analyst (loop)"));
    }

    #[test]
    fn test_missing_entry() {
        let err = GraphBuilder::new("g")
            .node(Node::worker("a"))
            .connect("a", END)
            .compile()
            .unwrap_err();
        assert_eq!(err, GraphValidationError::MissingEntry);
        assert_eq!(err.rule(), ValidationRule::EntryPoint);
    }

    #[test]
    fn test_entry_with_predecessor() {
        let b = fan_in().connect("g", START);
        assert_eq!(rule_of(b), ValidationRule::EntryPoint);
    }

    #[test]
    fn test_reference_errors() {
        let b = fan_in().node(Node::worker("a"));
        assert_eq!(b.compile().unwrap_err(), GraphValidationError::DuplicateNode("a".into()));

        let b = fan_in().connect("g", "ghost");
        assert!(matches!(
            b.compile().unwrap_err(),
            GraphValidationError::UnknownNode { ref missing, .. } if missing == "ghost"
        ));

        let b = fan_in().node(Node::worker(END));
        assert_eq!(rule_of(b), ValidationRule::Reference);
    }

    #[test]
    fn test_unreachable_node() {
        let b = fan_in()
            .node(Node::worker("x"))
            .node(Node::worker("y"))
            .connect("x", "y")
            .connect("y", "x")
            .connect("y", END);
        assert_eq!(
            b.compile().unwrap_err(),
            GraphValidationError::Unreachable("x".into())
        );
    }

    #[test]
    fn test_no_predecessor() {
        let b = fan_in().node(Node::worker("orphan")).connect("orphan", END);
        assert_eq!(
            b.compile().unwrap_err(),
            GraphValidationError::NoPredecessor("orphan".into())
        );
    }

    #[test]
    fn test_unguarded_cycle_rejected() {
        let b = GraphBuilder::new("spin")
            .node(Node::worker("a"))
            .node(Node::aggregator("b"))
            .node(Node::worker("c"))
            .connect(START, "a")
            .connect(START, "c")
            .connect("a", "b")
            .connect("c", "b")
            .connect("b", "a")
            .connect("b", END);
        let err = b.compile().unwrap_err();
        assert_eq!(err.rule(), ValidationRule::GuardedCycle);
        assert_eq!(
            err,
            GraphValidationError::UnguardedCycle {
                nodes: vec!["a".into(), "b".into(), "a".into()]
            }
        );
    }

    #[test]
    fn test_cycle_beside_router_branch_rejected() {
        // a -> d -> j -> a never passes the router
        let b = GraphBuilder::new("side_loop")
            .node(Node::worker("a"))
            .node(Node::router("r"))
            .node(Node::worker("d"))
            .node(Node::worker("x"))
            .node(Node::aggregator("j"))
            .connect(START, "a")
            .connect("a", "r")
            .connect("a", "d")
            .edge(Edge::when("r", "x", "go"))
            .edge(Edge::when("r", END, "end"))
            .connect("x", "j")
            .connect("d", "j")
            .connect("j", "a");
        let err = b.compile().unwrap_err();
        assert_eq!(err.rule(), ValidationRule::GuardedCycle);
        assert_eq!(
            err,
            GraphValidationError::UnguardedCycle {
                nodes: vec!["a".into(), "d".into(), "j".into(), "a".into()]
            }
        );
    }

    #[test]
    fn test_catch_all_guard_does_not_break_cycle() {
        let b = GraphBuilder::new("g")
            .node(Node::worker("analyst"))
            .node(Node::router("route"))
            .node(Node::tool_executor("tools"))
            .connect(START, "analyst")
            .connect("analyst", "route")
            .edge(Edge::guarded("route", "tools", Guard::Matches("^.*$".into())))
            .edge(Edge::when("route", END, "end"))
            .connect("tools", "analyst");
        let err = b.compile().unwrap_err();
        assert_eq!(err.rule(), ValidationRule::GuardedCycle);
        assert!(err.to_string().contains("analyst -> route -> tools -> analyst"));

        let b = GraphBuilder::new("g")
            .node(Node::worker("analyst"))
            .node(Node::router("route"))
            .node(Node::tool_executor("tools"))
            .connect(START, "analyst")
            .connect("analyst", "route")
            .edge(Edge::guarded("route", "tools", Guard::Matches("^call_".into())))
            .edge(Edge::when("route", END, "end"))
            .connect("tools", "analyst");
        assert!(b.compile().is_ok());
    }

    #[test]
    fn test_guard_placement() {
        let b = fan_in().edge(Edge::when("a", "g", "x"));
        assert_eq!(rule_of(b), ValidationRule::Guard);

        let b = GraphBuilder::new("g")
            .node(Node::worker("a"))
            .node(Node::router("r"))
            .node(Node::worker("b"))
            .connect(START, "a")
            .connect("a", "r")
            .connect("r", "b")
            .edge(Edge::when("r", END, "end"))
            .connect("b", END);
        let err = b.compile().unwrap_err();
        assert!(matches!(err, GraphValidationError::InvalidGuard { ref reason, .. } if reason.contains("must carry")));
    }

    #[test]
    fn test_overlapping_guards_rejected() {
        let b = GraphBuilder::new("g")
            .node(Node::worker("analyst"))
            .node(Node::router("route"))
            .node(Node::tool_executor("tools"))
            .connect(START, "analyst")
            .connect("analyst", "route")
            .edge(Edge::guarded(
                "route",
                "tools",
                Guard::OneOf(vec!["call_tool".into(), "end".into()]),
            ))
            .edge(Edge::when("route", END, "end"))
            .connect("tools", "analyst");
        let err = b.compile().unwrap_err();
        assert_eq!(err.rule(), ValidationRule::Guard);
        assert!(err.to_string().contains("'end'"));
    }

    #[test]
    fn test_bad_regex_rejected_at_compile_time() {
        let b = GraphBuilder::new("g")
            .node(Node::worker("analyst"))
            .node(Node::router("route"))
            .node(Node::tool_executor("tools"))
            .connect(START, "analyst")
            .connect("analyst", "route")
            .edge(Edge::guarded("route", "tools", Guard::Matches("([".into())))
            .edge(Edge::when("route", END, "end"))
            .connect("tools", "analyst");
        assert_eq!(rule_of(b), ValidationRule::Guard);
    }

    #[test]
    fn test_kind_arity() {
        // Router with a single branch
        let b = GraphBuilder::new("g")
            .node(Node::worker("a"))
            .node(Node::router("r"))
            .connect(START, "a")
            .connect("a", "r")
            .edge(Edge::when("r", END, "end"));
        assert_eq!(rule_of(b), ValidationRule::KindArity);

        // Aggregator joining a single predecessor
        let b = GraphBuilder::new("g")
            .node(Node::worker("a"))
            .node(Node::aggregator("g"))
            .connect(START, "a")
            .connect("a", "g")
            .connect("g", END);
        assert_eq!(rule_of(b), ValidationRule::KindArity);

        // Worker joining two predecessors
        let b = GraphBuilder::new("g")
            .node(Node::worker("a"))
            .node(Node::worker("b"))
            .node(Node::worker("c"))
            .connect(START, "a")
            .connect(START, "b")
            .connect("a", "c")
            .connect("b", "c")
            .connect("c", END);
        let err = b.compile().unwrap_err();
        assert!(matches!(err, GraphValidationError::Arity { ref node, .. } if node == "c"));
    }

    #[test]
    fn test_router_branch_target_cannot_join() {
        let b = GraphBuilder::new("g")
            .node(Node::worker("a"))
            .node(Node::router("r"))
            .node(Node::worker("b"))
            .connect(START, "a")
            .connect("a", "r")
            .edge(Edge::when("r", END, "end"))
            .edge(Edge::when("r", "b", "more"))
            .connect("b", END);
        let err = b.compile().unwrap_err();
        assert!(matches!(err, GraphValidationError::Arity { ref node, .. } if node == END));
    }

    #[test]
    fn test_missing_terminal() {
        let b = GraphBuilder::new("g")
            .node(Node::worker("a"))
            .connect(START, "a");
        assert_eq!(b.compile().unwrap_err(), GraphValidationError::MissingTerminal);
    }

    #[test]
    fn test_from_toml() {
        let spec = GraphSpec::from_toml(
            r#"
name = "surveillance"

[[nodes]]
id = "analyst"
kind = "independent_worker"

[[nodes]]
id = "route"
kind = "router"
capability = "pending_tool_calls"

[[nodes]]
id = "tools"
kind = "tool_executor"

[[edges]]
from = "START"
to = "analyst"

[[edges]]
from = "analyst"
to = "route"

[[edges]]
from = "route"
to = "tools"
guard = { equals = "call_tool" }

[[edges]]
from = "route"
to = "END"
guard = { expr = 'decision == "end"' }

[[edges]]
from = "tools"
to = "analyst"
"#,
        )
        .unwrap();

        let graph = spec.compile().unwrap();
        assert_eq!(graph.name(), "surveillance");
        assert_eq!(graph.node("route").unwrap().capability(), "pending_tool_calls");
        assert_eq!(graph.back_edges().count(), 1);
    }

    #[test]
    fn test_from_toml_rejects_garbage() {
        assert!(GraphSpec::from_toml("name = 3").is_err());
    }
}
