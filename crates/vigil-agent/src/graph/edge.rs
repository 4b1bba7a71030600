use std::collections::BTreeSet;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// An edge connecting two nodes (or a node and a virtual marker).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    /// Source node id.
    pub from: String,
    /// Target node id.
    pub to: String,
    /// Guard on a router's decision. Absent means unconditional.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guard: Option<Guard>,
}

/// Predicate over a router's decision value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Guard {
    /// Decision equals the value.
    Equals(String),
    /// Decision is one of the values.
    OneOf(Vec<String>),
    /// Decision matches the regular expression.
    Matches(String),
    /// A simple expression over `decision`.
    /// Supported: `decision == "x"`, `decision != "x"`, `decision contains "x"`.
    Expr(String),
}

impl Edge {
    /// Create an unconditional edge.
    pub fn always(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            guard: None,
        }
    }

    /// Create an edge a router follows when its decision equals `decision`.
    pub fn when(from: impl Into<String>, to: impl Into<String>, decision: impl Into<String>) -> Self {
        Self::guarded(from, to, Guard::Equals(decision.into()))
    }

    pub fn guarded(from: impl Into<String>, to: impl Into<String>, guard: Guard) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            guard: Some(guard),
        }
    }
}

impl std::fmt::Display for Guard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Equals(v) => write!(f, "== {:?}", v),
            Self::OneOf(values) => write!(f, "in [{}]", values.join(", ")),
            Self::Matches(pattern) => write!(f, "=~ /{}/", pattern),
            Self::Expr(expr) => f.write_str(expr.trim()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExprOp {
    Eq,
    Ne,
    Contains,
}

/// A validated guard, ready for evaluation.
#[derive(Debug, Clone)]
pub enum CompiledGuard {
    Equals(String),
    OneOf(Vec<String>),
    Matches(Regex),
    Expr { op: ExprOp, value: String },
}

impl Guard {
    /// Validate and compile. The error is a human-readable reason.
    pub fn compile(&self) -> Result<CompiledGuard, String> {
        match self {
            Self::Equals(v) => Ok(CompiledGuard::Equals(v.clone())),
            Self::OneOf(values) => {
                if values.is_empty() {
                    return Err("one_of guard has no values".to_string());
                }
                Ok(CompiledGuard::OneOf(values.clone()))
            }
            Self::Matches(pattern) => Regex::new(pattern)
                .map(CompiledGuard::Matches)
                .map_err(|e| format!("invalid guard pattern: {}", e)),
            Self::Expr(expr) => parse_expr(expr),
        }
    }
}

impl CompiledGuard {
    /// Evaluate against a decision value.
    pub fn matches(&self, decision: &str) -> bool {
        match self {
            Self::Equals(v) => decision == v,
            Self::OneOf(values) => values.iter().any(|v| v == decision),
            Self::Matches(re) => re.is_match(decision),
            Self::Expr { op, value } => match op {
                ExprOp::Eq => decision == value,
                ExprOp::Ne => decision != value,
                ExprOp::Contains => decision.contains(value.as_str()),
            },
        }
    }

    /// True when no decision value can make this guard fail.
    pub fn accepts_everything(&self) -> bool {
        match self {
            Self::Matches(re) => {
                if re.as_str().is_empty() {
                    return true;
                }
                let pattern = re.as_str();
                let pattern = pattern.strip_prefix('^').unwrap_or(pattern);
                let pattern = pattern.strip_suffix('$').unwrap_or(pattern);
                matches!(pattern, ".*" | ".*?" | "(?s).*" | "(?s:.*)" | r"[\s\S]*")
            }
            Self::Expr {
                op: ExprOp::Contains,
                value,
            } => value.is_empty(),
            _ => false,
        }
    }

    /// The exact decision values this guard accepts, when that set is finite.
    pub fn literals(&self) -> Option<BTreeSet<&str>> {
        match self {
            Self::Equals(v) => Some([v.as_str()].into_iter().collect()),
            Self::OneOf(values) => Some(values.iter().map(String::as_str).collect()),
            Self::Expr {
                op: ExprOp::Eq,
                value,
            } => Some([value.as_str()].into_iter().collect()),
            _ => None,
        }
    }
}

/// Parse `decision OP "value"`.
fn parse_expr(expr: &str) -> Result<CompiledGuard, String> {
    let expr = expr.trim();

    for (token, op) in [
        ("contains", ExprOp::Contains),
        ("!=", ExprOp::Ne),
        ("==", ExprOp::Eq),
    ] {
        if let Some((key, value)) = parse_operator(expr, token) {
            if key != "decision" {
                return Err(format!(
                    "guard expression must test `decision`, found `{}`",
                    key
                ));
            }
            return Ok(CompiledGuard::Expr {
                op,
                value: value.to_string(),
            });
        }
    }

    Err(format!("unparseable guard expression: {}", expr))
}

/// Parse `key OP "value"` expressions, returning (key, value).
fn parse_operator<'a>(expr: &'a str, op: &str) -> Option<(&'a str, &'a str)> {
    let (key, val) = expr.split_once(op)?;
    let key = key.trim();
    let val = val.trim().trim_matches('"');
    if key.is_empty() {
        return None;
    }
    Some((key, val))
}
