//! Compiled selector representation.

use serde::{Deserialize, Serialize};

/// How a single term picks nodes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "method", content = "value", rename_all = "snake_case")]
pub enum SelectionMethod {
    /// Model name or fully-qualified name pattern.
    Model(String),
    /// `tag:<name>`
    Tag(String),
    /// `path:<glob>`
    Path(String),
}

impl std::fmt::Display for SelectionMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SelectionMethod::Model(name) => write!(f, "{}", name),
            SelectionMethod::Tag(tag) => write!(f, "tag:{}", tag),
            SelectionMethod::Path(glob) => write!(f, "path:{}", glob),
        }
    }
}

/// Graph expansion applied to a term.
///
/// Operators are positional as in dbt: a leading `+` pulls in upstream
/// nodes, a trailing `+` pulls in downstream nodes, and `@` pulls in the
/// descendants together with all of their ancestors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum GraphOp {
    Ancestors { depth: Option<u32> },
    Descendants { depth: Option<u32> },
    Family,
}

/// Selection predicate tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectorExpr {
    /// Every node in the project (empty selector text).
    All,
    Method(SelectionMethod),
    Graph { op: GraphOp, inner: Box<SelectorExpr> },
    Intersection(Vec<SelectorExpr>),
    Union(Vec<SelectorExpr>),
}

impl SelectorExpr {
    /// Model names referenced by plain name anywhere in the tree.
    pub fn model_names(&self) -> Vec<&str> {
        let mut names = Vec::new();
        self.collect_models(&mut names);
        names
    }

    fn collect_models<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            SelectorExpr::All => {}
            SelectorExpr::Method(SelectionMethod::Model(name)) => {
                if !out.contains(&name.as_str()) {
                    out.push(name);
                }
            }
            SelectorExpr::Method(_) => {}
            SelectorExpr::Graph { inner, .. } => inner.collect_models(out),
            SelectorExpr::Intersection(items) | SelectorExpr::Union(items) => {
                for item in items {
                    item.collect_models(out);
                }
            }
        }
    }
}

impl std::fmt::Display for SelectorExpr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SelectorExpr::All => Ok(()),
            SelectorExpr::Method(method) => write!(f, "{}", method),
            SelectorExpr::Graph { op, inner } => match op {
                GraphOp::Ancestors { depth: Some(d) } => write!(f, "{}+{}", d, inner),
                GraphOp::Ancestors { depth: None } => write!(f, "+{}", inner),
                GraphOp::Descendants { depth: Some(d) } => write!(f, "{}+{}", inner, d),
                GraphOp::Descendants { depth: None } => write!(f, "{}+", inner),
                GraphOp::Family => write!(f, "@{}", inner),
            },
            SelectorExpr::Intersection(items) => {
                let parts: Vec<String> = items.iter().map(|i| i.to_string()).collect();
                write!(f, "{}", parts.join(","))
            }
            SelectorExpr::Union(items) => {
                let parts: Vec<String> = items.iter().map(|i| i.to_string()).collect();
                write!(f, "{}", parts.join(" "))
            }
        }
    }
}

/// Selector text together with its compiled tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CompiledSelector {
    /// Exact text the selector was compiled from.
    pub text: String,
    pub expr: SelectorExpr,
}

impl CompiledSelector {
    pub fn is_all(&self) -> bool {
        matches!(self.expr, SelectorExpr::All)
    }

    /// Normalized argument for the engine's `--select`/`--exclude` flag.
    pub fn to_engine_arg(&self) -> Option<String> {
        if self.is_all() {
            None
        } else {
            Some(self.expr.to_string())
        }
    }
}
