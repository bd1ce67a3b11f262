use super::Expr;

// ---------------------------------------------------------------------------
// Pipeline chains
// ---------------------------------------------------------------------------

/// One pipeline chain: a source followed by method calls.
///
/// `stream|from().measurement('cpu')|window().period(10s)` parses as source
/// `Stream` with calls `from` (chain), `measurement` (property), `window`
/// (chain), `period` (property).
#[derive(Debug, Clone, PartialEq)]
pub struct Chain {
    pub source: ChainSource,
    pub calls: Vec<MethodCall>,
}

#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum ChainSource {
    Stream,
    Batch,
    /// A var holding a source or a node, e.g. `cpu|alert()`.
    Ref(String),
}

/// How a method call attaches to the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum CallKind {
    /// `|method(...)` — creates a new node downstream.
    Chain,
    /// `.method(...)` — sets a property on the current node.
    Property,
    /// `@name(...)` — creates a user-defined-function node downstream.
    Udf,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MethodCall {
    pub kind: CallKind,
    pub name: String,
    pub args: Vec<Expr>,
}
