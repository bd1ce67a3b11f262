use crate::ast::Expr;

// ---------------------------------------------------------------------------
// Edge kinds
// ---------------------------------------------------------------------------

/// Compile-time type of a DAG link: whole points or whole batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKind {
    Stream,
    Batch,
}

impl EdgeKind {
    pub fn name(&self) -> &'static str {
        match self {
            EdgeKind::Stream => "stream",
            EdgeKind::Batch => "batch",
        }
    }
}

// ---------------------------------------------------------------------------
// Node specs
// ---------------------------------------------------------------------------

/// One compiled node of a task DAG. The runtime instantiates an executable
/// node from each spec; the index in [`Dag::nodes`](super::Dag) is the
/// node's stable position (used for DOT names and anonymous alert topics).
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum NodeSpec {
    /// Stream root: the task's live point input.
    Stream,
    /// Batch root: anchor for `query` nodes.
    Batch,
    Query(QuerySpec),
    From(FromSpec),
    Where(WhereSpec),
    Window(WindowSpec),
    GroupBy(GroupBySpec),
    Eval(EvalSpec),
    Aggregate(AggregateSpec),
    Join(JoinSpec),
    Alert(AlertSpec),
    HttpOut(HttpOutSpec),
    Log(LogSpec),
    Sideload(SideloadSpec),
    Udf(UdfSpec),
}

impl NodeSpec {
    pub fn kind(&self) -> &'static str {
        match self {
            NodeSpec::Stream => "stream",
            NodeSpec::Batch => "batch",
            NodeSpec::Query(_) => "query",
            NodeSpec::From(_) => "from",
            NodeSpec::Where(_) => "where",
            NodeSpec::Window(_) => "window",
            NodeSpec::GroupBy(_) => "groupBy",
            NodeSpec::Eval(_) => "eval",
            NodeSpec::Aggregate(a) => a.func.name(),
            NodeSpec::Join(_) => "join",
            NodeSpec::Alert(_) => "alert",
            NodeSpec::HttpOut(_) => "httpOut",
            NodeSpec::Log(_) => "log",
            NodeSpec::Sideload(_) => "sideload",
            NodeSpec::Udf(_) => "udf",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct FromSpec {
    pub measurement: Option<String>,
    /// Lambda body of `.where()`.
    pub filter: Option<Expr>,
    pub group_by: Vec<String>,
    pub group_by_star: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WhereSpec {
    /// Lambda body.
    pub filter: Expr,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WindowSpec {
    /// Nanoseconds of data each emitted batch covers.
    pub period: i64,
    /// Nanoseconds between emissions.
    pub every: i64,
    /// Align emission boundaries to multiples of `every` since the epoch.
    pub align: bool,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct GroupBySpec {
    pub dims: Vec<String>,
    /// `groupBy(*)` — every tag becomes a dimension.
    pub star: bool,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct EvalSpec {
    /// Parallel to `names`: lambda bodies evaluated in order, each result
    /// visible to later lambdas.
    pub exprs: Vec<Expr>,
    /// Output field names set via `.as()`. Must match `exprs` in length.
    pub names: Vec<String>,
    /// `.keep('a', 'b')` restricts the output field set; None keeps all.
    pub keep: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum AggFunc {
    Count,
    Sum,
    Mean,
    Min,
    Max,
    First,
    Last,
    Median,
    Spread,
}

impl AggFunc {
    pub fn name(&self) -> &'static str {
        match self {
            AggFunc::Count => "count",
            AggFunc::Sum => "sum",
            AggFunc::Mean => "mean",
            AggFunc::Min => "min",
            AggFunc::Max => "max",
            AggFunc::First => "first",
            AggFunc::Last => "last",
            AggFunc::Median => "median",
            AggFunc::Spread => "spread",
        }
    }

    pub fn from_name(name: &str) -> Option<AggFunc> {
        Some(match name {
            "count" => AggFunc::Count,
            "sum" => AggFunc::Sum,
            "mean" => AggFunc::Mean,
            "min" => AggFunc::Min,
            "max" => AggFunc::Max,
            "first" => AggFunc::First,
            "last" => AggFunc::Last,
            "median" => AggFunc::Median,
            "spread" => AggFunc::Spread,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AggregateSpec {
    pub func: AggFunc,
    pub field: String,
    /// Output field name; defaults to the function name.
    pub as_name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JoinSpec {
    /// Field-name prefixes per input, set via `.as()`; parallel to the
    /// node's input edges.
    pub names: Vec<String>,
    /// Time alignment tolerance in nanoseconds.
    pub tolerance: i64,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct AlertSpec {
    /// Explicit topic; None routes to the anonymous topic.
    pub topic: Option<String>,
    pub id_tmpl: Option<String>,
    pub message_tmpl: Option<String>,
    pub details_tmpl: Option<String>,
    /// Lambda bodies per level.
    pub info: Option<Expr>,
    pub warn: Option<Expr>,
    pub crit: Option<Expr>,
    pub state_changes_only: bool,
    /// Inhibition category this node's events belong to.
    pub category: Option<String>,
    pub inhibits: Vec<InhibitSpec>,
    /// Node-local handler call-sites (`.log()`, `.post()`, `.tcp()`).
    pub handlers: Vec<HandlerCall>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InhibitSpec {
    /// Category whose events this node's CRITICAL events suppress.
    pub category: String,
    /// Tag keys that scope the suppression.
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HandlerCall {
    /// `log`, `post`, or `tcp`.
    pub kind: String,
    /// Single target argument: path, URL, or address.
    pub target: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpOutSpec {
    /// Endpoint name; the runtime exposes the latest value under
    /// `/tasks/<task>/<endpoint>`.
    pub endpoint: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogSpec {
    pub path: String,
    /// File creation mode; 0o600 unless overridden via `.mode()`.
    pub mode: u32,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SideloadSpec {
    /// Root directory of the sideload source.
    pub source: String,
    /// Ordered lookup path templates, e.g. `host/{host}.yml`.
    pub order: Vec<String>,
    /// Field defaults merged when no source file provides the field.
    pub fields: Vec<(String, Expr)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UdfSpec {
    /// Process name as registered in the runtime's UDF table.
    pub name: String,
    /// Raw option calls relayed to the process at init.
    pub options: Vec<(String, Vec<Expr>)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QuerySpec {
    pub query: String,
    pub period: i64,
    pub every: i64,
    pub align: bool,
    pub cluster: Option<String>,
}
