// ---------------------------------------------------------------------------
// Operators
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum BinOp {
    Or,
    And,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    /// `=~` — left string matched against right regex.
    Match,
    /// `!~`
    NotMatch,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum UnaryOp {
    Neg,
    Not,
}

// ---------------------------------------------------------------------------
// Expressions
// ---------------------------------------------------------------------------

/// Expression tree shared by lambda bodies, var defaults, and method
/// arguments.
///
/// Integers and floats are distinct: TICKscript field values are typed and
/// `1` compares as int64 while `1.0` compares as float64.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum Expr {
    Int(i64),
    Float(f64),
    Bool(bool),
    /// Single-quoted string literal.
    Str(String),
    /// Duration literal, stored as integer nanoseconds.
    Duration(i64),
    /// `/pattern/` regex literal (uncompiled source).
    Regex(String),
    /// `"name"` — a field or tag reference inside a lambda.
    Field(String),
    /// Bare identifier — a script var reference.
    Var(String),
    Star,
    List(Vec<Expr>),
    /// `lambda: <expr>` literal.
    Lambda(Box<Expr>),
    Unary {
        op: UnaryOp,
        expr: Box<Expr>,
    },
    Binary {
        op: BinOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    /// Function call inside a lambda, e.g. `abs(...)`.
    Call {
        name: String,
        args: Vec<Expr>,
    },
}
