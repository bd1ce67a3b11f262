use winnow::combinator::{alt, cut_err, opt, separated};
use winnow::error::{StrContext, StrContextValue};
use winnow::prelude::*;
use winnow::token::literal;

use crate::ast::*;
use crate::parse_utils::{field_ref, ident, kw, ws_skip};

mod expr;

pub(crate) use expr::parse_expr;

#[cfg(test)]
mod tests;

// ---------------------------------------------------------------------------
// Public entry
// ---------------------------------------------------------------------------

/// Parse a complete TICKscript source. Syntax errors are reported as
/// `line L col C: <description>` against the original source.
pub fn parse_program(source: &str) -> anyhow::Result<Program> {
    match program.parse(source) {
        Ok(p) => Ok(p),
        Err(e) => {
            let (line, col) = line_col(source, e.offset());
            anyhow::bail!("line {line} col {col}: {}", e.inner())
        }
    }
}

/// Parse a standalone expression, e.g. a handler match lambda.
pub fn parse_expression(source: &str) -> anyhow::Result<Expr> {
    let mut full = (ws_skip, parse_expr, ws_skip).map(|(_, e, _)| e);
    match full.parse(source) {
        Ok(e) => Ok(e),
        Err(e) => {
            let (line, col) = line_col(source, e.offset());
            anyhow::bail!("line {line} col {col}: {}", e.inner())
        }
    }
}

/// Translate a byte offset into a 1-based (line, col) pair.
fn line_col(source: &str, offset: usize) -> (usize, usize) {
    let prefix = &source[..offset.min(source.len())];
    let line = prefix.matches('\n').count() + 1;
    let col = prefix
        .rsplit_once('\n')
        .map(|(_, tail)| tail.chars().count())
        .unwrap_or_else(|| prefix.chars().count())
        + 1;
    (line, col)
}

// ---------------------------------------------------------------------------
// Program
// ---------------------------------------------------------------------------

fn program(input: &mut &str) -> ModalResult<Program> {
    let mut stmts = Vec::new();
    ws_skip.parse_next(input)?;
    while !input.is_empty() {
        stmts.push(statement.parse_next(input)?);
        ws_skip.parse_next(input)?;
    }
    Ok(Program { stmts })
}

fn statement(input: &mut &str) -> ModalResult<Stmt> {
    alt((
        dbrp_stmt.map(Stmt::Dbrp),
        var_stmt.map(Stmt::Var),
        chain.map(Stmt::Chain),
    ))
    .context(StrContext::Expected(StrContextValue::Description(
        "statement",
    )))
    .parse_next(input)
}

// ---------------------------------------------------------------------------
// dbrp "db"."rp"
// ---------------------------------------------------------------------------

fn dbrp_stmt(input: &mut &str) -> ModalResult<Dbrp> {
    kw("dbrp").parse_next(input)?;
    ws_skip.parse_next(input)?;
    let db = cut_err(field_ref)
        .context(StrContext::Expected(StrContextValue::Description(
            "database name",
        )))
        .parse_next(input)?;
    cut_err(literal(".")).parse_next(input)?;
    let rp = cut_err(field_ref)
        .context(StrContext::Expected(StrContextValue::Description(
            "retention policy name",
        )))
        .parse_next(input)?;
    Ok(Dbrp { db, rp })
}

// ---------------------------------------------------------------------------
// var NAME [TYPE] [= def]
// ---------------------------------------------------------------------------

fn var_stmt(input: &mut &str) -> ModalResult<VarDecl> {
    kw("var").parse_next(input)?;
    ws_skip.parse_next(input)?;
    let name = cut_err(ident)
        .context(StrContext::Expected(StrContextValue::Description(
            "variable name",
        )))
        .parse_next(input)?
        .to_string();
    ws_skip.parse_next(input)?;

    let ty = opt(var_type).parse_next(input)?;
    ws_skip.parse_next(input)?;

    let def = if opt(literal("=")).parse_next(input)?.is_some() {
        ws_skip.parse_next(input)?;
        Some(cut_err(var_def).parse_next(input)?)
    } else {
        None
    };

    Ok(VarDecl { name, ty, def })
}

fn var_type(input: &mut &str) -> ModalResult<VarType> {
    alt((
        kw("bool").value(VarType::Bool),
        kw("int").value(VarType::Int),
        kw("float").value(VarType::Float),
        kw("duration").value(VarType::Duration),
        kw("string").value(VarType::String),
        kw("regex").value(VarType::Regex),
        kw("lambda").value(VarType::Lambda),
        kw("list").value(VarType::List),
    ))
    .parse_next(input)
}

/// The right-hand side of `var NAME = ...`: a chain when it starts from a
/// source keyword or an ident followed by a chain operator, otherwise an
/// expression.
fn var_def(input: &mut &str) -> ModalResult<VarDef> {
    if peek_is_chain(input) {
        return chain.map(VarDef::Chain).parse_next(input);
    }
    parse_expr.map(VarDef::Expr).parse_next(input)
}

/// Lookahead: does the input start a chain rather than an expression?
fn peek_is_chain(input: &&str) -> bool {
    let mut probe = *input;
    if kw("stream")(&mut probe).is_ok() || kw("batch")(&mut probe).is_ok() {
        return true;
    }
    let mut probe = *input;
    if ident(&mut probe).is_ok() {
        let _ = ws_skip(&mut probe);
        return probe.starts_with('|') || probe.starts_with('@') || probe.starts_with('.');
    }
    false
}

// ---------------------------------------------------------------------------
// Chains
// ---------------------------------------------------------------------------

fn chain(input: &mut &str) -> ModalResult<Chain> {
    let source = chain_source.parse_next(input)?;
    let mut calls = Vec::new();
    loop {
        ws_skip.parse_next(input)?;
        let Some(kind) = opt(call_kind).parse_next(input)? else {
            break;
        };
        ws_skip.parse_next(input)?;
        let name = cut_err(ident)
            .context(StrContext::Expected(StrContextValue::Description(
                "method name",
            )))
            .parse_next(input)?
            .to_string();
        ws_skip.parse_next(input)?;
        cut_err(literal("("))
            .context(StrContext::Expected(StrContextValue::Description(
                "argument list",
            )))
            .parse_next(input)?;
        let args = call_args.parse_next(input)?;
        calls.push(MethodCall { kind, name, args });
    }
    Ok(Chain { source, calls })
}

fn chain_source(input: &mut &str) -> ModalResult<ChainSource> {
    alt((
        kw("stream").value(ChainSource::Stream),
        kw("batch").value(ChainSource::Batch),
        ident.map(|s: &str| ChainSource::Ref(s.to_string())),
    ))
    .parse_next(input)
}

fn call_kind(input: &mut &str) -> ModalResult<CallKind> {
    // `|` must not be the first half of `||`, which never occurs at chain
    // level.
    if input.starts_with("||") {
        return Err(winnow::error::ErrMode::Backtrack(
            winnow::error::ContextError::new(),
        ));
    }
    alt((
        literal("|").value(CallKind::Chain),
        literal(".").value(CallKind::Property),
        literal("@").value(CallKind::Udf),
    ))
    .parse_next(input)
}

fn call_args(input: &mut &str) -> ModalResult<Vec<Expr>> {
    ws_skip.parse_next(input)?;
    if opt(literal(")")).parse_next(input)?.is_some() {
        return Ok(vec![]);
    }
    let args: Vec<Expr> = separated(
        1..,
        (ws_skip, parse_expr, ws_skip).map(|(_, e, _)| e),
        literal(","),
    )
    .parse_next(input)?;
    cut_err(literal(")"))
        .context(StrContext::Expected(StrContextValue::Description(
            "closing parenthesis",
        )))
        .parse_next(input)?;
    Ok(args)
}
