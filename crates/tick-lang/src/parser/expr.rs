use winnow::combinator::{alt, cut_err, opt, separated};
use winnow::error::{StrContext, StrContextValue};
use winnow::prelude::*;
use winnow::token::literal;

use crate::ast::{BinOp, Expr, UnaryOp};
use crate::parse_utils::{
    NumberLit, field_ref, ident, kw, number_literal, quoted_string, regex_literal, ws_skip,
};

// ---------------------------------------------------------------------------
// Public entry: full expression
// ---------------------------------------------------------------------------

pub(crate) fn parse_expr(input: &mut &str) -> ModalResult<Expr> {
    or_expr.parse_next(input)
}

// ---------------------------------------------------------------------------
// Precedence levels (lowest to highest)
// ---------------------------------------------------------------------------

/// `or_expr = and_expr { "OR" and_expr }`
fn or_expr(input: &mut &str) -> ModalResult<Expr> {
    let mut left = and_expr.parse_next(input)?;
    loop {
        ws_skip.parse_next(input)?;
        if opt(kw("OR")).parse_next(input)?.is_some() {
            ws_skip.parse_next(input)?;
            let right = cut_err(and_expr).parse_next(input)?;
            left = Expr::Binary {
                op: BinOp::Or,
                left: Box::new(left),
                right: Box::new(right),
            };
        } else {
            break;
        }
    }
    Ok(left)
}

/// `and_expr = cmp_expr { "AND" cmp_expr }`
fn and_expr(input: &mut &str) -> ModalResult<Expr> {
    let mut left = cmp_expr.parse_next(input)?;
    loop {
        ws_skip.parse_next(input)?;
        if opt(kw("AND")).parse_next(input)?.is_some() {
            ws_skip.parse_next(input)?;
            let right = cut_err(cmp_expr).parse_next(input)?;
            left = Expr::Binary {
                op: BinOp::And,
                left: Box::new(left),
                right: Box::new(right),
            };
        } else {
            break;
        }
    }
    Ok(left)
}

/// `cmp_expr = add_expr [cmp_op add_expr]`
fn cmp_expr(input: &mut &str) -> ModalResult<Expr> {
    let left = add_expr.parse_next(input)?;
    ws_skip.parse_next(input)?;
    if let Some(op) = opt(cmp_op).parse_next(input)? {
        ws_skip.parse_next(input)?;
        let right = cut_err(add_expr).parse_next(input)?;
        return Ok(Expr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        });
    }
    Ok(left)
}

fn cmp_op(input: &mut &str) -> ModalResult<BinOp> {
    alt((
        literal("==").value(BinOp::Eq),
        literal("!=").value(BinOp::Ne),
        literal("<=").value(BinOp::Le),
        literal(">=").value(BinOp::Ge),
        literal("<").value(BinOp::Lt),
        literal(">").value(BinOp::Gt),
        literal("=~").value(BinOp::Match),
        literal("!~").value(BinOp::NotMatch),
    ))
    .parse_next(input)
}

/// `add_expr = mul_expr { ("+" | "-") mul_expr }`
fn add_expr(input: &mut &str) -> ModalResult<Expr> {
    let mut left = mul_expr.parse_next(input)?;
    loop {
        ws_skip.parse_next(input)?;
        let op = opt(alt((
            literal("+").value(BinOp::Add),
            literal("-").value(BinOp::Sub),
        )))
        .parse_next(input)?;
        if let Some(op) = op {
            ws_skip.parse_next(input)?;
            let right = cut_err(mul_expr).parse_next(input)?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        } else {
            break;
        }
    }
    Ok(left)
}

/// `mul_expr = unary_expr { ("*" | "/" | "%") unary_expr }`
fn mul_expr(input: &mut &str) -> ModalResult<Expr> {
    let mut left = unary_expr.parse_next(input)?;
    loop {
        ws_skip.parse_next(input)?;
        let op = opt(alt((
            literal("*").value(BinOp::Mul),
            literal("/").value(BinOp::Div),
            literal("%").value(BinOp::Mod),
        )))
        .parse_next(input)?;
        if let Some(op) = op {
            ws_skip.parse_next(input)?;
            let right = cut_err(unary_expr).parse_next(input)?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        } else {
            break;
        }
    }
    Ok(left)
}

/// `unary_expr = ["-" | "!"] primary`
fn unary_expr(input: &mut &str) -> ModalResult<Expr> {
    if opt(literal("!")).parse_next(input)?.is_some() {
        ws_skip.parse_next(input)?;
        let inner = unary_expr.parse_next(input)?;
        return Ok(Expr::Unary {
            op: UnaryOp::Not,
            expr: Box::new(inner),
        });
    }
    if opt(literal("-")).parse_next(input)?.is_some() {
        ws_skip.parse_next(input)?;
        let inner = unary_expr.parse_next(input)?;
        return Ok(Expr::Unary {
            op: UnaryOp::Neg,
            expr: Box::new(inner),
        });
    }
    primary.parse_next(input)
}

// ---------------------------------------------------------------------------
// Primary
// ---------------------------------------------------------------------------

fn primary(input: &mut &str) -> ModalResult<Expr> {
    alt((
        lambda_literal,
        number_literal.map(|n| match n {
            NumberLit::Int(i) => Expr::Int(i),
            NumberLit::Float(f) => Expr::Float(f),
            NumberLit::Duration(ns) => Expr::Duration(ns),
        }),
        quoted_string.map(Expr::Str),
        field_ref.map(Expr::Field),
        regex_literal.map(Expr::Regex),
        kw("TRUE").map(|_| Expr::Bool(true)),
        kw("FALSE").map(|_| Expr::Bool(false)),
        literal("*").map(|_| Expr::Star),
        list_literal,
        paren_expr,
        ident_primary,
    ))
    .context(StrContext::Expected(StrContextValue::Description(
        "expression",
    )))
    .parse_next(input)
}

/// `lambda: <expr>`
fn lambda_literal(input: &mut &str) -> ModalResult<Expr> {
    kw("lambda").parse_next(input)?;
    ws_skip.parse_next(input)?;
    cut_err(literal(":")).parse_next(input)?;
    ws_skip.parse_next(input)?;
    let body = cut_err(parse_expr).parse_next(input)?;
    Ok(Expr::Lambda(Box::new(body)))
}

fn list_literal(input: &mut &str) -> ModalResult<Expr> {
    literal("[").parse_next(input)?;
    ws_skip.parse_next(input)?;
    if opt(literal("]")).parse_next(input)?.is_some() {
        return Ok(Expr::List(vec![]));
    }
    let items: Vec<Expr> = separated(
        1..,
        (ws_skip, parse_expr, ws_skip).map(|(_, e, _)| e),
        literal(","),
    )
    .parse_next(input)?;
    cut_err(literal("]")).parse_next(input)?;
    Ok(Expr::List(items))
}

fn paren_expr(input: &mut &str) -> ModalResult<Expr> {
    literal("(").parse_next(input)?;
    ws_skip.parse_next(input)?;
    let inner = cut_err(parse_expr).parse_next(input)?;
    ws_skip.parse_next(input)?;
    cut_err(literal(")")).parse_next(input)?;
    Ok(inner)
}

/// Bare ident: function call when followed by `(`, otherwise a var ref.
fn ident_primary(input: &mut &str) -> ModalResult<Expr> {
    let name = ident.parse_next(input)?.to_string();
    let saved = *input;
    ws_skip.parse_next(input)?;
    if opt(literal("(")).parse_next(input)?.is_some() {
        ws_skip.parse_next(input)?;
        if opt(literal(")")).parse_next(input)?.is_some() {
            return Ok(Expr::Call { name, args: vec![] });
        }
        let args: Vec<Expr> = separated(
            1..,
            (ws_skip, parse_expr, ws_skip).map(|(_, e, _)| e),
            literal(","),
        )
        .parse_next(input)?;
        cut_err(literal(")")).parse_next(input)?;
        return Ok(Expr::Call { name, args });
    }
    // Not a call: restore whitespace we consumed so the chain parser can
    // see trailing operators unambiguously.
    *input = saved;
    Ok(Expr::Var(name))
}
