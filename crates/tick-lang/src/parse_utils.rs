use winnow::ascii::multispace0;
use winnow::combinator::{alt, opt};
use winnow::error::{ContextError, ErrMode, StrContext, StrContextValue};
use winnow::prelude::*;
use winnow::token::{literal, take_while};

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

pub fn ident<'a>(input: &mut &'a str) -> ModalResult<&'a str> {
    // First character must be alphabetic or underscore (not digit).
    if !input.starts_with(|c: char| c.is_ascii_alphabetic() || c == '_') {
        return Err(ErrMode::Backtrack(ContextError::new()));
    }
    take_while(1.., |c: char| c.is_ascii_alphanumeric() || c == '_').parse_next(input)
}

// ---------------------------------------------------------------------------
// Strings
// ---------------------------------------------------------------------------

/// Single-quoted string literal. `\'` escapes an embedded quote.
pub fn quoted_string(input: &mut &str) -> ModalResult<String> {
    literal("'").parse_next(input)?;
    let mut out = String::new();
    loop {
        let chunk = take_while(0.., |c: char| c != '\'' && c != '\\').parse_next(input)?;
        out.push_str(chunk);
        if opt(literal("\\'")).parse_next(input)?.is_some() {
            out.push('\'');
            continue;
        }
        if opt(literal("\\")).parse_next(input)?.is_some() {
            out.push('\\');
            continue;
        }
        break;
    }
    winnow::combinator::cut_err(literal("'"))
        .context(StrContext::Expected(StrContextValue::Description(
            "closing quote",
        )))
        .parse_next(input)?;
    Ok(out)
}

/// Double-quoted reference, e.g. `"value"` inside a lambda.
pub fn field_ref(input: &mut &str) -> ModalResult<String> {
    literal("\"").parse_next(input)?;
    let content = take_while(0.., |c: char| c != '"').parse_next(input)?;
    winnow::combinator::cut_err(literal("\""))
        .context(StrContext::Expected(StrContextValue::Description(
            "closing double quote",
        )))
        .parse_next(input)?;
    Ok(content.to_string())
}

// ---------------------------------------------------------------------------
// Regex literal
// ---------------------------------------------------------------------------

/// `/pattern/` — the pattern source without the delimiters. `\/` escapes a
/// slash inside the pattern.
pub fn regex_literal(input: &mut &str) -> ModalResult<String> {
    literal("/").parse_next(input)?;
    let mut out = String::new();
    loop {
        let chunk = take_while(0.., |c: char| c != '/' && c != '\\').parse_next(input)?;
        out.push_str(chunk);
        if opt(literal("\\/")).parse_next(input)?.is_some() {
            out.push('/');
            continue;
        }
        if opt(literal("\\")).parse_next(input)?.is_some() {
            out.push('\\');
            continue;
        }
        break;
    }
    winnow::combinator::cut_err(literal("/"))
        .context(StrContext::Expected(StrContextValue::Description(
            "closing regex delimiter",
        )))
        .parse_next(input)?;
    Ok(out)
}

// ---------------------------------------------------------------------------
// Numbers & durations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NumberLit {
    Int(i64),
    Float(f64),
    /// Nanoseconds.
    Duration(i64),
}

/// Integer, float, or duration literal. A digit run followed by a duration
/// suffix (`ns us ms s m h d w`) is a duration; a `.` makes it a float.
pub fn number_literal(input: &mut &str) -> ModalResult<NumberLit> {
    let integer_part = take_while(1.., |c: char| c.is_ascii_digit()).parse_next(input)?;

    if opt(literal(".")).parse_next(input)?.is_some() {
        let frac_part = take_while(1.., |c: char| c.is_ascii_digit())
            .context(StrContext::Expected(StrContextValue::Description(
                "digits after decimal point",
            )))
            .parse_next(input)?;
        let s = format!("{integer_part}.{frac_part}");
        let v: f64 = s.parse().map_err(|_| ErrMode::Cut(ContextError::new()))?;
        return Ok(NumberLit::Float(v));
    }

    if let Some(unit) = opt(duration_unit).parse_next(input)? {
        let num: i64 = integer_part
            .parse()
            .map_err(|_| ErrMode::Cut(ContextError::new()))?;
        return Ok(NumberLit::Duration(num * unit));
    }

    let v: i64 = integer_part
        .parse()
        .map_err(|_| ErrMode::Cut(ContextError::new()))?;
    Ok(NumberLit::Int(v))
}

/// Duration unit suffix, in nanoseconds per unit. Longest match first so
/// `ms` is not read as `m`.
fn duration_unit(input: &mut &str) -> ModalResult<i64> {
    alt((
        literal("ns").value(1i64),
        literal("us").value(1_000i64),
        literal("ms").value(1_000_000i64),
        literal("s").value(1_000_000_000i64),
        literal("m").value(60 * 1_000_000_000i64),
        literal("h").value(3600 * 1_000_000_000i64),
        literal("d").value(86400 * 1_000_000_000i64),
        literal("w").value(7 * 86400 * 1_000_000_000i64),
    ))
    .parse_next(input)
}

// ---------------------------------------------------------------------------
// Whitespace & comments
// ---------------------------------------------------------------------------

/// Skip whitespace plus `//` and `#` line comments.
pub fn ws_skip(input: &mut &str) -> ModalResult<()> {
    loop {
        let _ = multispace0.parse_next(input)?;
        if opt(alt((literal("//"), literal("#")))).parse_next(input)?.is_some() {
            let _ = take_while(0.., |c: char| c != '\n').parse_next(input)?;
        } else {
            break;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Keyword matching with word boundary
// ---------------------------------------------------------------------------

/// Match an exact keyword string, ensuring it's not a prefix of a longer
/// identifier (i.e. the next character is not alphanumeric or `_`).
pub fn kw<'a>(keyword: &'static str) -> impl FnMut(&mut &'a str) -> ModalResult<()> {
    move |input: &mut &'a str| {
        let saved = *input;
        literal(keyword).parse_next(input)?;
        if input.starts_with(|c: char| c.is_ascii_alphanumeric() || c == '_') {
            *input = saved;
            return Err(ErrMode::Backtrack(ContextError::new()));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn parse<T>(mut f: impl FnMut(&mut &str) -> ModalResult<T>, s: &str) -> T {
        let mut input = s;
        let v = f(&mut input).expect("parse");
        assert!(input.is_empty(), "unconsumed input: {input:?}");
        v
    }

    #[test]
    fn ident_rejects_leading_digit() {
        let mut input = "1abc";
        assert!(ident(&mut input).is_err());
    }

    #[test]
    fn single_quoted_with_escape() {
        assert_eq!(parse(quoted_string, r"'it\'s'"), "it's");
    }

    #[test]
    fn regex_with_escaped_slash() {
        assert_eq!(parse(regex_literal, r"/a\/b/"), "a/b");
    }

    #[test]
    fn duration_units() {
        assert_eq!(parse(number_literal, "10s"), NumberLit::Duration(10_000_000_000));
        assert_eq!(parse(number_literal, "5ms"), NumberLit::Duration(5_000_000));
        assert_eq!(parse(number_literal, "2w"), NumberLit::Duration(2 * 7 * 86400 * 1_000_000_000));
    }

    #[test]
    fn int_vs_float() {
        assert_eq!(parse(number_literal, "42"), NumberLit::Int(42));
        assert_eq!(parse(number_literal, "42.5"), NumberLit::Float(42.5));
    }

    #[test]
    fn ws_skips_both_comment_styles() {
        let mut input = "  # one\n  // two\n  x";
        ws_skip(&mut input).unwrap();
        assert_eq!(input, "x");
    }
}
