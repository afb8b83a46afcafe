//! Selector DSL parser.
//!
//! ```text
//! expression   := term (WS term)*            union
//! term         := part (',' part)*           intersection
//! part         := [ '@' | DIGITS? '+' ] atom [ '+' DIGITS? ]
//! atom         := 'tag:' NAME | 'path:' GLOB | 'fqn:' NAME | NAME
//! ```

use thiserror::Error;

use super::types::{CompiledSelector, GraphOp, SelectionMethod, SelectorExpr};

/// What went wrong while parsing a selector.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyntaxErrorKind {
    #[error("unknown operator '{0}'")]
    UnknownOperator(char),
    #[error("unknown selection method '{0}'")]
    UnknownMethod(String),
    #[error("unexpected character '{0}'")]
    UnexpectedChar(char),
    #[error("empty term")]
    EmptyTerm,
    #[error("missing value after '{0}:'")]
    MissingValue(String),
    #[error("graph operator without a term")]
    MissingOperand,
    #[error("'@' cannot be combined with a trailing '+'")]
    ConflictingOperators,
    #[error("invalid graph depth '{0}'")]
    InvalidDepth(String),
}

/// Malformed selector text, with the byte offset of the failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Selection syntax error at byte {offset}: {kind}")]
pub struct SelectionSyntaxError {
    pub offset: usize,
    pub kind: SyntaxErrorKind,
}

impl SelectionSyntaxError {
    fn new(offset: usize, kind: SyntaxErrorKind) -> Self {
        Self { offset, kind }
    }
}

type ParseResult<T> = Result<T, SelectionSyntaxError>;

/// Compile selector text.
///
/// Empty or whitespace-only text selects every node. Identical text always
/// compiles to an identical tree.
pub fn compile(text: &str) -> ParseResult<CompiledSelector> {
    let mut terms = Vec::new();
    for (offset, token) in split_with_offsets(text, char::is_whitespace) {
        terms.push(parse_term(token, offset)?);
    }

    let expr = match terms.len() {
        0 => SelectorExpr::All,
        1 => terms.remove(0),
        _ => SelectorExpr::Union(terms),
    };

    Ok(CompiledSelector {
        text: text.to_string(),
        expr,
    })
}

/// Split on `sep`, dropping empty pieces, keeping each piece's byte offset.
fn split_with_offsets(text: &str, sep: impl Fn(char) -> bool) -> Vec<(usize, &str)> {
    let mut pieces = Vec::new();
    let mut start = None;
    for (i, c) in text.char_indices() {
        if sep(c) {
            if let Some(s) = start.take() {
                pieces.push((s, &text[s..i]));
            }
        } else if start.is_none() {
            start = Some(i);
        }
    }
    if let Some(s) = start {
        pieces.push((s, &text[s..]));
    }
    pieces
}

fn parse_term(token: &str, offset: usize) -> ParseResult<SelectorExpr> {
    if !token.contains(',') {
        return parse_part(token, offset);
    }

    let mut parts = Vec::new();
    let mut start = 0;
    for piece in token.split(',') {
        if piece.is_empty() {
            return Err(SelectionSyntaxError::new(offset + start, SyntaxErrorKind::EmptyTerm));
        }
        parts.push(parse_part(piece, offset + start)?);
        start += piece.len() + 1;
    }
    Ok(SelectorExpr::Intersection(parts))
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-' | '*')
}

fn parse_depth(digits: &str, offset: usize) -> ParseResult<Option<u32>> {
    if digits.is_empty() {
        return Ok(None);
    }
    digits
        .parse::<u32>()
        .map(Some)
        .map_err(|_| SelectionSyntaxError::new(offset, SyntaxErrorKind::InvalidDepth(digits.to_string())))
}

fn parse_part(part: &str, offset: usize) -> ParseResult<SelectorExpr> {
    let first = part
        .chars()
        .next()
        .ok_or_else(|| SelectionSyntaxError::new(offset, SyntaxErrorKind::EmptyTerm))?;
    if !(is_name_char(first) || first == '+' || first == '@') {
        return Err(SelectionSyntaxError::new(
            offset,
            SyntaxErrorKind::UnknownOperator(first),
        ));
    }

    let bytes = part.as_bytes();
    let mut start = 0;
    let mut prefix = None;

    if first == '@' {
        prefix = Some(GraphOp::Family);
        start = 1;
    } else {
        let digits = bytes.iter().take_while(|b| b.is_ascii_digit()).count();
        if bytes.get(digits) == Some(&b'+') {
            let depth = parse_depth(&part[..digits], offset)?;
            prefix = Some(GraphOp::Ancestors { depth });
            start = digits + 1;
        }
    }

    let mut end = part.len();
    let mut suffix = None;
    let trailing = bytes[start..]
        .iter()
        .rev()
        .take_while(|b| b.is_ascii_digit())
        .count();
    if end - trailing > start && bytes[end - trailing - 1] == b'+' {
        let plus = end - trailing - 1;
        let depth = parse_depth(&part[plus + 1..], offset + plus + 1)?;
        suffix = Some(GraphOp::Descendants { depth });
        end = plus;
    }

    if prefix == Some(GraphOp::Family) && suffix.is_some() {
        return Err(SelectionSyntaxError::new(
            offset + end,
            SyntaxErrorKind::ConflictingOperators,
        ));
    }

    let atom = &part[start..end];
    let atom_offset = offset + start;
    if atom.is_empty() {
        return Err(SelectionSyntaxError::new(atom_offset, SyntaxErrorKind::MissingOperand));
    }

    let mut expr = SelectorExpr::Method(parse_atom(atom, atom_offset)?);
    if let Some(op) = prefix {
        expr = SelectorExpr::Graph {
            op,
            inner: Box::new(expr),
        };
    }
    if let Some(op) = suffix {
        expr = SelectorExpr::Graph {
            op,
            inner: Box::new(expr),
        };
    }
    Ok(expr)
}

fn check_chars(value: &str, offset: usize, allowed: impl Fn(char) -> bool) -> ParseResult<()> {
    match value.char_indices().find(|(_, c)| !allowed(*c)) {
        Some((i, c)) => Err(SelectionSyntaxError::new(
            offset + i,
            SyntaxErrorKind::UnexpectedChar(c),
        )),
        None => Ok(()),
    }
}

fn parse_atom(atom: &str, offset: usize) -> ParseResult<SelectionMethod> {
    let Some((method, value)) = atom.split_once(':') else {
        check_chars(atom, offset, is_name_char)?;
        return Ok(SelectionMethod::Model(atom.to_string()));
    };

    let value_offset = offset + method.len() + 1;
    let known = matches!(method, "tag" | "path" | "fqn");
    if !known {
        return Err(SelectionSyntaxError::new(
            offset,
            SyntaxErrorKind::UnknownMethod(method.to_string()),
        ));
    }
    if value.is_empty() {
        return Err(SelectionSyntaxError::new(
            value_offset,
            SyntaxErrorKind::MissingValue(method.to_string()),
        ));
    }

    match method {
        "tag" => {
            check_chars(value, value_offset, |c| {
                c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.')
            })?;
            Ok(SelectionMethod::Tag(value.to_string()))
        }
        "path" => {
            check_chars(value, value_offset, |c| !matches!(c, '+' | '@' | ':'))?;
            Ok(SelectionMethod::Path(value.to_string()))
        }
        _ => {
            check_chars(value, value_offset, is_name_char)?;
            Ok(SelectionMethod::Model(value.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model(name: &str) -> SelectorExpr {
        SelectorExpr::Method(SelectionMethod::Model(name.to_string()))
    }

    #[test]
    fn test_bare_model() {
        let compiled = compile("orders").unwrap();
        assert_eq!(compiled.expr, model("orders"));
        assert_eq!(compiled.to_engine_arg().as_deref(), Some("orders"));
    }

    #[test]
    fn test_empty_selects_all() {
        let compiled = compile("   ").unwrap();
        assert!(compiled.is_all());
        assert_eq!(compiled.to_engine_arg(), None);
    }

    #[test]
    fn test_graph_operators() {
        assert_eq!(
            compile("+model_b").unwrap().expr,
            SelectorExpr::Graph {
                op: GraphOp::Ancestors { depth: None },
                inner: Box::new(model("model_b")),
            }
        );
        assert_eq!(
            compile("orders+2").unwrap().expr,
            SelectorExpr::Graph {
                op: GraphOp::Descendants { depth: Some(2) },
                inner: Box::new(model("orders")),
            }
        );
        assert_eq!(
            compile("@orders").unwrap().expr,
            SelectorExpr::Graph {
                op: GraphOp::Family,
                inner: Box::new(model("orders")),
            }
        );
    }

    #[test]
    fn test_digits_in_model_names() {
        assert_eq!(compile("orders_2024").unwrap().expr, model("orders_2024"));
        assert_eq!(compile("2024_orders").unwrap().expr, model("2024_orders"));
    }

    #[test]
    fn test_union_and_intersection() {
        let compiled = compile("tag:nightly,+orders path:models/staging/*.sql").unwrap();
        match &compiled.expr {
            SelectorExpr::Union(terms) => {
                assert_eq!(terms.len(), 2);
                assert!(matches!(&terms[0], SelectorExpr::Intersection(p) if p.len() == 2));
                assert_eq!(
                    terms[1],
                    SelectorExpr::Method(SelectionMethod::Path("models/staging/*.sql".to_string()))
                );
            }
            other => panic!("expected union, got {other:?}"),
        }
        assert_eq!(
            compiled.to_engine_arg().as_deref(),
            Some("tag:nightly,+orders path:models/staging/*.sql")
        );
    }

    #[test]
    fn test_compile_is_deterministic() {
        let text = "+a b+ tag:x,@c";
        assert_eq!(compile(text).unwrap(), compile(text).unwrap());
    }

    #[test]
    fn test_model_names() {
        let compiled = compile("+a tag:x,b a+").unwrap();
        assert_eq!(compiled.expr.model_names(), vec!["a", "b"]);
    }

    #[test]
    fn test_unknown_operator_offset() {
        let err = compile("orders !customers").unwrap_err();
        assert_eq!(err.offset, 7);
        assert_eq!(err.kind, SyntaxErrorKind::UnknownOperator('!'));
    }

    #[test]
    fn test_unknown_method() {
        let err = compile("  source:raw").unwrap_err();
        assert_eq!(err.offset, 2);
        assert_eq!(err.kind, SyntaxErrorKind::UnknownMethod("source".to_string()));
    }

    #[test]
    fn test_malformed_terms() {
        assert_eq!(compile("+").unwrap_err().kind, SyntaxErrorKind::MissingOperand);
        assert_eq!(
            compile("tag:").unwrap_err(),
            SelectionSyntaxError::new(4, SyntaxErrorKind::MissingValue("tag".to_string()))
        );
        assert_eq!(
            compile("@orders+").unwrap_err().kind,
            SyntaxErrorKind::ConflictingOperators
        );
        assert_eq!(
            compile("a,,b").unwrap_err(),
            SelectionSyntaxError::new(2, SyntaxErrorKind::EmptyTerm)
        );
        assert_eq!(
            compile("ord$ers").unwrap_err(),
            SelectionSyntaxError::new(3, SyntaxErrorKind::UnexpectedChar('$'))
        );
        assert_eq!(
            compile("++orders").unwrap_err().kind,
            SyntaxErrorKind::UnexpectedChar('+')
        );
    }

    #[test]
    fn test_error_display() {
        let err = compile("x ~y").unwrap_err();
        assert_eq!(err.to_string(), "Selection syntax error at byte 2: unknown operator '~'");
    }
}
