//! The embedded attribute statement language.
//!
//! One production's code block is a newline-separated list of statements:
//! assignments into attribute occurrences (`<K_1>.w = <K_2>.w + <I>.w`,
//! compound forms included) or bare expressions evaluated for their validity
//! side effects (`<K>.w <= <K>.c or error()`). Statements are compiled once
//! per production into an explicit AST and interpreted by tree walking;
//! there is no dynamic host-language execution.

use crate::{AttrError, EvalErrorKind};
use grammarbots_grammar::Value;
use logos::Logos;
use serde::{Deserialize, Serialize};

#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\r]+")]
enum Token {
    // `<NT>.attr` / `<NT_k>.attr` occurrence reference.
    #[regex(r"<[A-Za-z0-9_-]+>\.[A-Za-z0-9_]+", |lex| lex.slice().to_string())]
    AttrRef(String),

    #[regex(r"[0-9]+\.[0-9]+", |lex| lex.slice().parse::<f64>().ok())]
    Float(f64),
    #[regex(r"[0-9]+", |lex| lex.slice().parse::<i64>().ok())]
    Int(i64),
    #[regex(r#""[^"]*""#, |lex| trim_quotes(lex.slice()))]
    #[regex(r"'[^']*'", |lex| trim_quotes(lex.slice()))]
    Str(String),

    #[token("true")]
    True,
    #[token("false")]
    False,
    #[token("and")]
    And,
    #[token("or")]
    Or,
    #[token("not")]
    Not,

    #[regex(r"[A-Za-z_][A-Za-z0-9_]*", |lex| lex.slice().to_string())]
    Ident(String),

    #[token("(")]
    LParen,
    #[token(")")]
    RParen,

    #[token("==")]
    EqEq,
    #[token("!=")]
    BangEq,
    #[token("<=")]
    LtEq,
    #[token(">=")]
    GtEq,
    #[token("<")]
    Lt,
    #[token(">")]
    Gt,

    #[token("+=")]
    PlusEq,
    #[token("-=")]
    MinusEq,
    #[token("*=")]
    StarEq,
    #[token("/=")]
    SlashEq,
    #[token("=")]
    Assign,

    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("*")]
    Star,
    #[token("/")]
    Slash,
    #[token("%")]
    Percent,
}

fn trim_quotes(slice: &str) -> String {
    slice[1..slice.len() - 1].to_string()
}

/// A resolved `<NT>.attr` reference: occurrence alias plus attribute name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AttrRef {
    pub alias: String,
    pub attr: String,
}

impl AttrRef {
    fn parse(text: &str) -> Self {
        let split = text.find(">.").expect("lexer guarantees `>.` in references");
        Self {
            alias: text[..=split].to_string(),
            attr: text[split + 2..].to_string(),
        }
    }
}

/// One lexical piece of a compiled line: an occurrence reference or the
/// literal token text between references.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Fragment {
    Ref(AttrRef),
    Text(String),
}

/// The two reserved validity marker calls.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Marker {
    /// Self-documenting no-op.
    Ok,
    /// Flags the enclosing tree node invalid; never cleared once set.
    Error,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl BinaryOp {
    pub(crate) fn name(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::Mod => "%",
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::And => "and",
            Self::Or => "or",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AssignOp {
    Set,
    Add,
    Sub,
    Mul,
    Div,
}

/// Expression tree of the statement language.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Expr {
    Literal(Value),
    Ref(AttrRef),
    Call(Marker),
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum StatementKind {
    Assign {
        target: AttrRef,
        op: AssignOp,
        rhs: Expr,
    },
    Expr(Expr),
}

/// One compiled code line: the fragment list (kept for target resolution and
/// pull-through inspection) plus the parsed statement and its source text.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Statement {
    pub fragments: Vec<Fragment>,
    pub kind: StatementKind,
    pub source: String,
}

impl Statement {
    /// The reference this line is about: the leading fragment when the line
    /// is an assignment, otherwise the first reference anywhere in the line.
    #[must_use]
    pub fn target(&self) -> Option<&AttrRef> {
        if let Some(Fragment::Ref(target)) = self.fragments.first() {
            return Some(target);
        }
        self.fragments.iter().find_map(|fragment| match fragment {
            Fragment::Ref(target) => Some(target),
            Fragment::Text(_) => None,
        })
    }

    /// True when the line is `target = <occurrence>.attr ...`, i.e. a bare
    /// pull-through of another occurrence's value rather than a
    /// literal/constant/comparison right-hand side.
    #[must_use]
    pub fn pulls_through(&self) -> bool {
        matches!(self.fragments.get(1), Some(Fragment::Text(text)) if text == "=")
            && matches!(self.fragments.get(2), Some(Fragment::Ref(_)))
    }

    /// Token text immediately after the target, when it is literal text.
    /// Direction inference peeks at this to spot constant assignments.
    #[must_use]
    pub fn after_target(&self) -> Option<&str> {
        match self.fragments.get(1) {
            Some(Fragment::Text(text)) => Some(text),
            _ => None,
        }
    }
}

fn assign_op(token: &Token) -> Option<AssignOp> {
    match token {
        Token::Assign => Some(AssignOp::Set),
        Token::PlusEq => Some(AssignOp::Add),
        Token::MinusEq => Some(AssignOp::Sub),
        Token::StarEq => Some(AssignOp::Mul),
        Token::SlashEq => Some(AssignOp::Div),
        _ => None,
    }
}

fn binary_op_info(token: &Token) -> Option<(u8, BinaryOp)> {
    match token {
        Token::Or => Some((10, BinaryOp::Or)),
        Token::And => Some((20, BinaryOp::And)),
        Token::EqEq => Some((30, BinaryOp::Eq)),
        Token::BangEq => Some((30, BinaryOp::Ne)),
        Token::Lt => Some((30, BinaryOp::Lt)),
        Token::LtEq => Some((30, BinaryOp::Le)),
        Token::Gt => Some((30, BinaryOp::Gt)),
        Token::GtEq => Some((30, BinaryOp::Ge)),
        Token::Plus => Some((40, BinaryOp::Add)),
        Token::Minus => Some((40, BinaryOp::Sub)),
        Token::Star => Some((50, BinaryOp::Mul)),
        Token::Slash => Some((50, BinaryOp::Div)),
        Token::Percent => Some((50, BinaryOp::Mod)),
        _ => None,
    }
}

struct Cursor<'a> {
    tokens: &'a [Token],
    pos: usize,
    line: &'a str,
}

impl<'a> Cursor<'a> {
    fn peek(&self) -> Option<&'a Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<&'a Token> {
        let token = self.tokens.get(self.pos);
        self.pos += 1;
        token
    }

    fn error(&self, message: impl Into<String>) -> AttrError {
        AttrError::Parse {
            line: self.line.to_string(),
            message: message.into(),
        }
    }
}

/// Compile one code line into a [`Statement`].
pub fn parse_statement(line: &str) -> Result<Statement, AttrError> {
    let source = line.trim();
    let mut tokens = Vec::new();
    let mut fragments = Vec::new();

    let mut lexer = Token::lexer(source);
    while let Some(result) = lexer.next() {
        let token = result.map_err(|()| AttrError::Parse {
            line: source.to_string(),
            message: format!("unrecognized token {:?}", lexer.slice()),
        })?;
        fragments.push(match &token {
            Token::AttrRef(text) => Fragment::Ref(AttrRef::parse(text)),
            _ => Fragment::Text(lexer.slice().to_string()),
        });
        tokens.push(token);
    }

    if tokens.is_empty() {
        return Err(AttrError::Parse {
            line: source.to_string(),
            message: "empty statement".to_string(),
        });
    }

    let kind = match (&tokens[0], tokens.get(1).and_then(assign_op)) {
        (Token::AttrRef(text), Some(op)) => {
            let mut cursor = Cursor {
                tokens: &tokens[2..],
                pos: 0,
                line: source,
            };
            let rhs = parse_expr_complete(&mut cursor)?;
            StatementKind::Assign {
                target: AttrRef::parse(text),
                op,
                rhs,
            }
        }
        _ => {
            let mut cursor = Cursor {
                tokens: tokens.as_slice(),
                pos: 0,
                line: source,
            };
            StatementKind::Expr(parse_expr_complete(&mut cursor)?)
        }
    };

    Ok(Statement {
        fragments,
        kind,
        source: source.to_string(),
    })
}

fn parse_expr_complete(cursor: &mut Cursor<'_>) -> Result<Expr, AttrError> {
    let expr = parse_pratt(cursor, 0)?;
    if let Some(extra) = cursor.peek() {
        return Err(cursor.error(format!("unexpected trailing token {extra:?}")));
    }
    Ok(expr)
}

fn parse_pratt(cursor: &mut Cursor<'_>, min_prec: u8) -> Result<Expr, AttrError> {
    let mut left = parse_prefix(cursor)?;

    while let Some(token) = cursor.peek() {
        let Some((prec, op)) = binary_op_info(token) else {
            break;
        };
        if prec < min_prec {
            break;
        }
        cursor.advance();
        let right = parse_pratt(cursor, prec + 1)?;
        left = Expr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        };
    }

    Ok(left)
}

fn parse_prefix(cursor: &mut Cursor<'_>) -> Result<Expr, AttrError> {
    match cursor.peek() {
        Some(Token::Minus) => {
            cursor.advance();
            Ok(Expr::Unary {
                op: UnaryOp::Neg,
                operand: Box::new(parse_prefix(cursor)?),
            })
        }
        Some(Token::Not) => {
            cursor.advance();
            Ok(Expr::Unary {
                op: UnaryOp::Not,
                operand: Box::new(parse_prefix(cursor)?),
            })
        }
        _ => parse_atom(cursor),
    }
}

fn parse_atom(cursor: &mut Cursor<'_>) -> Result<Expr, AttrError> {
    match cursor.advance() {
        Some(Token::Int(value)) => Ok(Expr::Literal(Value::Int(*value))),
        Some(Token::Float(value)) => Ok(Expr::Literal(Value::Float(*value))),
        Some(Token::Str(value)) => Ok(Expr::Literal(Value::Str(value.clone()))),
        Some(Token::True) => Ok(Expr::Literal(Value::Bool(true))),
        Some(Token::False) => Ok(Expr::Literal(Value::Bool(false))),
        Some(Token::AttrRef(text)) => Ok(Expr::Ref(AttrRef::parse(text))),
        Some(Token::Ident(name)) => {
            let marker = match name.as_str() {
                "ok" => Marker::Ok,
                "error" => Marker::Error,
                other => return Err(cursor.error(format!("unknown identifier {other:?}"))),
            };
            match (cursor.advance(), cursor.advance()) {
                (Some(Token::LParen), Some(Token::RParen)) => Ok(Expr::Call(marker)),
                _ => Err(cursor.error(format!("{name} takes no arguments: expected `{name}()`"))),
            }
        }
        Some(Token::LParen) => {
            let inner = parse_pratt(cursor, 0)?;
            match cursor.advance() {
                Some(Token::RParen) => Ok(inner),
                _ => Err(cursor.error("expected closing parenthesis")),
            }
        }
        Some(other) => Err(cursor.error(format!("unexpected token {other:?}"))),
        None => Err(cursor.error("unexpected end of statement")),
    }
}

/// Apply a non-short-circuit binary operator to two values. Integer
/// arithmetic stays integral except for `/`, which always yields a float.
pub(crate) fn binary_value(
    op: BinaryOp,
    lhs: &Value,
    rhs: &Value,
) -> Result<Value, EvalErrorKind> {
    use BinaryOp::*;

    let mismatch = || EvalErrorKind::TypeMismatch {
        op: op.name(),
        lhs: lhs.type_name(),
        rhs: rhs.type_name(),
    };

    match op {
        Add | Sub | Mul | Div | Mod => match (lhs, rhs) {
            (Value::Int(a), Value::Int(b)) => match op {
                Add => Ok(Value::Int(a + b)),
                Sub => Ok(Value::Int(a - b)),
                Mul => Ok(Value::Int(a * b)),
                Div => {
                    if *b == 0 {
                        Err(EvalErrorKind::DivisionByZero)
                    } else {
                        Ok(Value::Float(*a as f64 / *b as f64))
                    }
                }
                Mod => {
                    if *b == 0 {
                        Err(EvalErrorKind::DivisionByZero)
                    } else {
                        Ok(Value::Int(a.rem_euclid(*b)))
                    }
                }
                _ => unreachable!(),
            },
            (Value::Str(a), Value::Str(b)) if op == Add => Ok(Value::Str(format!("{a}{b}"))),
            _ => {
                let (Some(a), Some(b)) = (lhs.as_f64(), rhs.as_f64()) else {
                    return Err(mismatch());
                };
                match op {
                    Add => Ok(Value::Float(a + b)),
                    Sub => Ok(Value::Float(a - b)),
                    Mul => Ok(Value::Float(a * b)),
                    Div => {
                        if b == 0.0 {
                            Err(EvalErrorKind::DivisionByZero)
                        } else {
                            Ok(Value::Float(a / b))
                        }
                    }
                    Mod => {
                        if b == 0.0 {
                            Err(EvalErrorKind::DivisionByZero)
                        } else {
                            Ok(Value::Float(a.rem_euclid(b)))
                        }
                    }
                    _ => unreachable!(),
                }
            }
        },
        Eq | Ne => {
            let equal = match (lhs, rhs) {
                (Value::Str(a), Value::Str(b)) => a == b,
                (Value::Bool(a), Value::Bool(b)) => a == b,
                (Value::Nil, Value::Nil) => true,
                _ => match (lhs.as_f64(), rhs.as_f64()) {
                    (Some(a), Some(b)) => a == b,
                    _ => false,
                },
            };
            Ok(Value::Bool(if op == Eq { equal } else { !equal }))
        }
        Lt | Le | Gt | Ge => {
            let ordered = match (lhs, rhs) {
                (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
                _ => match (lhs.as_f64(), rhs.as_f64()) {
                    (Some(a), Some(b)) => a.partial_cmp(&b),
                    _ => None,
                },
            };
            let Some(ordering) = ordered else {
                return Err(mismatch());
            };
            let result = match op {
                Lt => ordering.is_lt(),
                Le => ordering.is_le(),
                Gt => ordering.is_gt(),
                Ge => ordering.is_ge(),
                _ => unreachable!(),
            };
            Ok(Value::Bool(result))
        }
        // Short-circuit operators are handled by the evaluator.
        And | Or => unreachable!("short-circuit operators never reach binary_value"),
    }
}

pub(crate) fn unary_value(op: UnaryOp, operand: &Value) -> Result<Value, EvalErrorKind> {
    match op {
        UnaryOp::Not => Ok(Value::Bool(!operand.truthy())),
        UnaryOp::Neg => match operand {
            Value::Int(v) => Ok(Value::Int(-v)),
            Value::Float(v) => Ok(Value::Float(-v)),
            other => Err(EvalErrorKind::BadNegation {
                operand: other.type_name(),
            }),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assignment_splits_target_and_rhs() {
        let stmt = parse_statement("<K_1>.w = <K_2>.w + <I>.w").expect("line should parse");
        let StatementKind::Assign { target, op, .. } = &stmt.kind else {
            panic!("expected assignment");
        };
        assert_eq!(target.alias, "<K_1>");
        assert_eq!(target.attr, "w");
        assert_eq!(*op, AssignOp::Set);
        assert!(stmt.pulls_through());
    }

    #[test]
    fn constant_assignment_is_not_a_pull_through() {
        let stmt = parse_statement("<S_2>.v = 10").expect("line should parse");
        assert!(!stmt.pulls_through());
        assert_eq!(stmt.target().map(|t| t.alias.as_str()), Some("<S_2>"));
    }

    #[test]
    fn parenthesised_rhs_is_not_a_pull_through() {
        let stmt = parse_statement("<S>.v = (<A>.v + 1)").expect("line should parse");
        assert!(!stmt.pulls_through());
    }

    #[test]
    fn comparison_line_targets_first_reference() {
        let stmt = parse_statement("<K>.w <= <K>.c or error()").expect("line should parse");
        assert!(!stmt.pulls_through());
        let target = stmt.target().expect("line references attributes");
        assert_eq!(target.alias, "<K>");
        assert_eq!(target.attr, "w");
        assert_eq!(stmt.after_target(), Some("<="));
        assert!(matches!(stmt.kind, StatementKind::Expr(_)));
    }

    #[test]
    fn precedence_binds_arithmetic_over_comparison() {
        let stmt = parse_statement("<A>.v + 1 < 5 and ok()").expect("line should parse");
        let StatementKind::Expr(Expr::Binary { op, left, .. }) = &stmt.kind else {
            panic!("expected binary expression");
        };
        assert_eq!(*op, BinaryOp::And);
        let Expr::Binary { op: cmp, .. } = left.as_ref() else {
            panic!("expected comparison on the left");
        };
        assert_eq!(*cmp, BinaryOp::Lt);
    }

    #[test]
    fn unknown_identifier_is_a_parse_error() {
        let err = parse_statement("<A>.v = launch()").expect_err("should fail");
        assert!(matches!(err, AttrError::Parse { .. }));
    }

    #[test]
    fn trailing_junk_is_a_parse_error() {
        let err = parse_statement("<A>.v = 1 2").expect_err("should fail");
        assert!(matches!(err, AttrError::Parse { .. }));
    }

    #[test]
    fn integer_division_promotes_to_float() {
        let value = binary_value(BinaryOp::Div, &Value::Int(7), &Value::Int(2))
            .expect("division should succeed");
        assert_eq!(value, Value::Float(3.5));
    }

    #[test]
    fn mixed_arithmetic_promotes() {
        let value = binary_value(BinaryOp::Add, &Value::Int(1), &Value::Float(0.5))
            .expect("addition should succeed");
        assert_eq!(value, Value::Float(1.5));
    }

    #[test]
    fn string_comparison_is_lexicographic() {
        let value = binary_value(
            BinaryOp::Lt,
            &Value::Str("abc".into()),
            &Value::Str("abd".into()),
        )
        .expect("comparison should succeed");
        assert_eq!(value, Value::Bool(true));
    }

    #[test]
    fn division_by_zero_is_reported() {
        let err = binary_value(BinaryOp::Div, &Value::Int(1), &Value::Int(0))
            .expect_err("should fail");
        assert_eq!(err, EvalErrorKind::DivisionByZero);
    }

    #[test]
    fn adding_bool_to_int_is_a_type_error() {
        let err = binary_value(BinaryOp::Add, &Value::Bool(true), &Value::Int(1))
            .expect_err("should fail");
        assert!(matches!(err, EvalErrorKind::TypeMismatch { .. }));
    }
}
