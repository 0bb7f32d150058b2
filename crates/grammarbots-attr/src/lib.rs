//! Attribute grammar evaluation for the GrammarBots workspace.
//!
//! A [`CodeTree`] shadows a mapped derivation tree: per production it
//! resolves occurrence aliases, compiles the embedded attribute statements
//! into a small AST, infers whether each attribute is synthesized or
//! inherited, and executes the whole tree in dependency order. The final
//! verdict lands on the derivation tree root's `invalid` flag; evaluated
//! attribute values stay readable through the root alias table.

mod alias;
mod code_tree;
mod expr;

pub use alias::occurrence_aliases;
pub use code_tree::{AttrRecord, CodeTree, Direction, RecordId, evaluate};
pub use expr::{
    AssignOp, AttrRef, BinaryOp, Expr, Fragment, Marker, Statement, StatementKind, UnaryOp,
    parse_statement,
};

use thiserror::Error;

/// Recoverable failures while building or executing a code tree.
///
/// Structural and semantic invalidity are *not* errors; they surface through
/// the `invalid` verdict. Errors here mean the embedded code itself is
/// malformed, tagged with the offending line for diagnosis.
#[derive(Debug, Error, PartialEq)]
pub enum AttrError {
    #[error("attribute code line {line:?}: {message}")]
    Parse { line: String, message: String },
    #[error("attribute code line {line:?}: {kind}")]
    Eval { line: String, kind: EvalErrorKind },
    #[error("derivation tree root {symbol} has no declared attributes")]
    UndeclaredRoot { symbol: String },
}

/// What went wrong while evaluating one compiled statement.
#[derive(Debug, Error, PartialEq)]
pub enum EvalErrorKind {
    #[error("unknown alias {alias}")]
    UnknownAlias { alias: String },
    #[error("unknown attribute {attr} on {symbol}")]
    UnknownAttribute { symbol: String, attr: String },
    #[error("cannot apply {op} to {lhs} and {rhs}")]
    TypeMismatch {
        op: &'static str,
        lhs: &'static str,
        rhs: &'static str,
    },
    #[error("cannot negate {operand}")]
    BadNegation { operand: &'static str },
    #[error("division by zero")]
    DivisionByZero,
}
