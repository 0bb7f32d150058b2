//! Grammar model shared across the GrammarBots workspace.
//!
//! A [`Grammar`] is built once (from BNF text plus an optional symbol table
//! declaring per-non-terminal attributes) and then shared read-only by every
//! concurrent mapping operation. Nothing in here is mutated after loading.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors raised while loading grammar or symbol-table sources.
#[derive(Debug, Error, PartialEq)]
pub enum GrammarError {
    #[error("grammar source contains no rules")]
    Empty,
    #[error("line {line}: expected `<rule> ::= ...`, found {found:?}")]
    MalformedRule { line: usize, found: String },
    #[error("line {line}: unterminated non-terminal reference")]
    UnterminatedNonTerminal { line: usize },
    #[error("line {line}: unterminated quoted terminal")]
    UnterminatedQuote { line: usize },
    #[error("line {line}: unterminated attribute code block")]
    UnterminatedBlock { line: usize },
    #[error("rule {rule} references undefined non-terminal {symbol}")]
    UndefinedNonTerminal { rule: String, symbol: String },
    #[error("symbol table block is missing its non-terminal header")]
    MissingHeader,
    #[error("symbol table entry {line:?} is not `name, type, default`")]
    MalformedAttribute { line: String },
    #[error("unknown attribute type {ty:?} for attribute {attr}")]
    UnknownAttrType { ty: String, attr: String },
    #[error("default {value:?} does not parse as {ty}")]
    BadDefault { value: String, ty: AttrType },
}

/// Runtime value carried by grammar attributes.
///
/// Declared defaults come from the symbol table; evaluated values are written
/// back by the attribute evaluator. `Nil` marks a slot that has never been
/// assigned.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub enum Value {
    #[default]
    Nil,
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
}

impl Value {
    /// Truthiness used by the attribute statement language: `Nil`, zero and
    /// the empty string are false.
    #[must_use]
    pub fn truthy(&self) -> bool {
        match self {
            Self::Nil => false,
            Self::Int(v) => *v != 0,
            Self::Float(v) => *v != 0.0,
            Self::Bool(v) => *v,
            Self::Str(v) => !v.is_empty(),
        }
    }

    /// Numeric view, promoting integers.
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            _ => None,
        }
    }

    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Nil => "nil",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Bool(_) => "bool",
            Self::Str(_) => "str",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nil => write!(f, "nil"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Str(v) => write!(f, "{v}"),
        }
    }
}

/// Declared type of an attribute in the symbol table.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AttrType {
    Int,
    Float,
    Bool,
    Str,
}

impl AttrType {
    fn parse(text: &str, attr: &str) -> Result<Self, GrammarError> {
        match text {
            "int" => Ok(Self::Int),
            "float" => Ok(Self::Float),
            "bool" => Ok(Self::Bool),
            "str" | "string" => Ok(Self::Str),
            other => Err(GrammarError::UnknownAttrType {
                ty: other.to_string(),
                attr: attr.to_string(),
            }),
        }
    }

    fn parse_default(self, text: &str) -> Result<Value, GrammarError> {
        let bad = || GrammarError::BadDefault {
            value: text.to_string(),
            ty: self,
        };
        match self {
            Self::Int => text.parse().map(Value::Int).map_err(|_| bad()),
            Self::Float => text.parse().map(Value::Float).map_err(|_| bad()),
            Self::Bool => text.parse().map(Value::Bool).map_err(|_| bad()),
            Self::Str => Ok(Value::Str(text.trim_matches(['\'', '"']).to_string())),
        }
    }
}

impl fmt::Display for AttrType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Int => "int",
            Self::Float => "float",
            Self::Bool => "bool",
            Self::Str => "str",
        };
        write!(f, "{name}")
    }
}

/// One attribute declaration from the symbol table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AttrDecl {
    pub ty: AttrType,
    pub default: Value,
}

/// Per-non-terminal attribute declarations, keyed by attribute name.
pub type AttrDecls = IndexMap<String, AttrDecl>;

/// Symbol table mapping non-terminal names to their attribute declarations.
pub type SymbolTable = IndexMap<String, AttrDecls>;

/// Whether a symbol reference expands further or emits phenotype text.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SymbolKind {
    Terminal,
    NonTerminal,
}

/// One symbol reference on the right-hand side of a production.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Symbol {
    pub name: String,
    pub kind: SymbolKind,
}

impl Symbol {
    #[must_use]
    pub fn terminal(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: SymbolKind::Terminal,
        }
    }

    #[must_use]
    pub fn non_terminal(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: SymbolKind::NonTerminal,
        }
    }

    #[must_use]
    pub fn is_non_terminal(&self) -> bool {
        self.kind == SymbolKind::NonTerminal
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// One right-hand-side alternative of a rule.
///
/// `attr_code` holds the interior of the production's `{ ... }` block with
/// the delimiting braces already stripped, or `None` when the production
/// carries no attribute code.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Production {
    pub symbols: Vec<Symbol>,
    pub attr_code: Option<String>,
}

impl Production {
    #[must_use]
    pub fn new(symbols: Vec<Symbol>) -> Self {
        Self {
            symbols,
            attr_code: None,
        }
    }
}

/// All alternatives for one non-terminal, plus its declared attributes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Rule {
    pub choices: Vec<Production>,
    pub attributes: AttrDecls,
}

impl Rule {
    /// Number of production alternatives; always >= 1 for loaded grammars.
    #[must_use]
    pub fn no_choices(&self) -> usize {
        self.choices.len()
    }
}

/// Immutable context-free (optionally attributed) grammar.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Grammar {
    pub start: String,
    pub rules: IndexMap<String, Rule>,
}

impl Grammar {
    /// Parse BNF text into a grammar.
    ///
    /// The first rule becomes the start symbol. Rule bodies may span lines;
    /// a line introduces a new rule iff it contains `::=`. `#` lines are
    /// comments. Alternatives are split on top-level `|`; an alternative may
    /// end with a brace-delimited attribute code block.
    pub fn parse_bnf(source: &str) -> Result<Self, GrammarError> {
        let mut rules: IndexMap<String, Rule> = IndexMap::new();
        let mut start: Option<String> = None;
        let mut current: Option<(String, String, usize)> = None;

        let mut flush =
            |current: &mut Option<(String, String, usize)>,
             rules: &mut IndexMap<String, Rule>|
             -> Result<(), GrammarError> {
                if let Some((lhs, body, at)) = current.take() {
                    let choices = parse_alternatives(&body, at)?;
                    rules.insert(
                        lhs,
                        Rule {
                            choices,
                            attributes: AttrDecls::new(),
                        },
                    );
                }
                Ok(())
            };

        for (idx, raw_line) in source.lines().enumerate() {
            let trimmed = raw_line.trim();
            if trimmed.starts_with('#') {
                continue;
            }
            if let Some(pos) = raw_line.find("::=") {
                flush(&mut current, &mut rules)?;
                let lhs = raw_line[..pos].trim();
                if !(lhs.starts_with('<') && lhs.ends_with('>') && lhs.len() > 2) {
                    return Err(GrammarError::MalformedRule {
                        line: idx + 1,
                        found: lhs.to_string(),
                    });
                }
                if start.is_none() {
                    start = Some(lhs.to_string());
                }
                current = Some((lhs.to_string(), raw_line[pos + 3..].to_string(), idx + 1));
            } else if let Some((_, body, _)) = current.as_mut() {
                body.push('\n');
                body.push_str(raw_line);
            } else if !trimmed.is_empty() {
                return Err(GrammarError::MalformedRule {
                    line: idx + 1,
                    found: trimmed.to_string(),
                });
            }
        }
        flush(&mut current, &mut rules)?;

        let start = start.ok_or(GrammarError::Empty)?;
        let grammar = Self { start, rules };
        grammar.validate()?;
        Ok(grammar)
    }

    /// Parse a symbol-table source: blocks separated by `---` lines, each
    /// block headed by a non-terminal name followed by
    /// `name, type, default` attribute lines.
    pub fn parse_symbol_table(source: &str) -> Result<SymbolTable, GrammarError> {
        let mut table = SymbolTable::new();
        for block in source.split("---") {
            let mut lines = block.lines().map(str::trim).filter(|l| !l.is_empty());
            let Some(header) = lines.next() else {
                continue;
            };
            if !(header.starts_with('<') && header.ends_with('>')) {
                return Err(GrammarError::MissingHeader);
            }
            let mut decls = AttrDecls::new();
            for line in lines {
                let mut parts = line.splitn(3, ',').map(str::trim);
                let (Some(name), Some(ty), Some(default)) =
                    (parts.next(), parts.next(), parts.next())
                else {
                    return Err(GrammarError::MalformedAttribute {
                        line: line.to_string(),
                    });
                };
                let ty = AttrType::parse(ty, name)?;
                let default = ty.parse_default(default)?;
                decls.insert(name.to_string(), AttrDecl { ty, default });
            }
            table.insert(header.to_string(), decls);
        }
        Ok(table)
    }

    /// Attach symbol-table declarations to the matching rules. Entries for
    /// non-terminals absent from the grammar are ignored.
    pub fn attach_symbols(&mut self, table: SymbolTable) {
        for (name, decls) in table {
            if let Some(rule) = self.rules.get_mut(&name) {
                rule.attributes = decls;
            }
        }
    }

    /// Check that every non-terminal referenced by a production has a rule.
    pub fn validate(&self) -> Result<(), GrammarError> {
        if self.rules.is_empty() {
            return Err(GrammarError::Empty);
        }
        for (lhs, rule) in &self.rules {
            for production in &rule.choices {
                for symbol in &production.symbols {
                    if symbol.is_non_terminal() && !self.rules.contains_key(&symbol.name) {
                        return Err(GrammarError::UndefinedNonTerminal {
                            rule: lhs.clone(),
                            symbol: symbol.name.clone(),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn rule(&self, name: &str) -> Option<&Rule> {
        self.rules.get(name)
    }

    #[must_use]
    pub fn is_non_terminal(&self, name: &str) -> bool {
        self.rules.contains_key(name)
    }

    /// Declared attribute set for a non-terminal, empty when undeclared.
    #[must_use]
    pub fn declared_attributes(&self, name: &str) -> Option<&AttrDecls> {
        self.rules.get(name).map(|rule| &rule.attributes)
    }

    /// True when any production carries an attribute code block.
    #[must_use]
    pub fn has_attribute_code(&self) -> bool {
        self.rules
            .values()
            .flat_map(|rule| &rule.choices)
            .any(|production| production.attr_code.is_some())
    }
}

/// Split a rule body on top-level `|`, then parse each alternative.
fn parse_alternatives(body: &str, line: usize) -> Result<Vec<Production>, GrammarError> {
    let mut alternatives = Vec::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut piece = String::new();

    for ch in body.chars() {
        match ch {
            '\'' | '"' if depth == 0 => match quote {
                None => quote = Some(ch),
                Some(open) if open == ch => quote = None,
                Some(_) => {}
            },
            '{' if quote.is_none() => depth += 1,
            '}' if quote.is_none() => depth = depth.saturating_sub(1),
            '|' if depth == 0 && quote.is_none() => {
                alternatives.push(std::mem::take(&mut piece));
                continue;
            }
            _ => {}
        }
        piece.push(ch);
    }
    alternatives.push(piece);

    alternatives
        .iter()
        .map(|alt| parse_production(alt, line))
        .collect()
}

/// Parse one production alternative into its symbol sequence and optional
/// attribute code block. Whitespace between symbols is preserved as terminal
/// text only when the run also contains printable characters.
fn parse_production(text: &str, line: usize) -> Result<Production, GrammarError> {
    let text = text.trim();
    let mut symbols = Vec::new();
    let mut attr_code = None;
    let mut bare = String::new();
    let mut chars = text.chars();

    let mut flush_bare = |bare: &mut String, symbols: &mut Vec<Symbol>, trim_end: bool| {
        if trim_end {
            let trimmed = bare.trim_end().to_string();
            bare.clear();
            bare.push_str(&trimmed);
        }
        if !bare.trim().is_empty() {
            symbols.push(Symbol::terminal(std::mem::take(bare)));
        } else {
            bare.clear();
        }
    };

    while let Some(ch) = chars.next() {
        match ch {
            '<' => {
                flush_bare(&mut bare, &mut symbols, false);
                let mut name = String::from('<');
                let mut closed = false;
                for inner in chars.by_ref() {
                    name.push(inner);
                    if inner == '>' {
                        closed = true;
                        break;
                    }
                }
                if !closed {
                    return Err(GrammarError::UnterminatedNonTerminal { line });
                }
                symbols.push(Symbol::non_terminal(name));
            }
            '\'' | '"' => {
                flush_bare(&mut bare, &mut symbols, false);
                let mut literal = String::new();
                let mut closed = false;
                for inner in chars.by_ref() {
                    if inner == ch {
                        closed = true;
                        break;
                    }
                    literal.push(inner);
                }
                if !closed {
                    return Err(GrammarError::UnterminatedQuote { line });
                }
                symbols.push(Symbol::terminal(literal));
            }
            '{' => {
                flush_bare(&mut bare, &mut symbols, true);
                let mut depth = 1usize;
                let mut block = String::new();
                let mut closed = false;
                for inner in chars.by_ref() {
                    match inner {
                        '{' => depth += 1,
                        '}' => {
                            depth -= 1;
                            if depth == 0 {
                                closed = true;
                                break;
                            }
                        }
                        _ => {}
                    }
                    block.push(inner);
                }
                if !closed {
                    return Err(GrammarError::UnterminatedBlock { line });
                }
                attr_code = Some(block.trim().to_string());
            }
            other => bare.push(other),
        }
    }
    flush_bare(&mut bare, &mut symbols, true);

    Ok(Production {
        symbols,
        attr_code,
    })
}
