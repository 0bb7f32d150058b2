//! The attribute tree shadowing a mapped derivation tree.
//!
//! Attribute records are stored in a slotmap arena; a production's RHS
//! occurrence and the child node's LHS occurrence share one record key, so
//! inherited writes made by the parent are visible when the child runs and
//! synthesized child results are visible to the parent afterwards. No
//! child-to-parent pointers exist anywhere.

use crate::alias::occurrence_aliases;
use crate::expr::{self, AssignOp, BinaryOp, Expr, Marker, Statement, StatementKind};
use crate::{AttrError, EvalErrorKind};
use grammarbots_grammar::{AttrDecls, Grammar, Value};
use grammarbots_mapper::DerivationTree;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use slotmap::{SlotMap, new_key_type};
use std::collections::HashMap;
use tracing::{trace, warn};

new_key_type! {
    /// Handle to an attribute record, shared between the occurrence in the
    /// parent's production and the child node it expands into.
    pub struct RecordId;
}

/// Attribute slots of one non-terminal occurrence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AttrRecord {
    pub name: String,
    pub attributes: IndexMap<String, Value>,
}

/// Whether an attribute flows up from children or down from the parent.
/// Inferred once per (symbol, attribute) pair and then stable for the run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Direction {
    Synthesized,
    Inherited,
}

#[derive(Debug, Clone)]
struct CodeNode {
    lhs: RecordId,
    symbol: String,
    aliases: IndexMap<String, RecordId>,
    lines: Vec<Statement>,
    children: Vec<usize>,
    invalid: bool,
}

/// Compiled attribute tree over one derivation tree. Exclusively owned by
/// its mapping call; cloning yields a fully independent copy, records and
/// compiled statements included.
#[derive(Debug, Clone)]
pub struct CodeTree {
    records: SlotMap<RecordId, AttrRecord>,
    nodes: Vec<CodeNode>,
    directions: HashMap<(String, String), Direction>,
    invalid: bool,
}

impl CodeTree {
    /// Build the code tree for a mapped derivation tree: create shared
    /// attribute records, resolve occurrence aliases, compile every code
    /// line, and infer attribute directions.
    ///
    /// Non-terminals without declared attributes are treated like terminals:
    /// they get no records, no aliases and are never recursed into.
    pub fn build(tree: &DerivationTree, grammar: &Grammar) -> Result<Self, AttrError> {
        let declared = grammar
            .declared_attributes(&tree.symbol.name)
            .filter(|decls| !decls.is_empty())
            .ok_or_else(|| AttrError::UndeclaredRoot {
                symbol: tree.symbol.name.clone(),
            })?;

        let mut code_tree = Self {
            records: SlotMap::with_key(),
            nodes: Vec::new(),
            directions: HashMap::new(),
            invalid: false,
        };
        let root = code_tree.new_record(&tree.symbol.name, declared);
        code_tree.build_node(tree, root, grammar)?;

        // Nodes are stored in pre-order, so a plain sweep classifies parents
        // before their children, matching the consult-the-child fallback.
        for index in 0..code_tree.nodes.len() {
            code_tree.infer_node(index);
        }
        Ok(code_tree)
    }

    fn new_record(&mut self, name: &str, decls: &AttrDecls) -> RecordId {
        let attributes = decls
            .iter()
            .map(|(attr, decl)| (attr.clone(), decl.default.clone()))
            .collect();
        self.records.insert(AttrRecord {
            name: name.to_string(),
            attributes,
        })
    }

    fn build_node(
        &mut self,
        tree: &DerivationTree,
        lhs: RecordId,
        grammar: &Grammar,
    ) -> Result<usize, AttrError> {
        let mut rhs: Vec<(usize, RecordId)> = Vec::new();
        for (position, child) in tree.children.iter().enumerate() {
            if !child.symbol.is_non_terminal() {
                continue;
            }
            if let Some(decls) = grammar
                .declared_attributes(&child.symbol.name)
                .filter(|decls| !decls.is_empty())
            {
                let record = self.new_record(&child.symbol.name, decls);
                rhs.push((position, record));
            }
        }

        let mut aliases = IndexMap::new();
        if tree.raw_code.is_some() {
            let mut names: Vec<&str> = vec![tree.symbol.name.as_str()];
            names.extend(
                rhs.iter()
                    .map(|&(position, _)| tree.children[position].symbol.name.as_str()),
            );
            let mut records = vec![lhs];
            records.extend(rhs.iter().map(|&(_, record)| record));
            for (alias, record) in occurrence_aliases(&names).into_iter().zip(records) {
                aliases.insert(alias, record);
            }
        }

        let mut lines = Vec::new();
        if let Some(code) = &tree.raw_code {
            for line in code.lines() {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                lines.push(expr::parse_statement(line)?);
            }
        }

        let index = self.nodes.len();
        self.nodes.push(CodeNode {
            lhs,
            symbol: tree.symbol.name.clone(),
            aliases,
            lines,
            children: Vec::new(),
            invalid: false,
        });

        let mut children = Vec::new();
        for (position, record) in rhs {
            children.push(self.build_node(&tree.children[position], record, grammar)?);
        }
        self.nodes[index].children = children;
        Ok(index)
    }

    /// Classify the first reference of each line. An LHS target is
    /// synthesized; anything else is inherited, except that a constant
    /// assignment into a child occurrence first defers to the child's own
    /// productions before defaulting. Classifications are write-once.
    fn infer_node(&mut self, index: usize) {
        for line_index in 0..self.nodes[index].lines.len() {
            let Some(target) = self.nodes[index].lines[line_index].target().cloned() else {
                continue;
            };
            let Some(&record) = self.nodes[index].aliases.get(&target.alias) else {
                continue;
            };
            let key = (self.records[record].name.clone(), target.attr.clone());
            if self.directions.contains_key(&key) {
                continue;
            }
            if record == self.nodes[index].lhs {
                self.directions.insert(key, Direction::Synthesized);
                continue;
            }

            let line = &self.nodes[index].lines[line_index];
            let consult = match line.after_target() {
                // `= <occurrence>.attr` marks a plain downward hand-off;
                // `= constant` defers to the child's classification first.
                Some("=") => !line.pulls_through(),
                Some(text) => text.contains('='),
                None => false,
            };
            if consult {
                if let Some(child) = self.child_by_symbol(index, &key.0) {
                    self.infer_node(child);
                }
            }
            self.directions.entry(key).or_insert(Direction::Inherited);
        }
    }

    fn child_by_symbol(&self, index: usize, symbol: &str) -> Option<usize> {
        self.nodes[index]
            .children
            .iter()
            .copied()
            .find(|&child| self.nodes[child].symbol == symbol)
    }

    /// Execute the whole tree in dependency order and return the validity
    /// verdict (also retained on the tree, see [`CodeTree::invalid`]).
    pub fn run(&mut self) -> Result<bool, AttrError> {
        self.run_node(0)?;
        self.invalid = self.aggregate(0);
        Ok(self.invalid)
    }

    fn run_node(&mut self, index: usize) -> Result<(), AttrError> {
        if self.nodes[index].lines.is_empty() {
            // Leafs and code-less productions short-circuit; their children
            // only run when some ancestor line requires them.
            return Ok(());
        }

        let mut run_children = false;
        let mut children_ran = false;

        for line_index in 0..self.nodes[index].lines.len() {
            let line = self.nodes[index].lines[line_index].clone();
            let Some(target) = line.target() else {
                // A line without references (a bare marker call) has only
                // side effects; evaluate it immediately.
                self.eval_statement(index, &line)?;
                continue;
            };
            let Some(&record) = self.nodes[index].aliases.get(&target.alias) else {
                return Err(AttrError::Eval {
                    line: line.source.clone(),
                    kind: EvalErrorKind::UnknownAlias {
                        alias: target.alias.clone(),
                    },
                });
            };
            let key = (self.records[record].name.clone(), target.attr.clone());

            match self.directions.get(&key).copied() {
                None => {
                    trace!(line = %line.source, "skipping line with undetermined direction");
                }
                Some(Direction::Inherited) => {
                    self.eval_statement(index, &line)?;
                    run_children = true;
                }
                Some(Direction::Synthesized) => {
                    if line.pulls_through() {
                        // Pure pull-through of child values: children first,
                        // at most once per node.
                        if !children_ran {
                            children_ran = true;
                            let children = self.nodes[index].children.clone();
                            for child in children {
                                self.run_node(child)?;
                            }
                        }
                        self.eval_statement(index, &line)?;
                    } else {
                        self.eval_statement(index, &line)?;
                        run_children = true;
                    }
                }
            }
        }

        if run_children && !children_ran {
            let children = self.nodes[index].children.clone();
            for child in children {
                self.run_node(child)?;
            }
        }
        Ok(())
    }

    fn eval_statement(&mut self, index: usize, line: &Statement) -> Result<(), AttrError> {
        let wrap = |kind| AttrError::Eval {
            line: line.source.clone(),
            kind,
        };

        match &line.kind {
            StatementKind::Assign { target, op, rhs } => {
                let value = self.eval_expr(index, rhs).map_err(wrap)?;
                let record = *self
                    .nodes[index]
                    .aliases
                    .get(&target.alias)
                    .ok_or_else(|| {
                        wrap(EvalErrorKind::UnknownAlias {
                            alias: target.alias.clone(),
                        })
                    })?;
                let symbol = self.records[record].name.clone();
                let slot = self.records[record]
                    .attributes
                    .get_mut(&target.attr)
                    .ok_or_else(|| {
                        wrap(EvalErrorKind::UnknownAttribute {
                            symbol: symbol.clone(),
                            attr: target.attr.clone(),
                        })
                    })?;
                let next = match op {
                    AssignOp::Set => value,
                    AssignOp::Add => expr::binary_value(BinaryOp::Add, slot, &value).map_err(wrap)?,
                    AssignOp::Sub => expr::binary_value(BinaryOp::Sub, slot, &value).map_err(wrap)?,
                    AssignOp::Mul => expr::binary_value(BinaryOp::Mul, slot, &value).map_err(wrap)?,
                    AssignOp::Div => expr::binary_value(BinaryOp::Div, slot, &value).map_err(wrap)?,
                };
                let slot = self.records[record]
                    .attributes
                    .get_mut(&target.attr)
                    .expect("slot existence checked above");
                *slot = next;
            }
            StatementKind::Expr(expression) => {
                self.eval_expr(index, expression).map_err(wrap)?;
            }
        }
        Ok(())
    }

    fn eval_expr(&mut self, index: usize, expression: &Expr) -> Result<Value, EvalErrorKind> {
        match expression {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Ref(reference) => {
                let record = *self
                    .nodes[index]
                    .aliases
                    .get(&reference.alias)
                    .ok_or_else(|| EvalErrorKind::UnknownAlias {
                        alias: reference.alias.clone(),
                    })?;
                let entry = &self.records[record];
                entry
                    .attributes
                    .get(&reference.attr)
                    .cloned()
                    .ok_or_else(|| EvalErrorKind::UnknownAttribute {
                        symbol: entry.name.clone(),
                        attr: reference.attr.clone(),
                    })
            }
            Expr::Call(Marker::Ok) => Ok(Value::Nil),
            Expr::Call(Marker::Error) => {
                // A raised error is sticky; nothing ever clears it.
                self.nodes[index].invalid = true;
                trace!(symbol = %self.nodes[index].symbol, "error() raised");
                Ok(Value::Nil)
            }
            Expr::Unary { op, operand } => {
                let value = self.eval_expr(index, operand)?;
                expr::unary_value(*op, &value)
            }
            Expr::Binary {
                op: BinaryOp::And,
                left,
                right,
            } => {
                let lhs = self.eval_expr(index, left)?;
                if lhs.truthy() {
                    self.eval_expr(index, right)
                } else {
                    Ok(lhs)
                }
            }
            Expr::Binary {
                op: BinaryOp::Or,
                left,
                right,
            } => {
                let lhs = self.eval_expr(index, left)?;
                if lhs.truthy() {
                    Ok(lhs)
                } else {
                    self.eval_expr(index, right)
                }
            }
            Expr::Binary { op, left, right } => {
                let lhs = self.eval_expr(index, left)?;
                let rhs = self.eval_expr(index, right)?;
                expr::binary_value(*op, &lhs, &rhs)
            }
        }
    }

    fn aggregate(&self, index: usize) -> bool {
        let node = &self.nodes[index];
        node.children
            .iter()
            .fold(node.invalid, |acc, &child| acc | self.aggregate(child))
    }

    /// Tree-wide verdict computed by [`CodeTree::run`].
    #[must_use]
    pub fn invalid(&self) -> bool {
        self.invalid
    }

    /// Attribute record behind an alias of the root production, the surface
    /// fitness functions read evaluated values from.
    #[must_use]
    pub fn root_alias(&self, alias: &str) -> Option<&AttrRecord> {
        self.nodes
            .first()
            .and_then(|root| root.aliases.get(alias))
            .map(|&record| &self.records[record])
    }

    /// Evaluated value of `alias.attr` at the root production.
    #[must_use]
    pub fn attribute(&self, alias: &str, attr: &str) -> Option<&Value> {
        self.root_alias(alias)
            .and_then(|record| record.attributes.get(attr))
    }

    /// Inferred direction for a (symbol, attribute) pair, if any line
    /// classified it.
    #[must_use]
    pub fn direction(&self, symbol: &str, attr: &str) -> Option<Direction> {
        self.directions
            .get(&(symbol.to_string(), attr.to_string()))
            .copied()
    }
}

/// Build and execute the code tree for `tree`, stamping the verdict on the
/// derivation tree root. Returns the evaluated tree for value readers.
pub fn evaluate(tree: &mut DerivationTree, grammar: &Grammar) -> Result<CodeTree, AttrError> {
    let mut code_tree = CodeTree::build(tree, grammar)?;
    match code_tree.run() {
        Ok(invalid) => {
            tree.invalid = invalid;
            Ok(code_tree)
        }
        Err(error) => {
            warn!(%error, "attribute evaluation failed");
            Err(error)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use grammarbots_mapper::{Genome, MapLimits, map_tree};

    fn attributed_grammar(bnf: &str, symbols: &str) -> Grammar {
        let mut grammar = Grammar::parse_bnf(bnf).expect("grammar should parse");
        let table = Grammar::parse_symbol_table(symbols).expect("table should parse");
        grammar.attach_symbols(table);
        grammar
    }

    fn mapped_tree(grammar: &Grammar, codons: Vec<u32>) -> DerivationTree {
        let outcome = map_tree(
            &Genome::new(codons),
            grammar,
            &MapLimits::with_wraps(0).unbounded_depth(),
        );
        assert!(!outcome.is_invalid(), "test mapping must be structurally valid");
        outcome.tree.expect("tree variant builds a tree")
    }

    #[test]
    fn synthesized_sum_recurses_into_children_first() {
        let grammar = attributed_grammar(
            "<S> ::= <A><B> { <S>.v = <A>.v + <B>.v }\n<A> ::= a { <A>.v = 1 }\n<B> ::= b { <B>.v = 2 }",
            "<S>\nv, int, 0\n---\n<A>\nv, int, 0\n---\n<B>\nv, int, 0",
        );
        let mut tree = mapped_tree(&grammar, vec![0, 0, 0]);
        let code_tree = evaluate(&mut tree, &grammar).expect("evaluation should succeed");

        assert!(!code_tree.invalid());
        assert!(!tree.invalid);
        assert_eq!(code_tree.direction("<S>", "v"), Some(Direction::Synthesized));
        assert_eq!(code_tree.attribute("<S>", "v"), Some(&Value::Int(3)));
        assert_eq!(code_tree.attribute("<A>", "v"), Some(&Value::Int(1)));
        assert_eq!(code_tree.attribute("<B>", "v"), Some(&Value::Int(2)));
    }

    #[test]
    fn self_recursive_production_writes_the_rhs_occurrence() {
        let grammar = attributed_grammar(
            "<S> ::= <S><A> { <S_2>.v = 10 } | a\n<A> ::= b",
            "<S>\nv, int, 0",
        );
        // Root picks the recursive production, inner <S> terminates.
        let mut tree = mapped_tree(&grammar, vec![0, 1, 0]);
        let code_tree = evaluate(&mut tree, &grammar).expect("evaluation should succeed");

        let rhs = code_tree.root_alias("<S_2>").expect("alias should resolve");
        assert_eq!(rhs.attributes["v"], Value::Int(10));
        let lhs = code_tree.root_alias("<S_1>").expect("alias should resolve");
        assert_eq!(lhs.attributes["v"], Value::Int(0));
        // <A> declares no attributes, so it never takes part in aliasing.
        assert!(code_tree.root_alias("<A>").is_none());
    }

    #[test]
    fn error_marker_is_sticky() {
        let grammar = attributed_grammar(
            "<S> ::= a { <S>.v = 1\n<S>.v > 5 or error()\n<S>.v > 0 and ok() }",
            "<S>\nv, int, 0",
        );
        let mut tree = mapped_tree(&grammar, vec![0]);
        let code_tree = evaluate(&mut tree, &grammar).expect("evaluation should succeed");
        assert!(code_tree.invalid());
        assert!(tree.invalid);
    }

    #[test]
    fn ok_marker_has_no_validity_effect() {
        let grammar = attributed_grammar(
            "<S> ::= a { <S>.v = 1\n<S>.v > 0 and ok() }",
            "<S>\nv, int, 0",
        );
        let mut tree = mapped_tree(&grammar, vec![0]);
        let code_tree = evaluate(&mut tree, &grammar).expect("evaluation should succeed");
        assert!(!code_tree.invalid());
    }

    #[test]
    fn descendant_error_reaches_the_root_verdict() {
        let grammar = attributed_grammar(
            "<S> ::= <A> { <S>.v = <A>.v }\n<A> ::= a { <A>.v = 1\nerror() }",
            "<S>\nv, int, 0\n---\n<A>\nv, int, 0",
        );
        let mut tree = mapped_tree(&grammar, vec![0, 0]);
        let code_tree = evaluate(&mut tree, &grammar).expect("evaluation should succeed");
        assert!(code_tree.invalid());
        assert!(tree.invalid);
    }

    #[test]
    fn unknown_attribute_surfaces_the_offending_line() {
        let grammar = attributed_grammar(
            "<S> ::= a { <S>.missing = 1 }",
            "<S>\nv, int, 0",
        );
        let mut tree = mapped_tree(&grammar, vec![0]);
        let err = evaluate(&mut tree, &grammar).expect_err("evaluation should fail");
        let AttrError::Eval { line, kind } = err else {
            panic!("expected an eval error");
        };
        assert_eq!(line, "<S>.missing = 1");
        assert!(matches!(kind, EvalErrorKind::UnknownAttribute { .. }));
    }

    #[test]
    fn undeclared_root_is_rejected() {
        let grammar = attributed_grammar("<S> ::= a", "<X>\nv, int, 0");
        let mut tree = mapped_tree(&grammar, vec![0]);
        let err = evaluate(&mut tree, &grammar).expect_err("evaluation should fail");
        assert_eq!(
            err,
            AttrError::UndeclaredRoot {
                symbol: "<S>".to_string(),
            }
        );
    }

    #[test]
    fn cloned_code_tree_is_independent() {
        let grammar = attributed_grammar(
            "<S> ::= a { <S>.v = 7 }",
            "<S>\nv, int, 0",
        );
        let tree = mapped_tree(&grammar, vec![0]);
        let pristine = CodeTree::build(&tree, &grammar).expect("build should succeed");
        let mut copy = pristine.clone();
        copy.run().expect("run should succeed");
        assert_eq!(copy.attribute("<S>", "v"), Some(&Value::Int(7)));
        assert_eq!(pristine.attribute("<S>", "v"), Some(&Value::Int(0)));
    }
}
